//! 时钟抽象
//!
//! 熔断器的冷却窗口、重连节流的最小间隔都依赖"当前时间"。
//! 通过注入 `Clock` 而不是直接调用 `Instant::now()`，测试可以用
//! `ManualClock` 精确推进时间，无需真实等待。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 单调时钟
pub trait Clock: Send + Sync + fmt::Debug {
    /// 返回当前单调时间点
    fn now(&self) -> Instant;
}

/// 生产环境使用的系统单调时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 跟随 tokio 运行时时间的时钟
///
/// 正常运行时与系统单调时钟一致；在暂停时间的测试中随
/// `tokio::time::advance` 或自动推进而前进，与退避等待使用同一条时间线。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// 手动推进的时钟，仅在显式调用 `advance` 时前进
///
/// 克隆后共享同一时间线，便于在被测组件和测试代码之间同时持有。
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// 将时钟向前推进 `by`
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

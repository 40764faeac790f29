//! 熔断器 (Circuit Breaker) 模块
//!
//! 实现标准的三态熔断器模式，用于保护对消息 broker 的重连。
//! 当连续的连通性失败达到阈值时断路器跳闸（Open），冷却窗口到期后
//! 放行探测请求（Half-Open），探测成功则恢复（Closed），否则重新跳闸。
//!
//! ## 设计决策
//!
//! - 只有连通性类错误（broker 不可达、传输层故障）计入失败次数，
//!   其他错误由调用方上报但不推动熔断器，见 [`TripsBreaker`]
//! - 时间来源通过 [`Clock`] 注入，测试中可用手动时钟精确推进冷却窗口
//! - 状态变迁在 Mutex 内完成，保证多个消费循环并发上报时计数一致
//! - 内置 Prometheus 指标上报

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 正常放行所有请求
    Closed,
    /// 断路器跳闸，拒绝所有请求
    Open,
    /// 冷却窗口已过，放行探测请求
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 判断一个错误是否应当计入熔断器的失败次数
pub trait TripsBreaker {
    fn trips_breaker(&self) -> bool;
}

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后跳闸（默认 3）
    pub failure_threshold: u32,
    /// 跳闸后多久进入半开状态（默认 60 秒）
    pub cool_down: Duration,
    /// 熔断器名称，用于日志和指标区分不同的依赖
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(60),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }
}

/// 熔断器内部状态，受 Mutex 保护
struct InnerState {
    state: CircuitState,
    /// Closed→Open 转换依据
    consecutive_failures: u32,
    /// Open→HalfOpen 计时起点
    opened_at: Option<Instant>,
}

/// 熔断器
///
/// 线程安全，可在多个任务间通过 Clone 共享（内部为 Arc）。
/// 典型用法：
/// ```ignore
/// let cb = CircuitBreaker::new(config);
/// if cb.allow_attempt() {
///     match connect().await {
///         Ok(conn) => { cb.record_success(); conn }
///         Err(e)   => { cb.record_failure(&e); return Err(e) }
///     }
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            cool_down_ms = config.cool_down.as_millis() as u64,
            "熔断器已创建"
        );

        Self {
            config,
            clock,
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 获取当前状态（用于监控和日志）
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        // Open 状态需要检查是否该转为 HalfOpen
        if inner.state == CircuitState::Open && self.cool_down_elapsed(&inner) {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    /// 当前连续失败次数
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// 判断是否允许发起尝试
    ///
    /// Closed：始终允许
    /// Open：冷却窗口到期则转为 HalfOpen 并允许，否则拒绝
    /// HalfOpen：允许探测
    pub fn allow_attempt(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.cool_down_elapsed(&inner) {
                    self.transition_to(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// 记录成功：任何状态下都清零失败计数并闭合
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        if inner.state != CircuitState::Closed {
            self.transition_to(&mut inner, CircuitState::Closed);
        }
    }

    /// 记录失败
    ///
    /// 只有 `trips_breaker()` 为 true 的错误才计数，返回值表示是否被计入。
    pub fn record_failure<E: TripsBreaker + ?Sized>(&self, err: &E) -> bool {
        if !err.trips_breaker() {
            return false;
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // 半开探测失败，立即重新跳闸并重新计时
                inner.opened_at = Some(now);
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                // 已经跳闸，冷却窗口保持从跳闸时刻起算
            }
        }
        true
    }

    /// 执行受熔断器保护的异步调用
    ///
    /// 如果熔断器跳闸则返回 Err，否则执行 f 并根据结果更新熔断器状态。
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: TripsBreaker,
    {
        if !self.allow_attempt() {
            record_circuit_breaker_rejection(&self.config.name);
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(CircuitBreakerError::ServiceError(e))
            }
        }
    }

    fn cool_down_elapsed(&self, inner: &InnerState) -> bool {
        match inner.opened_at {
            Some(opened_at) => {
                self.clock.now().saturating_duration_since(opened_at) >= self.config.cool_down
            }
            None => false,
        }
    }

    /// 状态转换（在锁内调用）
    fn transition_to(&self, inner: &mut InnerState, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        record_circuit_breaker_transition(&self.config.name, old_state, new_state);

        match new_state {
            CircuitState::Open => {
                warn!(
                    name = %self.config.name,
                    from = %old_state,
                    failures = inner.consecutive_failures,
                    "熔断器跳闸：连续失败达到阈值，冷却窗口内不再发起尝试"
                );
            }
            CircuitState::HalfOpen => {
                info!(name = %self.config.name, "熔断器进入半开状态：允许探测");
            }
            CircuitState::Closed => {
                info!(name = %self.config.name, "熔断器恢复：依赖已恢复正常");
            }
        }
    }
}

/// 熔断器错误
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// 熔断器跳闸，请求被拒绝
    Open { name: String },
    /// 底层调用失败
    ServiceError(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name } => write!(f, "熔断器 '{}' 处于跳闸状态，请求被拒绝", name),
            Self::ServiceError(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for CircuitBreakerError<E> {}

// ─── Prometheus 指标 ─────────────────────────────────────────────────

/// 记录状态转换
fn record_circuit_breaker_transition(name: &str, from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "circuit_breaker_transitions_total",
        "name" => name.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);

    let state_value = match to {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!(
        "circuit_breaker_state",
        "name" => name.to_string()
    )
    .set(state_value);
}

/// 记录请求被拒绝
fn record_circuit_breaker_rejection(name: &str) {
    metrics::counter!(
        "circuit_breaker_rejections_total",
        "name" => name.to_string()
    )
    .increment(1);
}

//! broker 连接管理
//!
//! 持有唯一的物理连接/通道，由两个消费循环共享。职责：
//! - `ensure_connected`：幂等地建立连接并声明拓扑，已连接时直接返回当前会话
//! - 每次发起连接前依次咨询重连节流与熔断器，任一拒绝都不产生任何 I/O
//! - 连接尝试在异步 Mutex 内串行执行，并发调用方观察同一次尝试的结果
//! - 消费 broker 推送的事件队列（关闭/阻塞/解除阻塞），更新连接状态并反馈给熔断器
//! - 通道被单独关闭或消费循环报告会话失效时，下一次 `ensure_connected` 重建连接

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dispatch_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use dispatch_shared::clock::Clock;
use dispatch_shared::observability::metrics;
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerChannel, BrokerClient, BrokerEvent, BrokerEventKind, ConnectionState, EventSink,
};
use crate::error::{BrokerError, ConnectError};
use crate::topology::Topology;

/// 重连节流
///
/// 独立于熔断器：即使熔断器闭合，连接不可用时两次尝试之间也至少间隔
/// `min_interval`，防止"短暂成功后立即断开"造成的重连空转。
#[derive(Debug, Clone)]
pub struct ReconnectThrottle {
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl ReconnectThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: None,
        }
    }

    /// 距下一次允许尝试还需等待的时间；`None` 表示现在即可尝试
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_attempt?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.min_interval).then(|| self.min_interval - elapsed)
    }

    pub fn mark_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }
}

/// 一次成功连接产生的会话
#[derive(Clone)]
pub struct BrokerSession {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl BrokerSession {
    /// 连接代次，每次成功建立新连接递增
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// 受 Mutex 保护、只在连接尝试中修改的部分
struct SessionSlot {
    session: Option<BrokerSession>,
    throttle: ReconnectThrottle,
    next_generation: u64,
}

/// broker 连接管理器
pub struct ConnectionManager {
    client: Arc<dyn BrokerClient>,
    topology: Topology,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    slot: Mutex<SessionSlot>,
    state_tx: watch::Sender<ConnectionState>,
    /// 最近一次成功建立的连接代次，0 表示没有
    established: AtomicU64,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
}

impl ConnectionManager {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        topology: Topology,
        breaker: CircuitBreaker,
        min_reconnect_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            client,
            topology,
            breaker,
            clock,
            slot: Mutex::new(SessionSlot {
                session: None,
                throttle: ReconnectThrottle::new(min_reconnect_interval),
                next_generation: 0,
            }),
            state_tx,
            established: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// 订阅连接状态变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 确保连接可用，返回当前会话
    ///
    /// 已连接时是无 I/O 的空操作。熔断器跳闸或重连节流生效时立即返回错误，
    /// 状态保持 `Disconnected`。连接失败会关闭半打开的资源并记入熔断器，
    /// 错误以返回值形式交给调用方，不会向上 panic。
    pub async fn ensure_connected(&self) -> Result<BrokerSession, ConnectError> {
        let mut slot = self.slot.lock().await;

        if let Some(session) = &slot.session {
            if self.current_state() == ConnectionState::Connected && session.channel.is_open() {
                return Ok(session.clone());
            }
            if !session.channel.is_open()
                && session.generation == self.established.load(Ordering::SeqCst)
            {
                // 通道被 broker 单独关闭，连接级事件不会到达
                warn!(generation = session.generation, "broker 通道已失效");
                self.established.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
            }
        }

        let now = self.clock.now();
        if let Some(retry_in) = slot.throttle.remaining(now) {
            metrics::record_connect_attempt("throttled");
            debug!(retry_in_ms = retry_in.as_millis() as u64, "重连节流中，跳过本次连接");
            return Err(ConnectError::Throttled { retry_in });
        }

        // 旧连接已失效（被关闭或阻塞），先释放再重建
        if let Some(stale) = slot.session.take() {
            if let Err(e) = stale.channel.close().await {
                debug!(generation = stale.generation, error = %e, "关闭失效连接失败");
            }
        }

        let generation = slot.next_generation + 1;
        let sink = EventSink::new(generation, self.events_tx.clone());
        let throttle = &mut slot.throttle;

        let result = self
            .breaker
            .call(|| {
                throttle.mark_attempt(now);
                self.client.connect(&self.topology, sink)
            })
            .await;

        match result {
            Ok(channel) => {
                slot.next_generation = generation;
                let session = BrokerSession {
                    generation,
                    channel,
                };
                slot.session = Some(session.clone());
                self.established.store(generation, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                metrics::record_connect_attempt("success");
                info!(generation, "broker 连接已就绪");
                Ok(session)
            }
            Err(CircuitBreakerError::Open { name }) => {
                metrics::record_connect_attempt("circuit_open");
                debug!(breaker = %name, "熔断器跳闸，跳过本次连接");
                Err(ConnectError::CircuitOpen)
            }
            Err(CircuitBreakerError::ServiceError(e)) => {
                slot.next_generation = generation;
                metrics::record_connect_attempt("failure");
                warn!(
                    generation,
                    error = %e,
                    connectivity = e.is_connectivity(),
                    failures = self.breaker.consecutive_failures(),
                    "连接 broker 失败"
                );
                Err(ConnectError::Broker(e))
            }
        }
    }

    /// 消费循环在会话上遇到致命错误时调用，标记该代次连接失效
    ///
    /// 状态翻转为 `Disconnected` 会让另一个消费循环也放弃旧订阅，
    /// 下一次 `ensure_connected` 重建连接。已被替换的代次直接忽略。
    pub fn invalidate(&self, generation: u64, err: &BrokerError) {
        if !err.invalidates_session() {
            return;
        }
        if self
            .established
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(generation, error = %err, "忽略已替换连接的失效通知");
            return;
        }

        warn!(generation, error = %err, "broker 会话失效，等待重建");
        self.set_state(ConnectionState::Disconnected);
    }

    /// 消费 broker 事件队列直到收到关闭信号
    ///
    /// 只能运行一次；事件队列被取走后再次调用直接返回。
    pub async fn run_events(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            warn!("broker 事件循环已在运行，忽略重复启动");
            return;
        };

        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for(|stop| *stop).map(|_| ()) => {
                    debug!("收到关闭信号，broker 事件循环退出");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.apply_event(event),
                        None => break,
                    }
                }
            }
        }
    }

    /// 将一条 broker 事件应用到连接状态
    ///
    /// 旧连接（代次不符）迟到的事件直接丢弃。
    pub fn apply_event(&self, event: BrokerEvent) {
        let established = self.established.load(Ordering::SeqCst);
        if event.generation != established {
            debug!(
                generation = event.generation,
                established, "忽略已替换连接的 broker 事件"
            );
            return;
        }

        match event.kind {
            BrokerEventKind::Shutdown { reason } => {
                warn!(generation = event.generation, %reason, "broker 连接已关闭");
                self.established.store(0, Ordering::SeqCst);
                self.breaker.record_failure(&BrokerError::Transport(reason));
                self.set_state(ConnectionState::Disconnected);
            }
            BrokerEventKind::Blocked { reason } => {
                warn!(generation = event.generation, %reason, "broker 连接被阻塞");
                self.breaker
                    .record_failure(&BrokerError::Transport(format!("blocked: {}", reason)));
                self.set_state(ConnectionState::Disconnected);
            }
            BrokerEventKind::Unblocked => {
                info!(generation = event.generation, "broker 连接阻塞解除");
                self.breaker.record_success();
                self.set_state(ConnectionState::Connected);
            }
        }
    }

    /// 关闭当前连接
    ///
    /// 由调度器在两个消费循环都停止后调用，避免打断进行中的 ack。
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        self.established.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);

        if let Some(session) = slot.session.take() {
            match session.channel.close().await {
                Ok(()) => info!(generation = session.generation, "broker 连接已关闭"),
                Err(e) => warn!(generation = session.generation, error = %e, "关闭 broker 连接失败"),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        metrics::set_broker_connected(state == ConnectionState::Connected);
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

//! 内存 broker
//!
//! 进程内实现的 [`BrokerClient`]，用于在没有 RabbitMQ 的环境下驱动
//! 连接管理器、消费循环和调度器的测试：
//! - 可脚本化地注入连接失败、订阅失败
//! - 可注入 ack/reject 失败
//! - 记录每次 ack/reject/publish 调用，便于断言"每条消息恰好终结一次"
//! - 可模拟 broker 主动推送的关闭、阻塞事件
//!
//! 被 reject 且 requeue 的消息只记录、不重新投递，避免永久失败的消息在测试中空转。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    BrokerChannel, BrokerClient, BrokerEventKind, DeliveryStream, DeliveryTag, Envelope, EventSink,
};
use crate::error::BrokerError;
use crate::topology::Topology;

/// 对一条消息的终结动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack(DeliveryTag),
    Reject { tag: DeliveryTag, requeue: bool },
}

impl Settlement {
    pub fn tag(&self) -> DeliveryTag {
        match self {
            Self::Ack(tag) => *tag,
            Self::Reject { tag, .. } => *tag,
        }
    }
}

/// 一次发布记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

type Subscriber = (String, mpsc::UnboundedSender<Result<Envelope, BrokerError>>);

#[derive(Default)]
struct MemoryState {
    connect_attempts: usize,
    scripted_connect_failures: VecDeque<BrokerError>,
    persistent_connect_failure: Option<BrokerError>,
    consume_failures: HashMap<String, BrokerError>,
    settle_failure: Option<BrokerError>,
    declared: Option<Topology>,
    pending: HashMap<String, VecDeque<Envelope>>,
    subscribers: HashMap<String, Subscriber>,
    next_tag: DeliveryTag,
    settlements: Vec<Settlement>,
    published: Vec<Published>,
    events: Option<EventSink>,
    closed_channels: usize,
}

/// 内存 broker，克隆后共享同一状态
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // 故障注入
    // ---------------------------------------------------------------------

    /// 下一次连接尝试失败（可多次调用排队）
    pub fn fail_next_connect(&self, err: BrokerError) {
        self.state.lock().scripted_connect_failures.push_back(err);
    }

    /// 之后的每次连接尝试都失败，直到调用 `recover`
    pub fn fail_all_connects(&self, err: BrokerError) {
        self.state.lock().persistent_connect_failure = Some(err);
    }

    pub fn recover(&self) {
        let mut state = self.state.lock();
        state.persistent_connect_failure = None;
        state.scripted_connect_failures.clear();
    }

    /// 在 `queue` 上创建消费者时返回错误，直到调用 `allow_consume`
    pub fn fail_consume(&self, queue: &str, err: BrokerError) {
        self.state.lock().consume_failures.insert(queue.to_string(), err);
    }

    pub fn allow_consume(&self, queue: &str) {
        self.state.lock().consume_failures.remove(queue);
    }

    /// 之后的 ack/reject 都返回错误，直到调用 `allow_settle`
    pub fn fail_settle(&self, err: BrokerError) {
        self.state.lock().settle_failure = Some(err);
    }

    pub fn allow_settle(&self) {
        self.state.lock().settle_failure = None;
    }

    /// 通过最近一次连接的事件出口推送 broker 事件
    pub fn emit(&self, kind: BrokerEventKind) {
        let sink = self.state.lock().events.clone();
        if let Some(sink) = sink {
            sink.emit(kind);
        }
    }

    /// 结束 `queue` 上的订阅流，模拟消费者被 broker 取消
    pub fn drop_subscription(&self, queue: &str) {
        self.state.lock().subscribers.remove(queue);
    }

    // ---------------------------------------------------------------------
    // 投递
    // ---------------------------------------------------------------------

    /// 向 `queue` 投递一条消息，返回分配的 delivery tag
    ///
    /// 尚无消费者时暂存，订阅建立后按顺序投递。
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) -> DeliveryTag {
        let mut state = self.state.lock();
        state.next_tag += 1;
        let envelope = Envelope {
            delivery_tag: state.next_tag,
            body: body.into(),
            redelivered: false,
        };
        let tag = envelope.delivery_tag;

        let undelivered = match state.subscribers.get(queue) {
            Some((_, tx)) => tx.send(Ok(envelope)).err().and_then(|e| e.0.ok()),
            None => Some(envelope),
        };
        if let Some(envelope) = undelivered {
            state.subscribers.remove(queue);
            state
                .pending
                .entry(queue.to_string())
                .or_default()
                .push_back(envelope);
        }
        tag
    }

    // ---------------------------------------------------------------------
    // 观测
    // ---------------------------------------------------------------------

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn declared_topology(&self) -> Option<Topology> {
        self.state.lock().declared.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().settlements.clone()
    }

    pub fn settled_count(&self) -> usize {
        self.state.lock().settlements.len()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn has_subscriber(&self, queue: &str) -> bool {
        self.state.lock().subscribers.contains_key(queue)
    }

    pub fn closed_channels(&self) -> usize {
        self.state.lock().closed_channels
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        topology: &Topology,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if let Some(err) = state.scripted_connect_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.persistent_connect_failure {
            return Err(err.clone());
        }

        state.declared = Some(topology.clone());
        state.events = Some(events);
        // 新连接上旧的订阅全部失效
        state.subscribers.clear();

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// 内存通道
pub struct MemoryChannel {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_settleable(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match &self.broker.state.lock().settle_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if let Some(err) = state.consume_failures.get(queue) {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(pending) = state.pending.remove(queue) {
            for envelope in pending {
                let _ = tx.send(Ok(envelope));
            }
        }
        state
            .subscribers
            .insert(queue.to_string(), (consumer_tag.to_string(), tx));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .subscribers
            .retain(|_, (tag, _)| tag != consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_settleable()?;
        self.broker
            .state
            .lock()
            .settlements
            .push(Settlement::Ack(delivery_tag));
        Ok(())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_settleable()?;
        self.broker.state.lock().settlements.push(Settlement::Reject {
            tag: delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state.lock().published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.broker.state.lock();
            state.closed_channels += 1;
            // 通道上的消费者随通道一起结束
            state.subscribers.clear();
        }
        Ok(())
    }
}

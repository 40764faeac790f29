//! 消息 broker 抽象
//!
//! 通过 `BrokerClient` / `BrokerChannel` 两个 trait 隔离具体的 AMQP 客户端，
//! 连接管理器和消费循环只依赖抽象：生产环境使用 [`amqp`]，
//! 测试使用 [`memory`] 中的内存实现。
//!
//! broker 主动推送的事件（连接关闭、流控阻塞/解除）不以回调直接修改共享状态，
//! 而是通过 [`EventSink`] 投递到连接管理器的事件队列中统一处理。

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BrokerError;
use crate::topology::Topology;

/// broker 分配的投递标识，用于 ack/reject
pub type DeliveryTag = u64;

/// 一条投递到消费者的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: DeliveryTag,
    pub body: Vec<u8>,
    /// broker 标记的重投标志
    pub redelivered: bool,
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// broker 主动推送的事件类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEventKind {
    /// 连接被 broker 或网络关闭
    Shutdown { reason: String },
    /// broker 因资源告警阻塞了连接
    Blocked { reason: String },
    /// 阻塞解除
    Unblocked,
}

/// 带连接代次的 broker 事件
///
/// 代次用于丢弃已被替换的旧连接迟到的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEvent {
    pub generation: u64,
    pub kind: BrokerEventKind,
}

/// 注入到单个物理连接中的事件出口
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 投递事件；接收端已关闭（worker 正在退出）时静默丢弃
    pub fn emit(&self, kind: BrokerEventKind) {
        let event = BrokerEvent {
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(generation = self.generation, "事件队列已关闭，丢弃 broker 事件");
        }
    }
}

/// 消费者收到的消息流；流结束或返回错误表示订阅丢失
pub type DeliveryStream = BoxStream<'static, Result<Envelope, BrokerError>>;

/// broker 客户端：负责建立物理连接、打开通道并声明拓扑
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// 建立连接并幂等地声明 `topology`
    ///
    /// 任何一步失败都必须关闭已打开的资源后再返回错误。
    /// 连接建立后 broker 推送的事件写入 `events`。
    async fn connect(
        &self,
        topology: &Topology,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// 一个已建立的逻辑通道，两个消费循环共享同一实例
///
/// 实现必须支持并发调用。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 通道及其所属连接是否仍然可用
    ///
    /// broker 可以只关闭通道（如 404、406 通道异常）而保留连接，
    /// 这种情况不会产生连接级事件。
    fn is_open(&self) -> bool;

    /// 在 `queue` 上创建消费者（手动确认模式）
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    /// 取消消费者
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// 向交换机发布一条消息（用于死信转发）
    ///
    /// 只有 broker 确认接收并成功路由后才返回 `Ok`。
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8])
    -> Result<(), BrokerError>;

    /// 关闭通道及其所属连接
    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        sink.emit(BrokerEventKind::Unblocked);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.generation, 7);
        assert_eq!(event.kind, BrokerEventKind::Unblocked);
    }

    #[test]
    fn test_event_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(1, tx);
        // 不应 panic
        sink.emit(BrokerEventKind::Shutdown {
            reason: "bye".to_string(),
        });
        assert_eq!(sink.generation(), 1);
    }
}

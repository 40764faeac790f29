//! 消费循环
//!
//! 每个消息类别一个独立的循环，显式状态机：
//!
//! ```text
//! Starting → Subscribing → Subscribed ─(订阅丢失/连接失败)→ Backoff → Subscribing ...
//!                                     ─(关闭信号)→ Stopped
//! ```
//!
//! 订阅建立后循环不轮询，只等待三件事之一：新消息、订阅丢失（流结束或连接断开）、
//! 关闭信号。消息严格逐条处理并确认，处理中的消息不会被关闭信号打断。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatch_shared::observability::metrics;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{ConnectionState, DeliveryStream, Envelope};
use crate::connection::{BrokerSession, ConnectionManager};
use crate::error::ConnectError;
use crate::processor::{MessageProcessor, ProcessingOutcome};
use crate::topology::MessageClass;

/// 消费循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Subscribing,
    Subscribed,
    Backoff,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 一条消息的终结方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::DeadLetter => "dead_letter",
        }
    }
}

/// 订阅结束的原因
enum SubscriptionEnd {
    Shutdown,
    Lost(String),
}

/// 单个消息类别的消费循环
pub struct ConsumerLoop {
    class: MessageClass,
    manager: Arc<ConnectionManager>,
    processor: MessageProcessor,
    backoff: Duration,
    dead_letter_malformed: bool,
    state_tx: watch::Sender<LoopState>,
    subscriptions: u64,
}

impl ConsumerLoop {
    pub fn new(
        manager: Arc<ConnectionManager>,
        processor: MessageProcessor,
        backoff: Duration,
        dead_letter_malformed: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Starting);
        Self {
            class: processor.class(),
            manager,
            processor,
            backoff,
            dead_letter_malformed,
            state_tx,
            subscriptions: 0,
        }
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// 订阅循环状态变化
    pub fn states(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// 运行直到收到关闭信号
    ///
    /// 连接或订阅失败只会进入退避，不会让循环退出。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.class.queue();
        info!(queue, "消费循环已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(LoopState::Subscribing);
            match self.subscribe().await {
                Ok((session, stream, consumer_tag)) => {
                    self.set_state(LoopState::Subscribed);
                    info!(queue, consumer_tag = %consumer_tag, generation = session.generation(), "订阅已建立");

                    let end = self.consume(&session, stream, &mut shutdown).await;

                    // 尽力取消消费者，连接已断开时失败是预期内的
                    if let Err(e) = session.channel().cancel(&consumer_tag).await {
                        debug!(queue, consumer_tag = %consumer_tag, error = %e, "取消消费者失败");
                    }

                    match end {
                        SubscriptionEnd::Shutdown => break,
                        SubscriptionEnd::Lost(reason) => {
                            warn!(queue, %reason, "订阅丢失，进入退避");
                        }
                    }
                }
                Err(ConnectError::CircuitOpen) => {
                    debug!(queue, "熔断器跳闸，进入退避");
                }
                Err(e) => {
                    warn!(queue, error = %e, "建立订阅失败，进入退避");
                }
            }

            self.set_state(LoopState::Backoff);
            if !self.wait_backoff(&mut shutdown).await {
                break;
            }
        }

        self.set_state(LoopState::Stopped);
        info!(queue, "消费循环已停止");
    }

    /// 确保连接可用并在本类别队列上创建消费者
    async fn subscribe(&mut self) -> Result<(BrokerSession, DeliveryStream, String), ConnectError> {
        let session = self.manager.ensure_connected().await?;

        self.subscriptions += 1;
        let consumer_tag = format!(
            "{}-{}-{}",
            self.class.as_str(),
            session.generation(),
            self.subscriptions
        );
        let stream = match session
            .channel()
            .consume(self.class.queue(), &consumer_tag)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.manager.invalidate(session.generation(), &e);
                return Err(e.into());
            }
        };

        Ok((session, stream, consumer_tag))
    }

    /// 逐条处理消息，直到订阅丢失或收到关闭信号
    async fn consume(
        &self,
        session: &BrokerSession,
        mut stream: DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SubscriptionEnd {
        let mut connection = self.manager.watch_state();

        loop {
            tokio::select! {
                biased;

                // watch::Ref 持有锁，不能留在 select 输出里跨越 handle 的 await
                _ = shutdown.wait_for(|stop| *stop).map(|_| ()) => {
                    return SubscriptionEnd::Shutdown;
                }

                _ = connection
                    .wait_for(|state| *state == ConnectionState::Disconnected)
                    .map(|_| ()) => {
                    return SubscriptionEnd::Lost("broker 连接已断开".to_string());
                }

                delivery = stream.next() => match delivery {
                    Some(Ok(envelope)) => self.handle(session, envelope).await,
                    Some(Err(e)) => {
                        self.manager.invalidate(session.generation(), &e);
                        return SubscriptionEnd::Lost(e.to_string());
                    }
                    None => return SubscriptionEnd::Lost("消费者被 broker 取消".to_string()),
                }
            }
        }
    }

    /// 处理单条消息并恰好终结一次
    async fn handle(&self, session: &BrokerSession, envelope: Envelope) {
        let queue = self.class.queue();
        let started = Instant::now();

        debug!(
            queue,
            delivery_tag = envelope.delivery_tag,
            redelivered = envelope.redelivered,
            "收到消息"
        );

        let outcome = AssertUnwindSafe(self.processor.process(&envelope.body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(queue, delivery_tag = envelope.delivery_tag, %reason, "消息处理器 panic");
                ProcessingOutcome::Failure {
                    reason,
                    permanent: false,
                }
            });

        let settlement = self.settle(session, &envelope, &outcome).await;
        metrics::record_message(queue, settlement.as_str(), started.elapsed().as_secs_f64());
    }

    /// 根据处理结果 ack、重新入队或转入死信队列
    ///
    /// 每条路径只调用一次 ack 或 reject。确认失败时通知连接管理器会话已失效。
    async fn settle(
        &self,
        session: &BrokerSession,
        envelope: &Envelope,
        outcome: &ProcessingOutcome,
    ) -> Settlement {
        let queue = self.class.queue();
        let channel = session.channel();
        let tag = envelope.delivery_tag;

        let settlement = match outcome {
            ProcessingOutcome::Success => Settlement::Ack,
            ProcessingOutcome::Failure {
                permanent: true, ..
            } if self.dead_letter_malformed => {
                match channel
                    .publish(
                        self.class.exchange(),
                        &self.class.dead_letter_routing_key(),
                        &envelope.body,
                    )
                    .await
                {
                    Ok(()) => Settlement::DeadLetter,
                    Err(e) => {
                        warn!(queue, delivery_tag = tag, error = %e, "转发死信失败，消息重新入队");
                        Settlement::Requeue
                    }
                }
            }
            ProcessingOutcome::Failure { .. } => Settlement::Requeue,
        };

        let result = match settlement {
            Settlement::Ack | Settlement::DeadLetter => channel.ack(tag).await,
            Settlement::Requeue => channel.reject(tag, true).await,
        };

        match (&result, outcome) {
            (Err(e), _) => {
                // 连接已断开时 broker 会自动重投未确认的消息
                warn!(queue, delivery_tag = tag, settlement = settlement.as_str(), error = %e, "消息确认失败");
                self.manager.invalidate(session.generation(), e);
            }
            (Ok(()), ProcessingOutcome::Failure { reason, .. }) => {
                info!(queue, delivery_tag = tag, settlement = settlement.as_str(), %reason, "消息处理失败");
            }
            (Ok(()), ProcessingOutcome::Success) => {
                debug!(queue, delivery_tag = tag, "消息已确认");
            }
        }

        settlement
    }

    /// 固定时长退避，期间收到关闭信号立即返回 false
    async fn wait_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop).map(|_| ()) => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }

    fn set_state(&self, state: LoopState) {
        debug!(queue = self.class.queue(), %state, "消费循环状态变更");
        self.state_tx.send_replace(state);
    }
}

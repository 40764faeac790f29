//! 基于 lapin 的 AMQP (RabbitMQ) 实现
//!
//! 将 lapin 的连接、通道 API 封装为 [`BrokerClient`] / [`BrokerChannel`]，
//! 统一错误映射：I/O 故障视为 broker 不可达，连接/通道状态异常视为传输层故障，
//! 其余（如声明参数冲突）视为协议错误，不推动熔断器。
//!
//! 通道开启发布确认，死信转发只有在 broker 确认并成功路由后才算完成。

use std::sync::Arc;

use async_trait::async_trait;
use dispatch_shared::config::BrokerConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerClient, BrokerEventKind, DeliveryStream, DeliveryTag, Envelope, EventSink,
};
use crate::error::BrokerError;
use crate::topology::Topology;

/// AMQP 正常关闭的 reply code
const REPLY_SUCCESS: u16 = 200;

/// 将 lapin 错误映射为按连通性分类的 `BrokerError`
pub fn classify(err: lapin::Error) -> BrokerError {
    let message = err.to_string();
    match err {
        lapin::Error::IOError(_) => BrokerError::Unreachable(message),
        lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
            BrokerError::Transport(message)
        }
        _ => BrokerError::Protocol(message),
    }
}

/// 检查发布确认：broker 拒收或消息无法路由（mandatory 退回）都视为失败
pub fn check_confirmation(confirmation: Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(returned)) => Err(BrokerError::Protocol(format!(
            "消息无法路由: {}",
            returned.reply_text.as_str()
        ))),
        Confirmation::Nack(_) => Err(BrokerError::Protocol("broker 拒绝确认发布".to_string())),
        Confirmation::NotRequested => {
            Err(BrokerError::Protocol("通道未开启发布确认".to_string()))
        }
    }
}

/// AMQP 客户端
pub struct AmqpClient {
    uri: String,
    connection_name: String,
    prefetch: u16,
}

impl AmqpClient {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            connection_name: config.connection_name.clone(),
            prefetch: config.prefetch,
        }
    }

    /// 打开通道、设置 QoS 并声明拓扑
    async fn open_channel(
        &self,
        connection: &Connection,
        topology: &Topology,
    ) -> Result<Channel, BrokerError> {
        let channel = connection.create_channel().await.map_err(classify)?;

        // 死信转发依赖发布确认，确认前不 ack 原消息
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(classify)?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(classify)?;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: topology.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        for binding in &topology.bindings {
            channel
                .queue_declare(
                    &binding.queue,
                    QueueDeclareOptions {
                        durable: topology.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(classify)?;

            channel
                .queue_bind(
                    &binding.queue,
                    &topology.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(classify)?;

            debug!(
                exchange = %topology.exchange,
                queue = %binding.queue,
                routing_key = %binding.routing_key,
                "队列已声明并绑定"
            );
        }

        Ok(channel)
    }
}

#[async_trait]
impl BrokerClient for AmqpClient {
    async fn connect(
        &self,
        topology: &Topology,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect(&self.uri, properties)
            .await
            .map_err(classify)?;

        // lapin 在连接出错（含 broker 主动关闭、心跳超时）时回调
        let shutdown_events = events.clone();
        connection.on_error(move |err| {
            shutdown_events.emit(BrokerEventKind::Shutdown {
                reason: err.to_string(),
            });
        });

        match self.open_channel(&connection, topology).await {
            Ok(channel) => {
                info!(
                    generation = events.generation(),
                    exchange = %topology.exchange,
                    queues = topology.bindings.len(),
                    "AMQP 连接已建立，拓扑声明完成"
                );
                Ok(Arc::new(AmqpChannel {
                    connection,
                    channel,
                }))
            }
            Err(e) => {
                // 关闭已打开的连接，避免半初始化的资源泄漏
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "setup failed").await {
                    debug!(error = %close_err, "关闭半初始化连接失败");
                }
                Err(e)
            }
        }
    }
}

/// 已建立的 AMQP 通道
///
/// lapin 的 `Channel` 内部串行化帧写入，可被两个消费循环并发使用。
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| Envelope {
                    delivery_tag: delivery.delivery_tag,
                    body: delivery.data,
                    redelivered: delivery.redelivered,
                })
                .map_err(classify)
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(classify)
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(classify)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                BasicProperties::default(),
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;
        check_confirmation(confirmation)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "worker shutdown").await {
            warn!(error = %e, "关闭 AMQP 通道失败");
        }
        self.connection
            .close(REPLY_SUCCESS, "worker shutdown")
            .await
            .map_err(classify)
    }
}

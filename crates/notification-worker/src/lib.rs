//! 通知分发 worker
//!
//! 维护到 RabbitMQ 的单一连接，订阅通知和提醒两个独立队列，
//! 逐条解析消息、查询接收人账户并发送邮件，按处理结果 ack 或重新入队。
//! broker 不可用时由熔断器和重连节流限制重连频率。

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod processor;
pub mod sender;
pub mod topology;

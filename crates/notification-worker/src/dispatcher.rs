//! 调度器
//!
//! worker 的生命周期所有者：并发运行通知和提醒两个消费循环以及 broker 事件循环，
//! 一个循环异常退出不影响另一个。两个消费循环都停止后才关闭 broker 连接，
//! 避免打断进行中的 ack。

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_shared::config::WorkerConfig;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::connection::ConnectionManager;
use crate::consumer::{ConsumerLoop, LoopState};
use crate::directory::AccountDirectory;
use crate::processor::MessageProcessor;
use crate::sender::NotificationMailer;
use crate::topology::MessageClass;

/// 通知分发调度器
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    loops: Vec<ConsumerLoop>,
}

impl Dispatcher {
    /// 为每个消息类别构建一个消费循环，共享同一个连接管理器和外部协作者
    pub fn new(
        manager: Arc<ConnectionManager>,
        directory: Arc<dyn AccountDirectory>,
        mailer: Arc<dyn NotificationMailer>,
        config: &WorkerConfig,
    ) -> Self {
        let loops = MessageClass::ALL
            .into_iter()
            .map(|class| {
                let processor = MessageProcessor::new(class, directory.clone(), mailer.clone());
                ConsumerLoop::new(
                    manager.clone(),
                    processor,
                    config.backoff(),
                    config.dead_letter_malformed,
                )
            })
            .collect();

        Self { manager, loops }
    }

    /// 各消费循环的状态订阅
    pub fn loop_states(&self) -> HashMap<MessageClass, watch::Receiver<LoopState>> {
        self.loops
            .iter()
            .map(|consumer| (consumer.class(), consumer.states()))
            .collect()
    }

    /// 运行直到收到关闭信号且两个消费循环都已停止
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let events = tokio::spawn({
            let manager = self.manager.clone();
            let shutdown = shutdown.clone();
            async move { manager.run_events(shutdown).await }
        });

        let mut consumers = JoinSet::new();
        for consumer in self.loops {
            let class = consumer.class();
            let shutdown = shutdown.clone();
            consumers.spawn(async move {
                consumer.run(shutdown).await;
                class
            });
        }

        info!(loops = consumers.len(), "通知调度器已启动");

        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(class) => info!(class = %class, "消费循环已退出"),
                // 单个循环 panic 不影响其余循环
                Err(e) => error!(error = %e, "消费循环异常终止"),
            }
        }

        if let Err(e) = events.await {
            error!(error = %e, "broker 事件循环异常终止");
        }

        self.manager.close().await;
        info!("通知调度器已停止");
    }
}

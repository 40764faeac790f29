//! 通知分发 worker
//!
//! 从 RabbitMQ 消费通知和提醒消息并发送邮件。

use std::sync::Arc;

use anyhow::Result;
use dispatch_shared::circuit_breaker::CircuitBreaker;
use dispatch_shared::clock::TokioClock;
use dispatch_shared::config::AppConfig;
use dispatch_shared::database::Database;
use dispatch_shared::observability;
use notification_worker::broker::amqp::AmqpClient;
use notification_worker::connection::ConnectionManager;
use notification_worker::directory::PgAccountDirectory;
use notification_worker::dispatcher::Dispatcher;
use notification_worker::sender::build_mailer;
use notification_worker::topology::Topology;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load("notification-worker").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: "notification-worker".to_string(),
            ..Default::default()
        }
    });

    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        production = config.is_production(),
        broker = %config.broker.connection_name,
        "Starting notification-worker..."
    );

    let database = Database::connect_lazy(&config.database)?;
    if let Err(e) = database.health_check().await {
        // 数据库暂不可用不阻止启动，相关消息会重新入队
        warn!(error = %e, "Database health check failed");
    }
    let directory = Arc::new(PgAccountDirectory::new(database.pool().clone()));
    let mailer = build_mailer(&config.mailer)?;

    let clock = Arc::new(TokioClock);
    let breaker = CircuitBreaker::with_clock(
        config.circuit_breaker.to_breaker_config("amqp"),
        clock.clone(),
    );
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(AmqpClient::new(&config.broker)),
        Topology::standard(config.broker.durable, config.worker.dead_letter_malformed),
        breaker,
        config.broker.min_reconnect_interval(),
        clock,
    ));

    let dispatcher = Dispatcher::new(manager, directory, mailer, &config.worker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(dispatcher.run(shutdown_rx));

    shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        warn!("调度器已提前退出");
    }

    if let Err(e) = worker.await {
        error!(error = %e, "调度器异常终止");
    }

    database.close().await;
    info!("notification-worker shutdown complete");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
///
/// 信号处理器安装失败时对应分支永不完成，另一个信号仍然有效。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}

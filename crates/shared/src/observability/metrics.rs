//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
///
/// drop 时终止指标 HTTP 服务任务。
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册通用指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "broker_connect_attempts_total",
        "Total number of broker connect attempts by outcome"
    );
    metrics::describe_gauge!("broker_connected", "1 when the broker connection is up");

    metrics::describe_counter!(
        "notification_messages_total",
        "Total number of handled messages by queue and outcome"
    );
    metrics::describe_histogram!(
        "notification_message_duration_seconds",
        "Message handling duration in seconds"
    );
    metrics::describe_counter!(
        "notification_emails_sent_total",
        "Total number of notification emails by status"
    );

    metrics::describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    metrics::describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次 broker 连接尝试
#[inline]
pub fn record_connect_attempt(outcome: &str) {
    metrics::counter!(
        "broker_connect_attempts_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 更新 broker 连接状态
#[inline]
pub fn set_broker_connected(connected: bool) {
    metrics::gauge!("broker_connected").set(if connected { 1.0 } else { 0.0 });
}

/// 记录一条消息的处理结果
#[inline]
pub fn record_message(queue: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "notification_messages_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_message_duration_seconds",
        "queue" => queue.to_string()
    )
    .record(duration_secs);
}

/// 记录一封通知邮件的发送结果
#[inline]
pub fn record_email_sent(queue: &str, status: &str) {
    metrics::counter!(
        "notification_emails_sent_total",
        "queue" => queue.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_connect_attempt("success");
        record_connect_attempt("circuit_open");
        set_broker_connected(true);
        set_broker_connected(false);
        record_message("send-notification-email", "ack", 0.02);
        record_email_sent("send-reminder-email", "sent");
    }

    #[test]
    fn test_handle_absent_before_init() {
        // 单元测试进程中不会安装 recorder
        assert!(get_handle().is_none());
    }
}

//! 可观测性模块集成测试
//!
//! 测试指标记录、Prometheus 导出与日志过滤配置。

mod metrics_tests {
    use dispatch_shared::observability::metrics::{
        get_handle, init, record_connect_attempt, record_email_sent, record_message,
        set_broker_connected,
    };

    #[test]
    fn test_record_without_recorder_is_noop() {
        record_connect_attempt("success");
        record_connect_attempt("circuit_open");
        set_broker_connected(true);
        record_message("send-notification-email", "ack", 0.02);
        record_email_sent("send-reminder-email", "failure");
    }

    // 全局 recorder 每个进程只能安装一次，只在这一个测试中初始化
    #[tokio::test]
    async fn test_exporter_renders_recorded_metrics() {
        let _handle = init("notification-worker", 0).await.unwrap();

        record_connect_attempt("failure");
        set_broker_connected(false);
        record_message("send-notification-email", "requeue", 0.15);
        record_email_sent("send-notification-email", "success");

        let rendered = get_handle().unwrap().render();
        assert!(rendered.contains("broker_connect_attempts_total"));
        assert!(rendered.contains("notification_messages_total"));
        assert!(rendered.contains(r#"outcome="requeue""#));
        assert!(rendered.contains("notification_emails_sent_total"));
    }
}

mod tracing_tests {
    use dispatch_shared::config::ObservabilityConfig;
    use dispatch_shared::observability::tracing::env_filter;

    #[test]
    fn test_env_filter_from_config_level() {
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let _ = env_filter(&config);
    }
}

mod guard_tests {
    use dispatch_shared::observability::ObservabilityGuard;

    #[test]
    fn test_empty_guard() {
        let _guard = ObservabilityGuard::empty();
    }
}

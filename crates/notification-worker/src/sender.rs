//! 邮件发送器
//!
//! 通过 `NotificationMailer` trait 抽象发送行为：
//! - `LoggingMailer`：模拟发送（仅记录日志），便于在无外部依赖的情况下验证消费管道
//! - `HttpMailer`：以 JSON 调用邮件网关，超时由 HTTP 客户端自身控制

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_shared::config::{MailerConfig, MailerMode};
use dispatch_shared::error::DispatchError;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::directory::Account;
use crate::error::NotificationError;

const CHANNEL: &str = "EMAIL";

/// 邮件内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub title: String,
    pub content: String,
}

/// 邮件发送接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationMailer: Send + Sync {
    async fn send_notification_email(
        &self,
        account: &Account,
        email: &EmailContent,
    ) -> Result<(), NotificationError>;
}

/// 模拟邮件发送器
pub struct LoggingMailer {
    from_address: String,
}

impl LoggingMailer {
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl NotificationMailer for LoggingMailer {
    async fn send_notification_email(
        &self,
        account: &Account,
        email: &EmailContent,
    ) -> Result<(), NotificationError> {
        let message_id = Uuid::now_v7().to_string();

        info!(
            channel = CHANNEL,
            account_id = %account.id,
            to = %account.email,
            from = %self.from_address,
            message_id = %message_id,
            title = %email.title,
            "模拟发送邮件通知"
        );

        Ok(())
    }
}

/// 邮件网关请求体
#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a str,
    to_name: Option<&'a str>,
    subject: &'a str,
    body: &'a str,
}

/// 基于 HTTP 邮件网关的发送器
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    from_address: String,
}

impl HttpMailer {
    pub fn new(
        endpoint: impl Into<String>,
        from_address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::SendFailed {
                channel: CHANNEL.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            from_address: from_address.into(),
        })
    }
}

#[async_trait]
impl NotificationMailer for HttpMailer {
    async fn send_notification_email(
        &self,
        account: &Account,
        email: &EmailContent,
    ) -> Result<(), NotificationError> {
        let request = MailRequest {
            from: &self.from_address,
            to: &account.email,
            to_name: account.full_name.as_deref(),
            subject: &email.title,
            body: &email.content,
        };

        let send_failed = |reason: String| NotificationError::SendFailed {
            channel: CHANNEL.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotificationError::Shared(DispatchError::ExternalServiceTimeout {
                        service: "mail-gateway".to_string(),
                    })
                } else {
                    send_failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(send_failed(format!("邮件网关返回 {}", status)));
        }

        info!(
            channel = CHANNEL,
            account_id = %account.id,
            status = status.as_u16(),
            "邮件已提交到网关"
        );
        Ok(())
    }
}

/// 按配置构建邮件发送器
pub fn build_mailer(config: &MailerConfig) -> Result<Arc<dyn NotificationMailer>, DispatchError> {
    match config.mode {
        MailerMode::Log => Ok(Arc::new(LoggingMailer::new(config.from_address.clone()))),
        MailerMode::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                DispatchError::Internal("mailer.mode=http 时必须配置 mailer.endpoint".to_string())
            })?;
            let mailer = HttpMailer::new(
                endpoint,
                config.from_address.clone(),
                Duration::from_secs(config.timeout_secs),
            )
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
            Ok(Arc::new(mailer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: Uuid::now_v7(),
            email: "guest@example.com".to_string(),
            full_name: Some("张三".to_string()),
        }
    }

    fn email() -> EmailContent {
        EmailContent {
            title: "预订确认".to_string(),
            content: "您的预订已确认".to_string(),
        }
    }

    #[tokio::test]
    async fn test_logging_mailer_succeeds() {
        let mailer = LoggingMailer::new("no-reply@hotel.local");
        assert!(
            mailer
                .send_notification_email(&account(), &email())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_http_mailer_reports_unreachable_gateway() {
        let mailer = HttpMailer::new(
            "http://127.0.0.1:1/send",
            "no-reply@hotel.local",
            Duration::from_secs(2),
        )
        .unwrap();

        let result = mailer.send_notification_email(&account(), &email()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_mail_request_serialization() {
        let request = MailRequest {
            from: "a@x",
            to: "b@x",
            to_name: None,
            subject: "s",
            body: "b",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["to"], "b@x");
        assert!(json["to_name"].is_null());
    }

    #[test]
    fn test_build_mailer_requires_endpoint_for_http() {
        let config = MailerConfig {
            mode: MailerMode::Http,
            endpoint: None,
            ..Default::default()
        };
        assert!(build_mailer(&config).is_err());

        let config = MailerConfig {
            mode: MailerMode::Http,
            endpoint: Some("http://mail.local/send".to_string()),
            ..Default::default()
        };
        assert!(build_mailer(&config).is_ok());
    }

    #[test]
    fn test_build_mailer_defaults_to_logging() {
        assert!(build_mailer(&MailerConfig::default()).is_ok());
    }
}

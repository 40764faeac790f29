//! 消息处理器
//!
//! 将一条消息体解析为通知并逐个发送给接收人，汇总为单一的处理结果。
//! 整条消息要么全部成功，要么整体失败后重投：任何接收人失败都会中止处理，
//! 已发送的接收人在重投后可能再次收到邮件（至少一次语义）。

use std::sync::Arc;

use dispatch_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::directory::AccountDirectory;
use crate::error::NotificationError;
use crate::payload::NotificationPayload;
use crate::sender::NotificationMailer;
use crate::topology::MessageClass;

/// 单条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    Failure {
        reason: String,
        /// 重投也无法成功（消息体格式错误）
        permanent: bool,
    },
}

impl ProcessingOutcome {
    pub fn failure(err: &NotificationError) -> Self {
        Self::Failure {
            reason: err.reason(),
            permanent: err.is_permanent(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// 消息处理器
pub struct MessageProcessor {
    class: MessageClass,
    directory: Arc<dyn AccountDirectory>,
    mailer: Arc<dyn NotificationMailer>,
}

impl MessageProcessor {
    pub fn new(
        class: MessageClass,
        directory: Arc<dyn AccountDirectory>,
        mailer: Arc<dyn NotificationMailer>,
    ) -> Self {
        Self {
            class,
            directory,
            mailer,
        }
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// 处理一条消息体
    pub async fn process(&self, body: &[u8]) -> ProcessingOutcome {
        match self.dispatch(body).await {
            Ok(sent) => {
                info!(queue = self.class.queue(), sent, "通知消息处理完成");
                ProcessingOutcome::Success
            }
            Err(e) => {
                warn!(
                    queue = self.class.queue(),
                    code = e.code(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "通知消息处理失败"
                );
                ProcessingOutcome::failure(&e)
            }
        }
    }

    /// 按顺序发送给每个接收人，返回发送数量
    async fn dispatch(&self, body: &[u8]) -> Result<usize, NotificationError> {
        let payload = NotificationPayload::from_slice(body)?;
        let email = payload.email();

        for receiver in &payload.receivers {
            let account = self
                .directory
                .lookup_account(&receiver.user_id)
                .await?
                .ok_or_else(|| NotificationError::ReceiverNotFound {
                    user_id: receiver.user_id.clone(),
                })?;

            if let Err(e) = self.mailer.send_notification_email(&account, &email).await {
                metrics::record_email_sent(self.class.queue(), "failure");
                return Err(e);
            }
            metrics::record_email_sent(self.class.queue(), "success");
            debug!(
                queue = self.class.queue(),
                user_id = %receiver.user_id,
                "接收人邮件已发送"
            );
        }

        Ok(payload.receivers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Account, MockAccountDirectory};
    use crate::sender::MockNotificationMailer;
    use mockall::Sequence;
    use uuid::Uuid;

    fn account(user_id: &str) -> Account {
        Account {
            id: Uuid::now_v7(),
            email: format!("{}@example.com", user_id),
            full_name: None,
        }
    }

    fn processor(
        directory: MockAccountDirectory,
        mailer: MockNotificationMailer,
    ) -> MessageProcessor {
        MessageProcessor::new(
            MessageClass::Notification,
            Arc::new(directory),
            Arc::new(mailer),
        )
    }

    #[tokio::test]
    async fn test_malformed_body_fails_without_side_effects() {
        let mut directory = MockAccountDirectory::new();
        directory.expect_lookup_account().never();
        let mut mailer = MockNotificationMailer::new();
        mailer.expect_send_notification_email().never();

        let outcome = processor(directory, mailer).process(b"{not json").await;
        assert_eq!(
            outcome,
            ProcessingOutcome::Failure {
                reason: "malformed payload".to_string(),
                permanent: true,
            }
        );
    }

    #[tokio::test]
    async fn test_happy_path() {
        let mut directory = MockAccountDirectory::new();
        directory
            .expect_lookup_account()
            .withf(|user_id| user_id == "u1")
            .times(1)
            .returning(|id| Ok(Some(account(id))));
        let mut mailer = MockNotificationMailer::new();
        mailer
            .expect_send_notification_email()
            .withf(|account, email| {
                account.email == "u1@example.com" && email.title == "T" && email.content == "C"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let body = br#"{"notificationTitle":"T","notificationContent":"C","receivers":[{"userId":"u1"}]}"#;
        let outcome = processor(directory, mailer).process(body).await;
        assert_eq!(outcome, ProcessingOutcome::Success);
    }

    #[tokio::test]
    async fn test_empty_receivers_is_success() {
        let directory = MockAccountDirectory::new();
        let mailer = MockNotificationMailer::new();

        let body = br#"{"notificationTitle":"T","notificationContent":"C","receivers":[]}"#;
        assert!(processor(directory, mailer).process(body).await.is_success());
    }

    #[tokio::test]
    async fn test_lookup_error_aborts_remaining_receivers() {
        let mut seq = Sequence::new();
        let mut directory = MockAccountDirectory::new();
        let mut mailer = MockNotificationMailer::new();

        directory
            .expect_lookup_account()
            .withf(|user_id| user_id == "r1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Ok(Some(account(id))));
        mailer
            .expect_send_notification_email()
            .withf(|account, _| account.email == "r1@example.com")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        directory
            .expect_lookup_account()
            .withf(|user_id| user_id == "r2")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| {
                Err(NotificationError::LookupFailed {
                    user_id: id.to_string(),
                    reason: "connection reset".to_string(),
                })
            });
        directory
            .expect_lookup_account()
            .withf(|user_id| user_id == "r3")
            .never();

        let body = br#"{"notificationTitle":"T","notificationContent":"C","receivers":[{"userId":"r1"},{"userId":"r2"},{"userId":"r3"}]}"#;
        let outcome = processor(directory, mailer).process(body).await;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Failure {
                permanent: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_receiver_not_found_stops_iteration() {
        let mut directory = MockAccountDirectory::new();
        directory
            .expect_lookup_account()
            .withf(|user_id| user_id == "u1")
            .times(1)
            .returning(|_| Ok(None));
        directory
            .expect_lookup_account()
            .withf(|user_id| user_id == "u2")
            .never();
        let mut mailer = MockNotificationMailer::new();
        mailer.expect_send_notification_email().never();

        let body = br#"{"notificationTitle":"T","notificationContent":"C","receivers":[{"userId":"u1"},{"userId":"u2"}]}"#;
        let outcome = processor(directory, mailer).process(body).await;
        assert_eq!(
            outcome,
            ProcessingOutcome::Failure {
                reason: "receiver u1 not found".to_string(),
                permanent: false,
            }
        );
    }

    #[tokio::test]
    async fn test_send_error_fails_message() {
        let mut directory = MockAccountDirectory::new();
        directory
            .expect_lookup_account()
            .returning(|id| Ok(Some(account(id))));
        let mut mailer = MockNotificationMailer::new();
        mailer
            .expect_send_notification_email()
            .times(1)
            .returning(|_, _| {
                Err(NotificationError::SendFailed {
                    channel: "EMAIL".to_string(),
                    reason: "gateway returned 503".to_string(),
                })
            });

        let body = br#"{"notificationTitle":"T","notificationContent":"C","receivers":[{"userId":"u1"},{"userId":"u2"}]}"#;
        let outcome = processor(directory, mailer).process(body).await;
        assert_eq!(
            outcome,
            ProcessingOutcome::Failure {
                reason: "通知发送失败: 渠道=EMAIL, 原因=gateway returned 503".to_string(),
                permanent: false,
            }
        );
    }
}

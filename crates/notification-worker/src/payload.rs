//! 通知消息体
//!
//! 生产者发布的 JSON 格式：
//!
//! ```json
//! { "notificationTitle": "...", "notificationContent": "...",
//!   "receivers": [ { "userId": "..." } ] }
//! ```
//!
//! 多余字段忽略，缺少必需字段视为格式错误。通知和提醒两个类别共用此格式。

use serde::{Deserialize, Serialize};

use crate::error::NotificationError;
use crate::sender::EmailContent;

/// 一个接收人
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receiver {
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// 解析后的通知消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "notificationTitle")]
    pub title: String,
    #[serde(rename = "notificationContent")]
    pub content: String,
    /// 按顺序处理的接收人列表
    pub receivers: Vec<Receiver>,
}

impl NotificationPayload {
    pub fn from_slice(body: &[u8]) -> Result<Self, NotificationError> {
        serde_json::from_slice(body).map_err(|e| NotificationError::MalformedPayload(e.to_string()))
    }

    /// 发给每个接收人的邮件内容
    pub fn email(&self) -> EmailContent {
        EmailContent {
            title: self.title.clone(),
            content: self.content.clone(),
        }
    }
}

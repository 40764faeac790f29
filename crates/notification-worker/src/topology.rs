//! broker 拓扑定义
//!
//! 集中管理交换机、队列、routing key 名称，必须与现有生产者保持一致，
//! 防止字符串散落在各处导致拼写不一致。

/// 通知与提醒共用的 direct 交换机
pub const NOTIFICATION_EXCHANGE: &str = "NotificationExchange";

pub mod queues {
    pub const NOTIFICATION: &str = "send-notification-email";
    pub const REMINDER: &str = "send-reminder-email";
}

pub mod routing_keys {
    pub const NOTIFICATION: &str = "notification-email-key";
    pub const REMINDER: &str = "reminder-email-key";
}

/// 死信队列名与 routing key 的后缀
const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// 消息类别，每个类别对应一个独立的队列和消费循环
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// 即时通知
    Notification,
    /// 定时提醒
    Reminder,
}

impl MessageClass {
    pub const ALL: [MessageClass; 2] = [MessageClass::Notification, MessageClass::Reminder];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Reminder => "reminder",
        }
    }

    pub fn exchange(&self) -> &'static str {
        NOTIFICATION_EXCHANGE
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Self::Notification => queues::NOTIFICATION,
            Self::Reminder => queues::REMINDER,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::Notification => routing_keys::NOTIFICATION,
            Self::Reminder => routing_keys::REMINDER,
        }
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}{}", self.queue(), DEAD_LETTER_SUFFIX)
    }

    pub fn dead_letter_routing_key(&self) -> String {
        format!("{}{}", self.routing_key(), DEAD_LETTER_SUFFIX)
    }
}

impl std::fmt::Display for MessageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 队列与交换机之间的一条绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

/// 建立连接后需要（幂等地）声明的完整拓扑
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub durable: bool,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    /// 通知 + 提醒两个类别的标准拓扑
    ///
    /// `dead_letter` 为 true 时额外声明每个类别的死信队列。
    pub fn standard(durable: bool, dead_letter: bool) -> Self {
        let mut bindings = Vec::new();
        for class in MessageClass::ALL {
            bindings.push(QueueBinding {
                queue: class.queue().to_string(),
                routing_key: class.routing_key().to_string(),
            });
            if dead_letter {
                bindings.push(QueueBinding {
                    queue: class.dead_letter_queue(),
                    routing_key: class.dead_letter_routing_key(),
                });
            }
        }

        Self {
            exchange: NOTIFICATION_EXCHANGE.to_string(),
            durable,
            bindings,
        }
    }
}

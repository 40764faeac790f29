//! 通知 worker 错误类型
//!
//! 按处理层次划分三类错误：
//! - `BrokerError`：与 broker 的连通性、协议交互失败，只有连通性错误推动熔断器
//! - `ConnectError`：连接管理器拒绝或未能建立连接的原因
//! - `NotificationError`：单条消息处理失败（解析、查询接收人、发送邮件）

use std::time::Duration;

use dispatch_shared::circuit_breaker::TripsBreaker;
use dispatch_shared::error::DispatchError;
use thiserror::Error;

/// broker 交互错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker 不可达: {0}")]
    Unreachable(String),

    #[error("broker 传输层故障: {0}")]
    Transport(String),

    #[error("broker 协议错误: {0}")]
    Protocol(String),

    #[error("broker 通道已关闭")]
    Closed,
}

impl BrokerError {
    /// 是否属于连通性错误（broker 不可达、套接字/传输层故障）
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Transport(_))
    }

    /// 出现该错误后当前会话不可再用，需要重建连接
    pub fn invalidates_session(&self) -> bool {
        self.is_connectivity() || matches!(self, Self::Closed)
    }
}

impl TripsBreaker for BrokerError {
    fn trips_breaker(&self) -> bool {
        self.is_connectivity()
    }
}

/// 连接管理器未能提供可用连接的原因
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// 熔断器处于跳闸状态，本次未发起任何 I/O
    #[error("熔断器跳闸，跳过重连")]
    CircuitOpen,

    /// 距上次尝试不足最小间隔，本次未发起任何 I/O
    #[error("重连过于频繁，{retry_in:?} 后可再次尝试")]
    Throttled { retry_in: Duration },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// 单条通知消息的处理错误
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("通知反序列化失败: {0}")]
    MalformedPayload(String),

    #[error("接收人不存在: user_id={user_id}")]
    ReceiverNotFound { user_id: String },

    #[error("接收人账户查询失败: user_id={user_id}, 原因={reason}")]
    LookupFailed { user_id: String, reason: String },

    #[error("通知发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed { channel: String, reason: String },

    #[error(transparent)]
    Shared(#[from] DispatchError),
}

impl NotificationError {
    /// 作为处理失败原因上报的简短文本
    pub fn reason(&self) -> String {
        match self {
            Self::MalformedPayload(_) => "malformed payload".to_string(),
            Self::ReceiverNotFound { user_id } => format!("receiver {} not found", user_id),
            other => other.to_string(),
        }
    }

    /// 重投也无法成功的错误
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::MalformedPayload(_))
    }

    /// 错误码，用于日志检索
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::ReceiverNotFound { .. } => "RECEIVER_NOT_FOUND",
            Self::LookupFailed { .. } => "LOOKUP_FAILED",
            Self::SendFailed { .. } => "SEND_FAILED",
            Self::Shared(e) => e.code(),
        }
    }

    /// 下游恢复后重投有望成功（用于日志分级）
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedPayload(_) | Self::ReceiverNotFound { .. } => false,
            Self::LookupFailed { .. } | Self::SendFailed { .. } => true,
            Self::Shared(e) => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let send_err = NotificationError::SendFailed {
            channel: "EMAIL".to_string(),
            reason: "网络超时".to_string(),
        };
        assert_eq!(send_err.to_string(), "通知发送失败: 渠道=EMAIL, 原因=网络超时");

        let deser_err = NotificationError::MalformedPayload("invalid JSON".to_string());
        assert_eq!(deser_err.to_string(), "通知反序列化失败: invalid JSON");
    }

    #[test]
    fn test_failure_reasons() {
        let malformed = NotificationError::MalformedPayload("expected value".to_string());
        assert_eq!(malformed.reason(), "malformed payload");
        assert!(malformed.is_permanent());

        let missing = NotificationError::ReceiverNotFound {
            user_id: "u2".to_string(),
        };
        assert_eq!(missing.reason(), "receiver u2 not found");
        assert!(!missing.is_permanent());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_shared_errors_delegate_code_and_retryability() {
        let err = NotificationError::Shared(DispatchError::ExternalServiceTimeout {
            service: "mail-gateway".to_string(),
        });
        assert_eq!(err.code(), "EXTERNAL_SERVICE_TIMEOUT");
        assert!(err.is_retryable());
        assert_eq!(err.reason(), "外部服务超时: mail-gateway");

        let malformed = NotificationError::MalformedPayload("eof".to_string());
        assert_eq!(malformed.code(), "MALFORMED_PAYLOAD");
    }

    #[test]
    fn test_only_connectivity_errors_trip_breaker() {
        assert!(BrokerError::Unreachable("connection refused".to_string()).trips_breaker());
        assert!(BrokerError::Transport("reset by peer".to_string()).trips_breaker());
        assert!(!BrokerError::Protocol("PRECONDITION_FAILED".to_string()).trips_breaker());
        assert!(!BrokerError::Closed.trips_breaker());
    }

    #[test]
    fn test_closed_channel_invalidates_session() {
        assert!(BrokerError::Closed.invalidates_session());
        assert!(BrokerError::Transport("invalid channel state".to_string()).invalidates_session());
        assert!(!BrokerError::Protocol("NOT_FOUND".to_string()).invalidates_session());
    }

    #[test]
    fn test_connect_error_from_broker_error() {
        let err: ConnectError = BrokerError::Unreachable("refused".to_string()).into();
        assert!(matches!(err, ConnectError::Broker(BrokerError::Unreachable(_))));
        assert_eq!(ConnectError::CircuitOpen.to_string(), "熔断器跳闸，跳过重连");
    }
}

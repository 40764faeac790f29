//! 接收人账户查询
//!
//! 消息处理器只依赖 `AccountDirectory` 抽象，生产环境从 PostgreSQL 的
//! `accounts` 表读取，测试中使用 mock。

use async_trait::async_trait;
use dispatch_shared::error::DispatchError;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::NotificationError;

/// 接收人账户
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
}

/// 账户查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// 按用户 ID 查询账户，不存在时返回 `Ok(None)`
    async fn lookup_account(&self, user_id: &str) -> Result<Option<Account>, NotificationError>;
}

/// 基于 PostgreSQL 的账户查询
pub struct PgAccountDirectory {
    pool: PgPool,
}

impl PgAccountDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountDirectory for PgAccountDirectory {
    async fn lookup_account(&self, user_id: &str) -> Result<Option<Account>, NotificationError> {
        // 账户主键是 UUID，无法解析的 ID 不可能命中
        let Ok(id) = Uuid::parse_str(user_id) else {
            debug!(user_id, "用户 ID 不是合法的 UUID，视为账户不存在");
            return Ok(None);
        };

        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, email, full_name
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DispatchError::from)?;

        Ok(account)
    }
}

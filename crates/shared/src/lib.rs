//! 共享库
//!
//! 包含通知分发 worker 使用的配置、错误处理、熔断器、时钟、数据库连接、
//! 可观测性等基础设施代码。

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod observability;

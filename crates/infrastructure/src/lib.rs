//! 基础设施层实现。
//!
//! 提供 Postgres 仓储、Redis 实时传输、HTTP 推送投递等适配器，
//! 实现应用/领域层定义的端口。`Infrastructure::connect` 负责建连、
//! 执行迁移并装配全部组件。

pub mod builder;
pub mod db;
pub mod migrations;
pub mod push;
pub mod redis;

pub use builder::{Infrastructure, InfrastructureError};
pub use db::repositories::{
    PostgresCallSignalRepository, PostgresConversationRepository, PostgresMessageRepository,
    PostgresNotificationRepository, PostgresProfileRepository, PostgresReactionRepository,
};
pub use db::{create_pg_pool, DbPool, PgStorage};
pub use migrations::MIGRATOR;
pub use push::HttpPushSender;
pub use self::redis::RedisRealtimeTransport;

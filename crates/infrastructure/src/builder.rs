//! 基础设施装配
//!
//! 按配置连接 Postgres 与 Redis，跑数据库迁移，组装仓储、实时传输
//! 与推送适配器，并导出应用运行时需要的依赖集。

use std::sync::Arc;
use std::time::Duration;

use application::{
    NoopPushSender, PushError, PushSender, RuntimeDependencies, SystemClock, TransportError,
};
use config::AppConfig;
use thiserror::Error;

use crate::db::{create_pg_pool, PgStorage};
use crate::migrations::MIGRATOR;
use crate::push::HttpPushSender;
use crate::redis::RedisRealtimeTransport;

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("push error: {0}")]
    Push(#[from] PushError),
}

/// 装配完成的基础设施
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub transport: Arc<RedisRealtimeTransport>,
    pub push: Arc<dyn PushSender>,
}

impl Infrastructure {
    /// 连接外部依赖并跑数据库迁移
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;

        let storage = Arc::new(PgStorage::new(pool));
        let transport =
            Arc::new(RedisRealtimeTransport::connect(&config.redis, &config.realtime).await?);

        // 未配置端点时推送退化为空操作
        let push: Arc<dyn PushSender> = match &config.push.endpoint {
            Some(endpoint) => Arc::new(HttpPushSender::new(
                endpoint.clone(),
                Duration::from_secs(config.push.timeout_secs),
            )?),
            None => Arc::new(NoopPushSender),
        };

        tracing::info!("infrastructure connected");

        Ok(Self {
            storage,
            transport,
            push,
        })
    }

    /// 应用运行时需要的依赖集
    pub fn runtime_dependencies(&self) -> RuntimeDependencies {
        RuntimeDependencies {
            messages: self.storage.messages.clone(),
            conversations: self.storage.conversations.clone(),
            signals: self.storage.signals.clone(),
            notifications: self.storage.notifications.clone(),
            reactions: self.storage.reactions.clone(),
            profiles: self.storage.profiles.clone(),
            transport: self.transport.clone(),
            push: self.push.clone(),
            clock: Arc::new(SystemClock),
        }
    }
}

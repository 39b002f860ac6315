//! 数据库层：连接池与仓储适配器

use std::sync::Arc;

use domain::RepositoryError;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

pub mod repositories;

use repositories::{
    PostgresCallSignalRepository, PostgresConversationRepository, PostgresMessageRepository,
    PostgresNotificationRepository, PostgresProfileRepository, PostgresReactionRepository,
};

pub type DbPool = Pool<Postgres>;

/// 创建 Postgres 连接池
pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// sqlx 错误到仓储错误的统一映射
pub(crate) fn map_sqlx_err(error: sqlx::Error) -> RepositoryError {
    match &error {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            RepositoryError::conflict(db_error.to_string())
        }
        _ => RepositoryError::database(error.to_string()),
    }
}

/// 全套 Postgres 仓储，共享同一个连接池
pub struct PgStorage {
    pub messages: Arc<PostgresMessageRepository>,
    pub conversations: Arc<PostgresConversationRepository>,
    pub signals: Arc<PostgresCallSignalRepository>,
    pub notifications: Arc<PostgresNotificationRepository>,
    pub reactions: Arc<PostgresReactionRepository>,
    pub profiles: Arc<PostgresProfileRepository>,
}

impl PgStorage {
    pub fn new(pool: DbPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            messages: Arc::new(PostgresMessageRepository::new(Arc::clone(&pool))),
            conversations: Arc::new(PostgresConversationRepository::new(Arc::clone(&pool))),
            signals: Arc::new(PostgresCallSignalRepository::new(Arc::clone(&pool))),
            notifications: Arc::new(PostgresNotificationRepository::new(Arc::clone(&pool))),
            reactions: Arc::new(PostgresReactionRepository::new(Arc::clone(&pool))),
            profiles: Arc::new(PostgresProfileRepository::new(pool)),
        }
    }
}

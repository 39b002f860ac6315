//! 用户资料仓储的 Postgres 实现

use std::sync::Arc;

use async_trait::async_trait;
use domain::{ProfileRepository, RepositoryError, UserId, UserProfile};
use uuid::Uuid;

use crate::db::{map_sqlx_err, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbProfile {
    id: Uuid,
    display_name: String,
    avatar_url: Option<String>,
}

impl From<DbProfile> for UserProfile {
    fn from(row: DbProfile) -> Self {
        UserProfile::new(UserId::from(row.id), row.display_name, row.avatar_url)
    }
}

#[derive(Clone)]
pub struct PostgresProfileRepository {
    pool: Arc<DbPool>,
}

impl PostgresProfileRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileRepository for PostgresProfileRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let row = sqlx::query_as::<_, DbProfile>(
            r#"SELECT id, display_name, avatar_url FROM profiles WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.map(UserProfile::from))
    }
}

//! 会话仓储的 Postgres 实现

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Conversation, ConversationId, ConversationRepository, RepositoryError, Timestamp, UserId,
};
use uuid::Uuid;

use crate::db::{map_sqlx_err, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbConversation {
    id: Uuid,
    participant_a: Uuid,
    participant_b: Uuid,
    updated_at: DateTime<Utc>,
}

impl From<DbConversation> for Conversation {
    fn from(row: DbConversation) -> Self {
        Conversation::new(
            ConversationId::from(row.id),
            UserId::from(row.participant_a),
            UserId::from(row.participant_b),
            row.updated_at,
        )
    }
}

#[derive(Clone)]
pub struct PostgresConversationRepository {
    pool: Arc<DbPool>,
}

impl PostgresConversationRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PostgresConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let row = sqlx::query_as::<_, DbConversation>(
            r#"
            INSERT INTO conversations (id, participant_a, participant_b, updated_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, participant_a, participant_b, updated_at
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(Uuid::from(conversation.participant_a))
        .bind(Uuid::from(conversation.participant_b))
        .bind(conversation.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(Conversation::from(row))
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query_as::<_, DbConversation>(
            r#"SELECT id, participant_a, participant_b, updated_at FROM conversations WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.map(Conversation::from))
    }

    async fn touch(&self, id: ConversationId, at: Timestamp) -> Result<(), RepositoryError> {
        let result = sqlx::query(r#"UPDATE conversations SET updated_at = $2 WHERE id = $1"#)
            .bind(Uuid::from(id))
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

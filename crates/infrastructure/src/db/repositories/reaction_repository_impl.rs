//! 消息表情回应仓储的 Postgres 实现

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{MessageId, Reaction, ReactionRepository, ReactionToggle, RepositoryError, UserId};
use uuid::Uuid;

use crate::db::{map_sqlx_err, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbReaction {
    message_id: Uuid,
    user_id: Uuid,
    emoji: String,
    created_at: DateTime<Utc>,
}

impl From<DbReaction> for Reaction {
    fn from(row: DbReaction) -> Self {
        Reaction {
            message_id: MessageId::from(row.message_id),
            user_id: UserId::from(row.user_id),
            emoji: row.emoji,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresReactionRepository {
    pool: Arc<DbPool>,
}

impl PostgresReactionRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReactionRepository for PostgresReactionRepository {
    async fn toggle(&self, reaction: Reaction) -> Result<ReactionToggle, RepositoryError> {
        // 读-改-写放进一个事务，行锁挡住同一用户的并发切换
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let existing: Option<String> = sqlx::query_scalar(
            r#"SELECT emoji FROM message_reactions WHERE message_id = $1 AND user_id = $2 FOR UPDATE"#,
        )
        .bind(Uuid::from(reaction.message_id))
        .bind(Uuid::from(reaction.user_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(Uuid::from(reaction.message_id))
                .bind(Uuid::from(reaction.user_id))
                .bind(&reaction.emoji)
                .bind(reaction.created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                ReactionToggle::Added
            }
            Some(current) if current == reaction.emoji => {
                sqlx::query(
                    r#"DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2"#,
                )
                .bind(Uuid::from(reaction.message_id))
                .bind(Uuid::from(reaction.user_id))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                ReactionToggle::Removed
            }
            Some(_) => {
                sqlx::query(
                    r#"
                    UPDATE message_reactions SET emoji = $3, created_at = $4
                    WHERE message_id = $1 AND user_id = $2
                    "#,
                )
                .bind(Uuid::from(reaction.message_id))
                .bind(Uuid::from(reaction.user_id))
                .bind(&reaction.emoji)
                .bind(reaction.created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                ReactionToggle::Replaced
            }
        };

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(outcome)
    }

    async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Reaction>, RepositoryError> {
        let rows = sqlx::query_as::<_, DbReaction>(
            r#"
            SELECT message_id, user_id, emoji, created_at
            FROM message_reactions
            WHERE message_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(Uuid::from(message_id))
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(Reaction::from).collect())
    }
}

//! 消息仓储的 Postgres 实现

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    ConversationId, Message, MessageContent, MessageId, MessageRepository, RepositoryError, UserId,
};
use uuid::Uuid;

use crate::db::{map_sqlx_err, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbMessage {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: String,
    read: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbMessage> for Message {
    type Error = RepositoryError;

    fn try_from(row: DbMessage) -> Result<Self, Self::Error> {
        let content = MessageContent::new(row.content)
            .map_err(|error| RepositoryError::serialization(error.to_string()))?;
        let mut message = Message::new(
            MessageId::from(row.id),
            ConversationId::from(row.conversation_id),
            UserId::from(row.sender_id),
            content,
            row.created_at,
        );
        message.read = row.read;
        Ok(message)
    }
}

#[derive(Clone)]
pub struct PostgresMessageRepository {
    pool: Arc<DbPool>,
}

impl PostgresMessageRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    async fn insert(&self, message: Message) -> Result<Message, RepositoryError> {
        let row = sqlx::query_as::<_, DbMessage>(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, conversation_id, sender_id, content, read, created_at
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.conversation_id))
        .bind(Uuid::from(message.sender_id))
        .bind(message.content.as_str())
        .bind(message.read)
        .bind(message.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(row)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query_as::<_, DbMessage>(
            r#"SELECT id, conversation_id, sender_id, content, read, created_at FROM messages WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(Message::try_from).transpose()
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let limit = limit.max(0);

        // 翻页游标不存在时不做截断，和无游标走同一条路
        let pivot: Option<(DateTime<Utc>, Uuid)> = match before {
            Some(before_id) => {
                sqlx::query_as(r#"SELECT created_at, id FROM messages WHERE id = $1"#)
                    .bind(Uuid::from(before_id))
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(map_sqlx_err)?
            }
            None => None,
        };

        let mut rows: Vec<DbMessage> = match pivot {
            Some((pivot_created_at, pivot_id)) => {
                sqlx::query_as::<_, DbMessage>(
                    r#"
                    SELECT id, conversation_id, sender_id, content, read, created_at
                    FROM messages
                    WHERE conversation_id = $1 AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(Uuid::from(conversation_id))
                .bind(pivot_created_at)
                .bind(pivot_id)
                .bind(limit)
                .fetch_all(&*self.pool)
                .await
                .map_err(map_sqlx_err)?
            }
            None => {
                sqlx::query_as::<_, DbMessage>(
                    r#"
                    SELECT id, conversation_id, sender_id, content, read, created_at
                    FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(Uuid::from(conversation_id))
                .bind(limit)
                .fetch_all(&*self.pool)
                .await
                .map_err(map_sqlx_err)?
            }
        };

        // 倒序扫描取最新一页，翻回升序交给调用方
        rows.reverse();
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn mark_read(&self, id: MessageId) -> Result<(), RepositoryError> {
        let result = sqlx::query(r#"UPDATE messages SET read = TRUE WHERE id = $1"#)
            .bind(Uuid::from(id))
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<Vec<MessageId>, RepositoryError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE messages SET read = TRUE
            WHERE conversation_id = $1 AND sender_id <> $2 AND read = FALSE
            RETURNING id
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(reader_id))
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(ids.into_iter().map(MessageId::from).collect())
    }
}

//! 通知仓储的 Postgres 实现

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Notification, NotificationId, NotificationRepository, RepositoryError, Timestamp, UserId,
};
use uuid::Uuid;

use crate::db::{map_sqlx_err, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbNotification {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    content: String,
    action_url: Option<String>,
    read: bool,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl From<DbNotification> for Notification {
    fn from(row: DbNotification) -> Self {
        Notification {
            id: NotificationId::from(row.id),
            user_id: UserId::from(row.user_id),
            kind: row.kind,
            content: row.content,
            action_url: row.action_url,
            read: row.read,
            created_at: row.created_at,
            read_at: row.read_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresNotificationRepository {
    pool: Arc<DbPool>,
}

impl PostgresNotificationRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for PostgresNotificationRepository {
    async fn create(&self, notification: Notification) -> Result<Notification, RepositoryError> {
        let row = sqlx::query_as::<_, DbNotification>(
            r#"
            INSERT INTO notifications (id, user_id, kind, content, action_url, read, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, user_id, kind, content, action_url, read, created_at, read_at
            "#,
        )
        .bind(Uuid::from(notification.id))
        .bind(Uuid::from(notification.user_id))
        .bind(&notification.kind)
        .bind(&notification.content)
        .bind(&notification.action_url)
        .bind(notification.read)
        .bind(notification.created_at)
        .bind(notification.read_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(Notification::from(row))
    }

    async fn mark_as_read(
        &self,
        id: NotificationId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE notifications SET read = TRUE, read_at = $2 WHERE id = $1 AND read = FALSE"#,
        )
        .bind(Uuid::from(id))
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        // 已读行不再更新，区分"不存在"要再查一次
        if result.rows_affected() == 0 {
            let exists: Option<Uuid> =
                sqlx::query_scalar(r#"SELECT id FROM notifications WHERE id = $1"#)
                    .bind(Uuid::from(id))
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(map_sqlx_err)?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound);
            }
        }
        Ok(())
    }

    async fn mark_read_by_action(
        &self,
        user_id: UserId,
        action_url: &str,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET read = TRUE, read_at = $3
            WHERE user_id = $1 AND action_url = $2 AND read = FALSE
            "#,
        )
        .bind(Uuid::from(user_id))
        .bind(action_url)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }

    async fn count_unread(&self, user_id: UserId) -> Result<i64, RepositoryError> {
        sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND read = FALSE"#,
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_err)
    }
}

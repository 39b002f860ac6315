//! 通话信令仓储的 Postgres 实现

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    CallSignal, CallSignalRepository, CallType, ConversationId, RepositoryError, SignalId,
    SignalPayload, SignalStatus, UserId,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::{map_sqlx_err, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbCallSignal {
    id: Uuid,
    conversation_id: Uuid,
    caller_id: Uuid,
    callee_id: Uuid,
    call_type: String,
    signal_type: String,
    signal_data: JsonValue,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbCallSignal> for CallSignal {
    type Error = RepositoryError;

    fn try_from(row: DbCallSignal) -> Result<Self, Self::Error> {
        let call_type = CallType::parse(&row.call_type)
            .map_err(|error| RepositoryError::serialization(error.to_string()))?;
        let payload = SignalPayload::from_parts(&row.signal_type, row.signal_data)
            .map_err(|error| RepositoryError::serialization(error.to_string()))?;
        let status = SignalStatus::parse(&row.status)
            .map_err(|error| RepositoryError::serialization(error.to_string()))?;

        Ok(CallSignal {
            id: SignalId::from(row.id),
            conversation_id: ConversationId::from(row.conversation_id),
            caller_id: UserId::from(row.caller_id),
            callee_id: UserId::from(row.callee_id),
            call_type,
            payload,
            status,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresCallSignalRepository {
    pool: Arc<DbPool>,
}

impl PostgresCallSignalRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallSignalRepository for PostgresCallSignalRepository {
    async fn insert(&self, signal: CallSignal) -> Result<CallSignal, RepositoryError> {
        let row = sqlx::query_as::<_, DbCallSignal>(
            r#"
            INSERT INTO call_signals
                (id, conversation_id, caller_id, callee_id, call_type, signal_type, signal_data, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, conversation_id, caller_id, callee_id, call_type, signal_type, signal_data, status, created_at
            "#,
        )
        .bind(Uuid::from(signal.id))
        .bind(Uuid::from(signal.conversation_id))
        .bind(Uuid::from(signal.caller_id))
        .bind(Uuid::from(signal.callee_id))
        .bind(signal.call_type.to_string())
        .bind(signal.signal_type())
        .bind(signal.payload.data())
        .bind(signal.status.to_string())
        .bind(signal.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        CallSignal::try_from(row)
    }

    async fn find_by_id(&self, id: SignalId) -> Result<Option<CallSignal>, RepositoryError> {
        let row = sqlx::query_as::<_, DbCallSignal>(
            r#"
            SELECT id, conversation_id, caller_id, callee_id, call_type, signal_type, signal_data, status, created_at
            FROM call_signals WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(CallSignal::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: SignalId,
        status: SignalStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(r#"UPDATE call_signals SET status = $2 WHERE id = $1"#)
            .bind(Uuid::from(id))
            .bind(status.to_string())
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn supersede_pending_offers(
        &self,
        caller_id: UserId,
        callee_id: UserId,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE call_signals SET status = 'ended'
            WHERE caller_id = $1 AND callee_id = $2
              AND signal_type = 'offer' AND status = 'pending'
            "#,
        )
        .bind(Uuid::from(caller_id))
        .bind(Uuid::from(callee_id))
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }
}

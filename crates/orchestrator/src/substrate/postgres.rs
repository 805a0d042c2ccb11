//! PostgreSQL substrate and state store
//!
//! One pool backs both traits:
//! - `switchyard_messages` is the append-only message log, `seq` gives offsets
//! - `switchyard_checkpoints` holds one row per workflow with a version column
//!   for optimistic concurrency
//! - `switchyard_dead_letters` is insert-only

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::broker::DeadLetterMessage;
use crate::message::{Message, MessageId, MessageStatus};
use crate::workflow::WorkflowCheckpoint;

/// PostgreSQL implementation of [`SubstrateAdapter`] and [`StateStore`]
///
/// Offsets are `seq - 1`, so the first appended message has offset 0 as
/// with the in-memory substrate.
///
/// # Example
///
/// ```ignore
/// use switchyard_orchestrator::PostgresSubstrate;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/switchyard").await?;
/// let substrate = PostgresSubstrate::new(pool);
/// substrate.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresSubstrate {
    pool: PgPool,
}

impl PostgresSubstrate {
    /// Create a new substrate with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with default pool settings
    pub async fn connect(database_url: &str) -> Result<Self, SubstrateError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            SubstrateError::Unavailable(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), SubstrateError> {
        sqlx::raw_sql(include_str!("../../migrations/0001_switchyard.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                SubstrateError::Database(e.to_string())
            })?;
        Ok(())
    }
}

// =============================================================================
// Message log
// =============================================================================

#[async_trait]
impl SubstrateAdapter for PostgresSubstrate {
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn append(&self, message: &Message) -> Result<Offset, SubstrateError> {
        let envelope = serde_json::to_value(message)
            .map_err(|e| SubstrateError::Serialization(e.to_string()))?;

        // the no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(
            r#"
            INSERT INTO switchyard_messages
                (id, message_type, tenant_id, status, attempt_count, envelope, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
            RETURNING seq
            "#,
        )
        .bind(message.id)
        .bind(&message.message_type)
        .bind(message.tenant_id.as_str())
        .bind(message.status.as_str())
        .bind(message.attempt_count as i32)
        .bind(&envelope)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to append message: {}", e);
            SubstrateError::Database(e.to_string())
        })?;

        let seq: i64 = row.get("seq");
        debug!(seq, "appended message");
        Ok((seq - 1) as Offset)
    }

    fn read_from(&self, offset: Offset) -> BoxStream<'_, Result<SubstrateRecord, SubstrateError>> {
        sqlx::query(
            r#"
            SELECT seq, envelope, status, attempt_count
            FROM switchyard_messages
            WHERE seq > $1
            ORDER BY seq
            "#,
        )
        .bind(offset as i64)
        .fetch(&self.pool)
        .map(|row| {
            let row = row.map_err(|e| {
                error!("Failed to read message log: {}", e);
                SubstrateError::Database(e.to_string())
            })?;
            decode_record(&row)
        })
        .boxed()
    }

    #[instrument(skip(self))]
    async fn record_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        attempt_count: u32,
    ) -> Result<(), SubstrateError> {
        let result = sqlx::query(
            r#"
            UPDATE switchyard_messages
            SET status = $2, attempt_count = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(attempt_count as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record message status: {}", e);
            SubstrateError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(SubstrateError::MessageNotFound(message_id));
        }
        Ok(())
    }
}

fn decode_record(row: &PgRow) -> Result<SubstrateRecord, SubstrateError> {
    let seq: i64 = row.get("seq");
    let envelope: serde_json::Value = row.get("envelope");
    let status: String = row.get("status");
    let attempt_count: i32 = row.get("attempt_count");

    let mut message: Message = serde_json::from_value(envelope)
        .map_err(|e| SubstrateError::Serialization(e.to_string()))?;
    message.status = status
        .parse()
        .map_err(|e: String| SubstrateError::Database(e))?;
    message.attempt_count = attempt_count.max(0) as u32;

    Ok(SubstrateRecord {
        offset: (seq - 1) as Offset,
        message,
    })
}

// =============================================================================
// Checkpoints and dead letters
// =============================================================================

#[async_trait]
impl StateStore for PostgresSubstrate {
    #[instrument(skip(self, checkpoint), fields(workflow_id = %checkpoint.workflow_id(), version = checkpoint.version))]
    async fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        let workflow_id = checkpoint.workflow_id();
        let instance = &checkpoint.instance;
        let snapshot = serde_json::to_value(checkpoint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = if checkpoint.version == 1 {
            sqlx::query(
                r#"
                INSERT INTO switchyard_checkpoints
                    (workflow_id, definition_id, tenant_id, status, version, checkpoint, created_at, saved_at)
                VALUES ($1, $2, $3, $4, 1, $5, $6, $7)
                ON CONFLICT (workflow_id) DO NOTHING
                "#,
            )
            .bind(workflow_id)
            .bind(&instance.definition_id)
            .bind(instance.tenant_id.as_str())
            .bind(instance.status.as_str())
            .bind(&snapshot)
            .bind(instance.created_at)
            .bind(checkpoint.saved_at)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE switchyard_checkpoints
                SET status = $2, version = $3, checkpoint = $4, saved_at = $5
                WHERE workflow_id = $1 AND version = $6
                "#,
            )
            .bind(workflow_id)
            .bind(instance.status.as_str())
            .bind(checkpoint.version as i64)
            .bind(&snapshot)
            .bind(checkpoint.saved_at)
            .bind(checkpoint.version as i64 - 1)
            .execute(&self.pool)
            .await
        }
        .map_err(|e| {
            error!("Failed to save checkpoint: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            let actual = self.stored_version(workflow_id).await?;
            return Err(StoreError::ConcurrencyConflict {
                workflow_id,
                expected: checkpoint.version.saturating_sub(1),
                actual,
            });
        }

        debug!(status = %instance.status, "saved checkpoint");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_checkpoint(&self, workflow_id: Uuid) -> Result<WorkflowCheckpoint, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT checkpoint FROM switchyard_checkpoints WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load checkpoint: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        decode_json(&row, "checkpoint")
    }

    #[instrument(skip(self))]
    async fn list_checkpoints(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowCheckpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT checkpoint
            FROM switchyard_checkpoints
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR definition_id = $2)
              AND ($3::text IS NULL OR tenant_id = $3)
            ORDER BY created_at, workflow_id
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.definition_id.as_deref())
        .bind(filter.tenant_id.as_ref().map(|t| t.as_str()))
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list checkpoints: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(|row| decode_json(row, "checkpoint")).collect()
    }

    #[instrument(skip(self, entry), fields(dead_letter_id = %entry.id, message_id = %entry.message.id))]
    async fn put_dead_letter(&self, entry: &DeadLetterMessage) -> Result<(), StoreError> {
        let json =
            serde_json::to_value(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO switchyard_dead_letters
                (id, message_id, message_type, tenant_id, handler, entry, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.message.id)
        .bind(&entry.message.message_type)
        .bind(entry.message.tenant_id.as_str())
        .bind(&entry.handler)
        .bind(&json)
        .bind(entry.dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store dead letter: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterMessage>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT entry FROM switchyard_dead_letters WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get dead letter: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.map(|row| decode_json(&row, "entry")).transpose()
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry
            FROM switchyard_dead_letters
            WHERE ($1::text IS NULL OR message_type = $1)
              AND ($2::text IS NULL OR tenant_id = $2)
              AND ($3::timestamptz IS NULL OR dead_lettered_at >= $3)
              AND ($4::timestamptz IS NULL OR dead_lettered_at < $4)
              AND ($5::uuid IS NULL OR message_id = $5)
            ORDER BY dead_lettered_at, id
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(filter.message_type.as_deref())
        .bind(filter.tenant_id.as_ref().map(|t| t.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.message_id)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list dead letters: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(|row| decode_json(row, "entry")).collect()
    }

    #[instrument(skip(self))]
    async fn count_dead_letters(&self, filter: DeadLetterFilter) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM switchyard_dead_letters
            WHERE ($1::text IS NULL OR message_type = $1)
              AND ($2::text IS NULL OR tenant_id = $2)
              AND ($3::timestamptz IS NULL OR dead_lettered_at >= $3)
              AND ($4::timestamptz IS NULL OR dead_lettered_at < $4)
              AND ($5::uuid IS NULL OR message_id = $5)
            "#,
        )
        .bind(filter.message_type.as_deref())
        .bind(filter.tenant_id.as_ref().map(|t| t.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count dead letters: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let count: i64 = row.get("count");
        Ok(count.max(0) as u64)
    }
}

impl PostgresSubstrate {
    async fn stored_version(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT version FROM switchyard_checkpoints WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read checkpoint version: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map_or(0, |row| row.get::<i64, _>("version").max(0) as u64))
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let value: serde_json::Value = row.get(column);
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

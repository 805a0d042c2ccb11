//! Substrate and state store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::broker::DeadLetterMessage;
use crate::message::{Message, MessageId, MessageStatus, TenantId};
use crate::workflow::{WorkflowCheckpoint, WorkflowStatus};

/// Position of a message in the append-only log
pub type Offset = u64;

/// Error type for substrate operations
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// The backing store is not reachable
    #[error("substrate unavailable: {0}")]
    Unavailable(String),

    /// Status update for a message that was never appended
    #[error("message not found in substrate: {0}")]
    MessageNotFound(MessageId),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Error type for checkpoint and dead letter persistence
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow checkpoint not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on workflow {workflow_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        workflow_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A message read back from the log, with its latest recorded status
#[derive(Debug, Clone)]
pub struct SubstrateRecord {
    pub offset: Offset,
    pub message: Message,
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Pagination {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }
}

/// Filter for listing dead letters
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub message_type: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub message_id: Option<MessageId>,
    /// Inclusive lower bound on `dead_lettered_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `dead_lettered_at`
    pub until: Option<DateTime<Utc>>,
}

impl DeadLetterFilter {
    pub fn for_type(message_type: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type.into()),
            ..Default::default()
        }
    }

    /// Entries of one message, one per handler that gave up on it
    pub fn for_message(message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Whether an entry passes this filter
    pub fn matches(&self, entry: &DeadLetterMessage) -> bool {
        self.message_type
            .as_ref()
            .map_or(true, |t| *t == entry.message.message_type)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| *t == entry.message.tenant_id)
            && self.message_id.map_or(true, |id| id == entry.message.id)
            && self.since.map_or(true, |since| entry.dead_lettered_at >= since)
            && self.until.map_or(true, |until| entry.dead_lettered_at < until)
    }
}

/// Filter for listing workflow checkpoints
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub definition_id: Option<String>,
    pub tenant_id: Option<TenantId>,
}

impl WorkflowFilter {
    pub fn with_status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, checkpoint: &WorkflowCheckpoint) -> bool {
        let instance = &checkpoint.instance;
        self.status.map_or(true, |s| s == instance.status)
            && self
                .definition_id
                .as_ref()
                .map_or(true, |d| *d == instance.definition_id)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| *t == instance.tenant_id)
    }
}

/// Append-only log the broker writes every message to before dispatch
///
/// Implementations must be thread-safe and preserve append order per
/// process: offsets returned by `append` are strictly increasing.
#[async_trait]
pub trait SubstrateAdapter: Send + Sync + 'static {
    /// Durably record a message, returning its offset
    async fn append(&self, message: &Message) -> Result<Offset, SubstrateError>;

    /// Stream every message at or after `offset`, in offset order
    fn read_from(&self, offset: Offset) -> BoxStream<'_, Result<SubstrateRecord, SubstrateError>>;

    /// Record a lifecycle change for an appended message
    async fn record_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        attempt_count: u32,
    ) -> Result<(), SubstrateError>;
}

/// Key-value persistence for workflow checkpoints and dead letters
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Checkpoints
    // =========================================================================

    /// Persist a checkpoint (with optimistic concurrency)
    ///
    /// `checkpoint.version` must be exactly one more than the stored
    /// version, or 1 for a new workflow.
    async fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError>;

    /// Load the latest checkpoint of a workflow
    async fn load_checkpoint(&self, workflow_id: Uuid) -> Result<WorkflowCheckpoint, StoreError>;

    /// List checkpoints, oldest workflow first
    async fn list_checkpoints(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowCheckpoint>, StoreError>;

    // =========================================================================
    // Dead Letters
    // =========================================================================

    /// Append a dead letter; entries are never updated afterwards
    async fn put_dead_letter(&self, entry: &DeadLetterMessage) -> Result<(), StoreError>;

    /// Fetch one dead letter
    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterMessage>, StoreError>;

    /// List dead letters, oldest first
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterMessage>, StoreError>;

    /// Count dead letters matching a filter
    async fn count_dead_letters(&self, filter: DeadLetterFilter) -> Result<u64, StoreError>;
}

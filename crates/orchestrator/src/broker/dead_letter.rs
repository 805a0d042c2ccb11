//! Dead letter entries and the read-only inspection API

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::HandlerError;
use crate::message::{Message, MessageStatus};
use crate::substrate::{DeadLetterFilter, Pagination, StateStore, StoreError};

/// A message that exhausted its delivery budget
///
/// Written once when the last attempt fails and never updated. The core
/// never re-publishes dead letters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: Uuid,

    /// The message as it stood after the final attempt
    pub message: Message,

    /// Subscription that kept failing
    pub handler: String,

    pub failure_reason: String,

    pub last_error: HandlerError,

    /// Retries made after the first delivery
    pub retry_count: u32,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub(crate) fn new(
        mut message: Message,
        handler: impl Into<String>,
        attempts: u32,
        last_error: HandlerError,
    ) -> Self {
        message.status = MessageStatus::DeadLettered;
        message.attempt_count = attempts;
        Self {
            id: Uuid::now_v7(),
            message,
            handler: handler.into(),
            failure_reason: format!("delivery budget exhausted after {attempts} attempt(s)"),
            last_error,
            retry_count: attempts.saturating_sub(1),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Read-only view over stored dead letters for operational tooling
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn StateStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// List entries, oldest first
    pub async fn list(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterMessage>, StoreError> {
        self.store.list_dead_letters(filter, pagination).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DeadLetterMessage>, StoreError> {
        self.store.get_dead_letter(id).await
    }

    pub async fn count(&self, filter: DeadLetterFilter) -> Result<u64, StoreError> {
        self.store.count_dead_letters(filter).await
    }

    /// Dead letters of one message
    pub async fn for_message(&self, message_id: Uuid) -> Result<Vec<DeadLetterMessage>, StoreError> {
        self.store
            .list_dead_letters(DeadLetterFilter::for_message(message_id), Pagination::default())
            .await
    }
}

//! In-memory substrate and state store for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::broker::DeadLetterMessage;
use crate::message::{Message, MessageId, MessageStatus};
use crate::workflow::WorkflowCheckpoint;

#[derive(Default)]
struct Log {
    messages: Vec<Message>,
    positions: HashMap<MessageId, usize>,
}

/// In-memory append-only log
///
/// Offsets are positions in the log, starting at 0. Appending a message
/// whose id is already present returns the original offset. The log can be
/// switched to unavailable to exercise substrate failure paths.
///
/// # Example
///
/// ```
/// use switchyard_orchestrator::InMemorySubstrate;
///
/// let substrate = InMemorySubstrate::new();
/// assert!(substrate.is_empty());
/// ```
#[derive(Default)]
pub struct InMemorySubstrate {
    log: RwLock<Log>,
    unavailable: AtomicBool,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` (or recover)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.log.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded status of a message
    pub fn status_of(&self, message_id: MessageId) -> Option<MessageStatus> {
        let log = self.log.read();
        log.positions
            .get(&message_id)
            .map(|&pos| log.messages[pos].status)
    }

    /// Snapshot of every message in offset order
    pub fn messages(&self) -> Vec<Message> {
        self.log.read().messages.clone()
    }

    fn check_available(&self) -> Result<(), SubstrateError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SubstrateError::Unavailable(
                "in-memory substrate marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SubstrateAdapter for InMemorySubstrate {
    async fn append(&self, message: &Message) -> Result<Offset, SubstrateError> {
        self.check_available()?;

        let mut log = self.log.write();
        if let Some(&pos) = log.positions.get(&message.id) {
            return Ok(pos as Offset);
        }

        let pos = log.messages.len();
        log.messages.push(message.clone());
        log.positions.insert(message.id, pos);
        Ok(pos as Offset)
    }

    fn read_from(&self, offset: Offset) -> BoxStream<'_, Result<SubstrateRecord, SubstrateError>> {
        if let Err(e) = self.check_available() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let records: Vec<_> = self
            .log
            .read()
            .messages
            .iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(pos, message)| {
                Ok(SubstrateRecord {
                    offset: pos as Offset,
                    message: message.clone(),
                })
            })
            .collect();

        stream::iter(records).boxed()
    }

    async fn record_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        attempt_count: u32,
    ) -> Result<(), SubstrateError> {
        self.check_available()?;

        let mut log = self.log.write();
        let pos = *log
            .positions
            .get(&message_id)
            .ok_or(SubstrateError::MessageNotFound(message_id))?;
        let message = &mut log.messages[pos];
        message.status = status;
        message.attempt_count = attempt_count;
        Ok(())
    }
}

/// In-memory checkpoint and dead letter store
///
/// Same semantics as the PostgreSQL implementation, including optimistic
/// versioning of checkpoints.
#[derive(Default)]
pub struct InMemoryStateStore {
    checkpoints: RwLock<HashMap<Uuid, WorkflowCheckpoint>>,
    dead_letters: RwLock<Vec<DeadLetterMessage>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.checkpoints.write().clear();
        self.dead_letters.write().clear();
    }
}

fn page<T>(items: impl Iterator<Item = T>, pagination: &Pagination) -> Vec<T> {
    items
        .skip(pagination.offset as usize)
        .take(pagination.limit as usize)
        .collect()
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        let workflow_id = checkpoint.workflow_id();
        let mut checkpoints = self.checkpoints.write();

        let stored = checkpoints.get(&workflow_id).map_or(0, |c| c.version);
        if checkpoint.version != stored + 1 {
            return Err(StoreError::ConcurrencyConflict {
                workflow_id,
                expected: checkpoint.version.saturating_sub(1),
                actual: stored,
            });
        }

        checkpoints.insert(workflow_id, checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, workflow_id: Uuid) -> Result<WorkflowCheckpoint, StoreError> {
        self.checkpoints
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn list_checkpoints(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowCheckpoint>, StoreError> {
        let checkpoints = self.checkpoints.read();
        let mut matching: Vec<_> = checkpoints
            .values()
            .filter(|c| filter.matches(c))
            .collect();
        matching.sort_by_key(|c| (c.instance.created_at, c.instance.id));

        Ok(page(matching.into_iter().cloned(), &pagination))
    }

    async fn put_dead_letter(&self, entry: &DeadLetterMessage) -> Result<(), StoreError> {
        self.dead_letters.write().push(entry.clone());
        Ok(())
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterMessage>, StoreError> {
        Ok(self
            .dead_letters
            .read()
            .iter()
            .find(|entry| entry.id == id)
            .cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let entries = self.dead_letters.read();
        Ok(page(
            entries.iter().filter(|e| filter.matches(e)).cloned(),
            &pagination,
        ))
    }

    async fn count_dead_letters(&self, filter: DeadLetterFilter) -> Result<u64, StoreError> {
        Ok(self
            .dead_letters
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .count() as u64)
    }
}

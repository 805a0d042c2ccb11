//! Pending request/response waiters keyed by correlation id

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::HandlerError;
use crate::message::{CorrelationId, Message, TenantId};

/// What a waiter eventually receives
pub(crate) type Reply = Result<Message, HandlerError>;

struct Waiter {
    tx: oneshot::Sender<Reply>,
    tenant: TenantId,
    deadline: Instant,
}

/// Matches replies to the callers waiting on them
///
/// Each correlation id maps to at most one waiter. Insert, resolve and
/// expiry of one id are serialized by the map's shard lock.
#[derive(Default)]
pub struct CorrelationTracker {
    waiters: DashMap<CorrelationId, Waiter>,
}

/// Correlation id already has a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("correlation id {0} is already in flight")]
pub struct DuplicateCorrelation(pub CorrelationId);

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter that gives up after `timeout`
    ///
    /// The returned guard removes the waiter when dropped, so a caller that
    /// times out or is cancelled never leaves an entry behind.
    pub(crate) fn register(
        &self,
        correlation_id: CorrelationId,
        tenant: TenantId,
        timeout: Duration,
    ) -> Result<PendingReply<'_>, DuplicateCorrelation> {
        let (tx, rx) = oneshot::channel();
        match self.waiters.entry(correlation_id) {
            Entry::Occupied(_) => return Err(DuplicateCorrelation(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(Waiter {
                    tx,
                    tenant,
                    deadline: Instant::now() + timeout,
                });
            }
        }

        Ok(PendingReply {
            tracker: self,
            correlation_id,
            rx,
        })
    }

    /// Hand a reply to its waiter
    ///
    /// Returns false when nobody is waiting any more (timed out or
    /// dropped); the caller logs and discards the reply.
    pub(crate) fn resolve(&self, correlation_id: CorrelationId, tenant: &TenantId, reply: Reply) -> bool {
        match self
            .waiters
            .remove_if(&correlation_id, |_, waiter| &waiter.tenant == tenant)
        {
            Some((_, waiter)) => waiter.tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop waiters whose deadline has passed, returning how many
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.waiters.len();
        self.waiters.retain(|_, waiter| waiter.deadline > now);
        let expired = before.saturating_sub(self.waiters.len());
        if expired > 0 {
            debug!(expired, "expired stale correlation waiters");
        }
        expired
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.waiters.contains_key(correlation_id)
    }

    /// Number of requests waiting for a reply
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

/// A registered waiter; dropping it unregisters
pub(crate) struct PendingReply<'a> {
    tracker: &'a CorrelationTracker,
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply<'_> {
    /// Wait for the reply; `None` if the waiter was expired
    pub(crate) async fn recv(&mut self) -> Option<Reply> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.tracker.waiters.remove(&self.correlation_id);
    }
}

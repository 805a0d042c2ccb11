//! Per-key dispatch lanes
//!
//! Every lane key (`type` or `type#ordering_key`) has at most one worker
//! at a time. The worker drains the lane's queue one message at a time,
//! highest priority first and in substrate order within a priority, and
//! retires the lane once it is empty.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::message::{Message, Priority};
use crate::substrate::Offset;

/// A message waiting in a lane
#[derive(Debug)]
pub(crate) struct Queued {
    pub offset: Offset,
    pub message: Message,
}

impl Queued {
    fn priority(&self) -> Priority {
        self.message.priority
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // max-heap: higher priority first, then lower offset first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.offset.cmp(&self.offset))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Lane {
    queue: Mutex<BinaryHeap<Queued>>,
}

impl Lane {
    pub fn pop(&self) -> Option<Queued> {
        self.queue.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// All active lanes
#[derive(Default)]
pub(crate) struct Lanes {
    lanes: DashMap<String, Arc<Lane>>,
}

impl Lanes {
    /// Queue a message; returns the lane when the caller must start a worker
    pub fn enqueue(&self, key: String, item: Queued) -> Option<Arc<Lane>> {
        let mut created = false;
        let entry = self.lanes.entry(key).or_insert_with(|| {
            created = true;
            Arc::new(Lane::default())
        });
        entry.queue.lock().push(item);
        created.then(|| Arc::clone(&entry))
    }

    /// Retire an idle lane
    ///
    /// Returns false if messages arrived since the worker's last pop; the
    /// worker must keep draining. The check and removal happen under the
    /// map's lock for this key, so an `enqueue` either lands before
    /// retirement (and is seen here) or creates a fresh lane with its own
    /// worker.
    pub fn retire(&self, key: &str) -> bool {
        self.lanes
            .remove_if(key, |_, lane| lane.queue.lock().is_empty())
            .is_some()
    }

    pub fn active(&self) -> usize {
        self.lanes.len()
    }

    /// Messages waiting across all lanes
    pub fn queued(&self) -> usize {
        self.lanes.iter().map(|lane| lane.len()).sum()
    }
}

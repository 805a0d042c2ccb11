//! Lane workers and the per-message delivery algorithm

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::correlation::CorrelationTracker;
use super::lane::{Lane, Lanes, Queued};
use super::{DeadLetterMessage, HandlerError, HandlerRegistry, HandlerResult, Subscription};
use crate::config::BrokerConfig;
use crate::message::{Message, MessageId, MessagePattern, MessageStatus};
use crate::reliability::RetryPolicy;
use crate::substrate::{Offset, StateStore, SubstrateAdapter};

/// Last known lifecycle state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    pub status: MessageStatus,
    /// Failed delivery attempts so far
    pub attempt_count: u32,
}

#[derive(Default)]
pub(super) struct Counters {
    pub published: AtomicU64,
    pub acknowledged: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// How one subscription's delivery ended
enum Outcome {
    Delivered(serde_json::Value),
    Exhausted { failures: u32, error: HandlerError },
    Interrupted,
}

/// Shared broker state
pub(super) struct BrokerInner {
    pub substrate: Arc<dyn SubstrateAdapter>,
    pub store: Arc<dyn StateStore>,
    pub registry: HandlerRegistry,
    pub tracker: CorrelationTracker,
    pub lanes: Lanes,
    /// Held across append and enqueue so a lane sees its messages in log order
    pub publish_locks: DashMap<String, Arc<Mutex<()>>>,
    pub config: BrokerConfig,
    pub in_flight: Semaphore,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    pub ledger: DashMap<MessageId, DeliveryState>,
    pub counters: Counters,
}

impl BrokerInner {
    pub fn publish_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.publish_locks
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock for `key` unless another publisher still holds a handle
    pub fn release_publish_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        self.publish_locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
    }

    /// Queue a durably written message on its lane, starting a worker if idle
    pub fn enqueue(self: &Arc<Self>, offset: Offset, message: Message) {
        let key = message.lane_key();
        if let Some(lane) = self.lanes.enqueue(key.clone(), Queued { offset, message }) {
            let inner = Arc::clone(self);
            self.tasks.spawn(async move { inner.run_lane(key, lane).await });
        }
    }

    async fn run_lane(self: Arc<Self>, key: String, lane: Arc<Lane>) {
        debug!(lane = %key, "lane worker started");
        loop {
            if self.shutdown.is_cancelled() {
                debug!(lane = %key, queued = lane.len(), "lane worker stopped by shutdown");
                return;
            }

            match lane.pop() {
                Some(item) => self.dispatch(item.message).await,
                None => {
                    if self.lanes.retire(&key) {
                        debug!(lane = %key, "lane drained");
                        return;
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(message_id = %message.id, message_type = %message.message_type))]
    async fn dispatch(&self, message: Message) {
        if self.requester_gone(&message) {
            debug!("requester stopped waiting, acknowledging without delivery");
            Counters::incr(&self.counters.acknowledged);
            self.record_status(message.id, MessageStatus::Acknowledged, message.attempt_count)
                .await;
            return;
        }

        let subscriptions = self.registry.handlers_for(&message);

        if subscriptions.is_empty() {
            warn!(pattern = %message.pattern, "no handler registered, acknowledging message");
            if message.pattern == MessagePattern::RequestResponse {
                self.reply(
                    &message,
                    Err(HandlerError::new("no handler registered").with_type("no_handler")),
                );
            }
            self.record_status(message.id, MessageStatus::Acknowledged, message.attempt_count)
                .await;
            return;
        }

        self.record_status(message.id, MessageStatus::Dispatched, message.attempt_count)
            .await;

        let policy = self.config.policy_for(&message.message_type).clone();
        let outcomes = join_all(
            subscriptions
                .iter()
                .map(|sub| self.deliver(&message, sub, &policy)),
        )
        .await;

        let mut interrupted = false;
        let mut dead_lettered = false;
        let mut max_failures = message.attempt_count;

        for (sub, outcome) in subscriptions.iter().zip(outcomes) {
            match outcome {
                Outcome::Delivered(output) => {
                    if message.pattern == MessagePattern::RequestResponse {
                        self.reply(&message, Ok(output));
                    }
                }
                Outcome::Exhausted { failures, error } => {
                    dead_lettered = true;
                    max_failures = max_failures.max(failures);
                    self.dead_letter(&message, sub, failures, error.clone()).await;
                    if message.pattern == MessagePattern::RequestResponse {
                        self.reply(&message, Err(error));
                    }
                }
                Outcome::Interrupted => interrupted = true,
            }
        }

        if interrupted {
            // left non-terminal so recovery redelivers it
            return;
        }

        if dead_lettered {
            self.record_status(message.id, MessageStatus::DeadLettered, max_failures)
                .await;
        } else {
            Counters::incr(&self.counters.acknowledged);
            self.record_status(message.id, MessageStatus::Acknowledged, max_failures)
                .await;
        }
    }

    /// Deliver to one subscription, retrying until success or budget exhaustion
    async fn deliver(&self, message: &Message, sub: &Subscription, policy: &RetryPolicy) -> Outcome {
        let mut failures = message.attempt_count;

        loop {
            let mut attempt = message.clone();
            attempt.status = MessageStatus::Dispatched;
            attempt.attempt_count = failures;

            let error = match self.invoke(sub, &attempt).await {
                Ok(output) => {
                    debug!(handler = %sub.name, failures, "handler succeeded");
                    return Outcome::Delivered(output);
                }
                Err(error) => error,
            };

            failures += 1;
            if !policy.has_attempts_remaining(failures) {
                warn!(
                    handler = %sub.name,
                    attempts = failures,
                    error = %error,
                    "delivery budget exhausted"
                );
                return Outcome::Exhausted { failures, error };
            }
            if self.requester_gone(message) {
                warn!(
                    handler = %sub.name,
                    attempts = failures,
                    error = %error,
                    "requester stopped waiting, not retrying"
                );
                return Outcome::Exhausted { failures, error };
            }

            let delay = policy.delay_for_attempt(failures + 1);
            warn!(
                handler = %sub.name,
                attempt = failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "handler failed, scheduling retry"
            );
            Counters::incr(&self.counters.retried);
            self.record_status(message.id, MessageStatus::Failed, failures)
                .await;

            tokio::select! {
                _ = self.shutdown.cancelled() => return Outcome::Interrupted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One handler call under the in-flight limit and handler timeout
    async fn invoke(&self, sub: &Subscription, message: &Message) -> HandlerResult {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| HandlerError::new("broker closed"))?;

        let call = AssertUnwindSafe(sub.handler.handle(message)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(handler = %sub.name, message_id = %message.id, "handler panicked");
                Err(HandlerError::panicked())
            }
            Err(_) => Err(HandlerError::timeout(self.config.handler_timeout)),
        }
    }

    async fn dead_letter(&self, message: &Message, sub: &Subscription, failures: u32, error: HandlerError) {
        let entry = DeadLetterMessage::new(message.clone(), sub.name.clone(), failures, error);
        Counters::incr(&self.counters.dead_lettered);

        match self.store.put_dead_letter(&entry).await {
            Ok(()) => info!(
                dead_letter_id = %entry.id,
                handler = %sub.name,
                retry_count = entry.retry_count,
                "message dead-lettered"
            ),
            Err(e) => error!(
                message_id = %message.id,
                handler = %sub.name,
                error = %e,
                "failed to store dead letter"
            ),
        }
    }

    /// A request whose caller timed out or went away; its reply has nowhere to go
    fn requester_gone(&self, message: &Message) -> bool {
        message.pattern == MessagePattern::RequestResponse
            && message
                .correlation_id
                .is_some_and(|id| !self.tracker.is_pending(&id))
    }

    /// Route a handler result back to the waiting requester, if any
    fn reply(&self, request: &Message, result: HandlerResult) {
        let Some(correlation_id) = request.correlation_id else {
            return;
        };

        let reply = result.map(|output| Message::reply_to(request, output));
        if !self.tracker.resolve(correlation_id, &request.tenant_id, reply) {
            warn!(
                %correlation_id,
                message_id = %request.id,
                "no waiter for reply, discarding"
            );
        }
    }

    pub async fn record_status(&self, message_id: MessageId, status: MessageStatus, attempt_count: u32) {
        self.ledger.insert(
            message_id,
            DeliveryState {
                status,
                attempt_count,
            },
        );

        if let Err(e) = self
            .substrate
            .record_status(message_id, status, attempt_count)
            .await
        {
            warn!(%message_id, %status, error = %e, "failed to record message status");
        }
    }
}

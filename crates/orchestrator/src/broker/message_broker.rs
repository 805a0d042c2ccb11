//! Message broker: publish, subscribe, request and recovery

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::correlation::{CorrelationTracker, DuplicateCorrelation};
use super::dispatch::{BrokerInner, Counters, DeliveryState};
use super::lane::Lanes;
use super::{
    DeadLetterQueue, FnHandler, HandlerError, HandlerRegistry, HandlerResult, MessageHandler,
    RegistryError, SubscribeOptions, SubscriptionId, TypedHandler,
};
use crate::config::BrokerConfig;
use crate::message::{
    EnvelopeError, Message, MessageId, MessagePattern, MessageStatus, PayloadError, TypedPayload,
};
use crate::substrate::{StateStore, SubstrateAdapter, SubstrateError};

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The message was not durably recorded; nothing was dispatched
    #[error("failed to write message to substrate: {0}")]
    SubstrateWrite(#[source] SubstrateError),

    /// Replay could not read the log
    #[error("failed to read substrate: {0}")]
    SubstrateRead(#[source] SubstrateError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Correlation(#[from] DuplicateCorrelation),

    /// `request` for a type nobody answers
    #[error("no request-response handler registered for {message_type}")]
    NoHandler { message_type: String },

    /// No reply within the caller's timeout; a later reply is discarded
    #[error("request {message_id} timed out after {}ms", timeout.as_millis())]
    RequestTimeout {
        message_id: MessageId,
        timeout: Duration,
    },

    /// The handler exhausted its delivery budget
    #[error("request {message_id} failed: {error}")]
    HandlerFailed {
        message_id: MessageId,
        error: HandlerError,
    },

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("broker shutdown timed out with work still running")]
    ShutdownTimeout,
}

/// Point-in-time broker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub published: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub pending_requests: usize,
    pub active_lanes: usize,
    pub queued: usize,
}

/// Routes typed messages between components
///
/// Every published message is appended to the substrate before dispatch,
/// then delivered on its lane: one worker per lane key, strict write order
/// within a priority, concurrent across keys. Failed deliveries are retried
/// per the type's [`RetryPolicy`](crate::RetryPolicy) and dead-lettered when
/// the budget runs out.
///
/// Cloning is cheap; clones share the same broker.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use serde_json::json;
/// use switchyard_orchestrator::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MessageBroker::new(
///     Arc::new(InMemorySubstrate::new()),
///     Arc::new(InMemoryStateStore::new()),
///     BrokerConfig::default(),
/// );
///
/// broker.subscribe_fn("math.double", MessagePattern::RequestResponse, |msg: Message| async move {
///     let n = msg.payload.as_i64().unwrap_or_default();
///     Ok(json!(n * 2))
/// })?;
///
/// let request = Message::new("math.double", MessagePattern::RequestResponse, json!(21));
/// let reply = broker.request(request, Duration::from_secs(1)).await?;
/// assert_eq!(reply.payload, json!(42));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
    sweeper: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl MessageBroker {
    pub fn new(
        substrate: Arc<dyn SubstrateAdapter>,
        store: Arc<dyn StateStore>,
        config: BrokerConfig,
    ) -> Self {
        let inner = BrokerInner {
            substrate,
            store,
            registry: HandlerRegistry::new(),
            tracker: CorrelationTracker::new(),
            lanes: Lanes::default(),
            publish_locks: DashMap::new(),
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ledger: DashMap::new(),
            counters: Counters::default(),
        };

        Self {
            inner: Arc::new(inner),
            sweeper: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Durably record a message and schedule its dispatch
    ///
    /// Returns once the substrate accepted the message; handlers run
    /// asynchronously.
    #[instrument(skip(self, message), fields(message_type = %message.message_type, pattern = %message.pattern))]
    pub async fn publish(&self, mut message: Message) -> Result<MessageId, BrokerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::ShuttingDown);
        }

        message.normalize();
        message.status = MessageStatus::Pending;
        message.validate()?;

        // same-lane publishers take turns, so offsets reach the lane in order
        let key = message.lane_key();
        let lock = self.inner.publish_lock(&key);
        let result = {
            let _turn = lock.lock().await;
            self.append_and_enqueue(message).await
        };
        self.inner.release_publish_lock(&key, lock);
        result
    }

    async fn append_and_enqueue(&self, message: Message) -> Result<MessageId, BrokerError> {
        let offset = self.inner.substrate.append(&message).await.map_err(|e| {
            error!(message_id = %message.id, error = %e, "failed to append message");
            BrokerError::SubstrateWrite(e)
        })?;

        let message_id = message.id;
        self.inner.ledger.insert(
            message_id,
            DeliveryState {
                status: MessageStatus::Pending,
                attempt_count: message.attempt_count,
            },
        );
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(%message_id, offset, priority = ?message.priority, "message published");

        self.inner.enqueue(offset, message);
        Ok(message_id)
    }

    /// Publish a typed payload
    pub async fn publish_typed<P: TypedPayload>(
        &self,
        pattern: MessagePattern,
        payload: &P,
    ) -> Result<MessageId, BrokerError> {
        self.publish(Message::typed(pattern, payload)?).await
    }

    /// Send a request and wait for its correlated reply
    ///
    /// A fresh correlation id is always assigned. Fails fast with
    /// `NoHandler` when nothing answers the type, with `HandlerFailed` when
    /// the handler was dead-lettered, and with `RequestTimeout` when no
    /// reply arrives in time.
    #[instrument(skip(self, message), fields(message_type = %message.message_type))]
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message, BrokerError> {
        message.pattern = MessagePattern::RequestResponse;
        let correlation_id = Uuid::now_v7();
        message.correlation_id = Some(correlation_id);

        if !self.inner.registry.has_handler(
            &message.message_type,
            MessagePattern::RequestResponse,
            &message.tenant_id,
        ) {
            return Err(BrokerError::NoHandler {
                message_type: message.message_type,
            });
        }

        let mut pending = self
            .inner
            .tracker
            .register(correlation_id, message.tenant_id.clone(), timeout)?;
        let message_id = self.publish(message).await?;

        match tokio::time::timeout(timeout, pending.recv()).await {
            Ok(Some(Ok(reply))) => Ok(reply),
            Ok(Some(Err(error))) => Err(BrokerError::HandlerFailed { message_id, error }),
            Ok(None) | Err(_) => {
                debug!(%message_id, %correlation_id, "request timed out");
                Err(BrokerError::RequestTimeout {
                    message_id,
                    timeout,
                })
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler for (type, pattern)
    pub fn subscribe<H: MessageHandler>(
        &self,
        message_type: &str,
        pattern: MessagePattern,
        handler: H,
    ) -> Result<SubscriptionId, BrokerError> {
        self.subscribe_with(message_type, pattern, Arc::new(handler), SubscribeOptions::default())
    }

    /// Register a shared handler with options
    pub fn subscribe_with(
        &self,
        message_type: &str,
        pattern: MessagePattern,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, BrokerError> {
        let id = self
            .inner
            .registry
            .register(message_type, pattern, handler, options)?;
        debug!(%message_type, %pattern, subscription_id = %id, "handler subscribed");
        Ok(id)
    }

    /// Register an async closure
    pub fn subscribe_fn<F, Fut>(
        &self,
        message_type: &str,
        pattern: MessagePattern,
        f: F,
    ) -> Result<SubscriptionId, BrokerError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe(message_type, pattern, FnHandler::new(f))
    }

    /// Register a closure for a typed payload, routed on its message type
    pub fn subscribe_typed<P, F, Fut>(
        &self,
        pattern: MessagePattern,
        f: F,
    ) -> Result<SubscriptionId, BrokerError>
    where
        P: TypedPayload,
        F: Fn(P, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe(P::MESSAGE_TYPE, pattern, TypedHandler::<P, F>::new(f))
    }

    /// Remove a subscription; returns false if unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.registry.unregister(id);
        if removed {
            debug!(subscription_id = %id, "handler unsubscribed");
        }
        removed
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Latest known status of a message published or recovered by this broker
    pub fn message_status(&self, message_id: MessageId) -> Option<DeliveryState> {
        self.inner.ledger.get(&message_id).map(|state| *state)
    }

    pub fn dead_letters(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(Arc::clone(&self.inner.store))
    }

    pub fn stats(&self) -> BrokerStats {
        let counters = &self.inner.counters;
        BrokerStats {
            published: counters.published.load(Ordering::Relaxed),
            acknowledged: counters.acknowledged.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            pending_requests: self.inner.tracker.pending(),
            active_lanes: self.inner.lanes.active(),
            queued: self.inner.lanes.queued(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Re-dispatch every non-terminal message in the substrate
    ///
    /// Meant to run once at startup, before new traffic. Messages this
    /// broker already knows about are skipped. Returns how many messages
    /// were re-queued.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, BrokerError> {
        let mut replayed = 0;
        let mut skipped = 0;
        let mut records = self.inner.substrate.read_from(0);

        while let Some(record) = records.next().await {
            let record = record.map_err(BrokerError::SubstrateRead)?;
            let message = record.message;

            if message.status.is_terminal() || self.inner.ledger.contains_key(&message.id) {
                skipped += 1;
                continue;
            }

            debug!(
                message_id = %message.id,
                status = %message.status,
                attempt_count = message.attempt_count,
                "replaying message"
            );
            self.inner.ledger.insert(
                message.id,
                DeliveryState {
                    status: message.status,
                    attempt_count: message.attempt_count,
                },
            );
            self.inner.enqueue(record.offset, message);
            replayed += 1;
        }

        info!(replayed, skipped, "broker recovery complete");
        Ok(replayed)
    }

    /// Start background maintenance (correlation sweeping)
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let inner: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self
            .inner
            .config
            .correlation_sweep_interval
            .max(Duration::from_millis(1));

        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.tracker.expire_stale();
                    }
                }
            }
            debug!("correlation sweeper stopped");
        }));
        info!(sweep_interval_ms = period.as_millis() as u64, "message broker started");
    }

    /// Stop accepting messages and wait for running lanes to finish
    ///
    /// Messages still queued stay non-terminal in the substrate and are
    /// picked up by the next `recover`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        info!("shutting down message broker");
        self.inner.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        self.inner.tasks.close();
        match tokio::time::timeout(self.inner.config.shutdown_timeout, self.inner.tasks.wait()).await {
            Ok(()) => {
                info!("message broker stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    running = self.inner.tasks.len(),
                    "shutdown timed out waiting for lanes"
                );
                Err(BrokerError::ShutdownTimeout)
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::substrate::{InMemoryStateStore, InMemorySubstrate};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn broker_with(config: BrokerConfig) -> (MessageBroker, Arc<InMemorySubstrate>) {
        let substrate = Arc::new(InMemorySubstrate::new());
        let broker = MessageBroker::new(
            substrate.clone(),
            Arc::new(InMemoryStateStore::new()),
            config,
        );
        (broker, substrate)
    }

    fn fast_retries(max_retries: u32) -> BrokerConfig {
        BrokerConfig::default().with_default_policy(RetryPolicy::fixed(
            Duration::from_millis(1),
            max_retries + 1,
        ))
    }

    async fn wait_for_status(broker: &MessageBroker, id: MessageId, status: MessageStatus) {
        for _ in 0..500 {
            if broker.message_status(id).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("message {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_publish_appends_before_dispatch() {
        let (broker, substrate) = broker_with(BrokerConfig::default());
        broker
            .subscribe_fn("note.created", MessagePattern::Event, |_msg: Message| async {
                Ok(json!(null))
            })
            .unwrap();

        let id = broker
            .publish(Message::event("note.created", json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(substrate.len(), 1);
        wait_for_status(&broker, id, MessageStatus::Acknowledged).await;
        assert_eq!(substrate.status_of(id), Some(MessageStatus::Acknowledged));
    }

    #[tokio::test]
    async fn test_substrate_failure_surfaces_to_publisher() {
        let (broker, substrate) = broker_with(BrokerConfig::default());
        substrate.set_unavailable(true);

        let result = broker.publish(Message::event("note.created", json!({}))).await;
        assert!(matches!(result, Err(BrokerError::SubstrateWrite(_))));
        assert_eq!(broker.stats().published, 0);
    }

    #[tokio::test]
    async fn test_invalid_envelope_rejected() {
        let (broker, substrate) = broker_with(BrokerConfig::default());
        let msg = Message::event("note.created", json!({})).with_correlation(Uuid::now_v7());

        assert!(matches!(
            broker.publish(msg).await,
            Err(BrokerError::Envelope(EnvelopeError::UnexpectedCorrelation { .. }))
        ));
        assert!(substrate.is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_message_is_acknowledged() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let id = broker
            .publish(Message::command("nobody.listens", json!({})))
            .await
            .unwrap();

        wait_for_status(&broker, id, MessageStatus::Acknowledged).await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (broker, _) = broker_with(fast_retries(3));
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        broker
            .subscribe_fn("flaky.job", MessagePattern::Command, move |msg: Message| {
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(msg.attempt_count, n);
                    if n < 2 {
                        Err(HandlerError::new("try again"))
                    } else {
                        Ok(json!("done"))
                    }
                }
            })
            .unwrap();

        let id = broker
            .publish(Message::command("flaky.job", json!({})))
            .await
            .unwrap();
        wait_for_status(&broker, id, MessageStatus::Acknowledged).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.message_status(id).unwrap().attempt_count, 2);
        assert_eq!(broker.stats().retried, 2);
        assert_eq!(broker.dead_letters().count(Default::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_request_without_handler_fails_fast() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let request = Message::new("agent.none", MessagePattern::RequestResponse, json!({}));

        let err = broker
            .request(request, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoHandler { ref message_type } if message_type == "agent.none"));
    }

    #[tokio::test]
    async fn test_request_handler_failure_propagates() {
        let (broker, _) = broker_with(fast_retries(1));
        broker
            .subscribe_fn("agent.broken", MessagePattern::RequestResponse, |_msg: Message| async {
                Err(HandlerError::new("model unavailable").with_type("upstream"))
            })
            .unwrap();

        let request = Message::new("agent.broken", MessagePattern::RequestResponse, json!({}));
        let err = broker
            .request(request, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            BrokerError::HandlerFailed { error, .. } => {
                assert_eq!(error.error_type.as_deref(), Some("upstream"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_lane() {
        let (broker, _) = broker_with(fast_retries(0));
        broker
            .subscribe_fn("boom", MessagePattern::Command, |msg: Message| async move {
                if msg.payload == json!("panic") {
                    panic!("handler bug");
                }
                Ok(json!(null))
            })
            .unwrap();

        let first = broker.publish(Message::command("boom", json!("panic"))).await.unwrap();
        let second = broker.publish(Message::command("boom", json!("fine"))).await.unwrap();

        wait_for_status(&broker, first, MessageStatus::DeadLettered).await;
        wait_for_status(&broker, second, MessageStatus::Acknowledged).await;

        let dead = broker
            .dead_letters()
            .list(Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(dead[0].last_error.error_type.as_deref(), Some("panic"));
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let config = fast_retries(0).with_handler_timeout(Duration::from_millis(20));
        let (broker, _) = broker_with(config);
        broker
            .subscribe_fn("slow.job", MessagePattern::Command, |_msg: Message| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .unwrap();

        let id = broker.publish(Message::command("slow.job", json!({}))).await.unwrap();
        wait_for_status(&broker, id, MessageStatus::DeadLettered).await;
    }

    fn timed_out_id(err: BrokerError) -> MessageId {
        match err {
            BrokerError::RequestTimeout { message_id, .. } => message_id,
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_queued_request_is_skipped_once_caller_gave_up() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicU32::new(0));

        let (open, seen) = (gate.clone(), calls.clone());
        broker
            .subscribe_fn("agent.slow", MessagePattern::RequestResponse, move |_msg: Message| {
                let (open, seen) = (open.clone(), seen.clone());
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    let _permit = open.acquire().await;
                    Ok(json!("late"))
                }
            })
            .unwrap();

        // both share a lane, so the second waits behind the blocked first
        let request = || {
            Message::new("agent.slow", MessagePattern::RequestResponse, json!({}))
                .with_ordering_key("doc-1")
        };
        let timeout = Duration::from_millis(20);
        let (first, second) = tokio::join!(
            broker.request(request(), timeout),
            broker.request(request(), timeout)
        );
        let first = timed_out_id(first.unwrap_err());
        let second = timed_out_id(second.unwrap_err());

        gate.add_permits(2);
        wait_for_status(&broker, first, MessageStatus::Acknowledged).await;
        wait_for_status(&broker, second, MessageStatus::Acknowledged).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_request_not_retried_after_caller_gave_up() {
        let (broker, _) = broker_with(fast_retries(5));
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        broker
            .subscribe_fn("agent.flaky", MessagePattern::RequestResponse, move |_msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Err::<serde_json::Value, _>(HandlerError::new("upstream reset"))
                }
            })
            .unwrap();

        let request = Message::new("agent.flaky", MessagePattern::RequestResponse, json!({}));
        let err = broker
            .request(request, Duration::from_millis(10))
            .await
            .unwrap_err();
        let id = timed_out_id(err);

        wait_for_status(&broker, id, MessageStatus::DeadLettered).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stats().retried, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let id = broker
            .subscribe_fn("tick", MessagePattern::Event, move |_msg: Message| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
            .unwrap();

        assert!(broker.unsubscribe(id));
        let msg = broker.publish(Message::event("tick", json!({}))).await.unwrap();
        wait_for_status(&broker, msg, MessageStatus::Acknowledged).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_messages() {
        let (broker, _) = broker_with(BrokerConfig::default());
        broker.start();
        broker.shutdown().await.unwrap();

        assert!(broker.is_shutting_down());
        assert!(matches!(
            broker.publish(Message::event("x", json!({}))).await,
            Err(BrokerError::ShuttingDown)
        ));
    }
}

//! Integration tests for MessageBroker delivery guarantees
//!
//! Run with: cargo test -p switchyard-orchestrator --test broker_integration

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use switchyard_orchestrator::broker::{BrokerError, HandlerError, MessageBroker, SubscribeOptions};
use switchyard_orchestrator::message::{Message, MessageId, MessagePattern, MessageStatus};
use switchyard_orchestrator::substrate::{
    DeadLetterFilter, InMemoryStateStore, InMemorySubstrate, Offset, Pagination, SubstrateAdapter,
    SubstrateError, SubstrateRecord,
};
use switchyard_orchestrator::{BrokerConfig, RetryPolicy};

struct Harness {
    broker: MessageBroker,
    substrate: Arc<InMemorySubstrate>,
    store: Arc<InMemoryStateStore>,
}

fn harness(config: BrokerConfig) -> Harness {
    let substrate = Arc::new(InMemorySubstrate::new());
    let store = Arc::new(InMemoryStateStore::new());
    let broker = MessageBroker::new(substrate.clone(), store.clone(), config);
    Harness {
        broker,
        substrate,
        store,
    }
}

async fn wait_for_status(broker: &MessageBroker, message: &Message, expected: MessageStatus) {
    for _ in 0..500 {
        if broker.message_status(message.id).map(|s| s.status) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "message {} never reached {expected}, last state {:?}",
        message.id,
        broker.message_status(message.id)
    );
}

#[test_log::test(tokio::test)]
async fn test_failing_handler_is_attempted_retries_plus_one_then_dead_lettered() {
    let max_retries = 2;
    let h = harness(
        BrokerConfig::default()
            .with_policy("job.run", RetryPolicy::fixed(Duration::from_millis(2), max_retries + 1)),
    );

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    h.broker
        .subscribe_fn("job.run", MessagePattern::Command, move |_msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(HandlerError::new("permanent failure").with_type("rejected")) }
        })
        .unwrap();

    let message = Message::command("job.run", json!({"id": 7}));
    h.broker.publish(message.clone()).await.unwrap();
    wait_for_status(&h.broker, &message, MessageStatus::DeadLettered).await;

    assert_eq!(attempts.load(Ordering::SeqCst), max_retries + 1);
    assert_eq!(h.substrate.status_of(message.id), Some(MessageStatus::DeadLettered));

    let dead = h.broker.dead_letters().for_message(message.id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, max_retries);
    assert_eq!(dead[0].last_error.error_type.as_deref(), Some("rejected"));
    assert_eq!(dead[0].message.payload, json!({"id": 7}));

    // nothing is redelivered afterwards
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), max_retries + 1);
    assert_eq!(h.store.dead_letter_count(), 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_before_budget_runs_out() {
    let h = harness(
        BrokerConfig::default().with_default_policy(RetryPolicy::fixed(Duration::from_millis(1), 4)),
    );

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    h.broker
        .subscribe_fn("flaky", MessagePattern::Command, move |_msg: Message| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(HandlerError::new("try again"))
                } else {
                    Ok(json!("done"))
                }
            }
        })
        .unwrap();

    let message = Message::command("flaky", json!({}));
    h.broker.publish(message.clone()).await.unwrap();
    wait_for_status(&h.broker, &message, MessageStatus::Acknowledged).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.broker.message_status(message.id).unwrap().attempt_count, 2);
    assert_eq!(h.store.dead_letter_count(), 0);
    assert_eq!(h.broker.stats().retried, 2);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let h = harness(BrokerConfig::default());
    h.broker
        .subscribe_fn("math.square", MessagePattern::RequestResponse, |msg: Message| async move {
            let n = msg.payload.as_i64().unwrap_or_default();
            // finish out of order
            tokio::time::sleep(Duration::from_millis(((20 - n) * 2) as u64)).await;
            Ok::<_, HandlerError>(json!(n * n))
        })
        .unwrap();

    let calls = (0..20).map(|n| {
        let broker = h.broker.clone();
        async move {
            // distinct ordering keys so requests are dispatched concurrently
            let request = Message::new("math.square", MessagePattern::RequestResponse, json!(n))
                .with_ordering_key(format!("caller-{n}"));
            (n, broker.request(request, Duration::from_secs(2)).await)
        }
    });

    for (n, reply) in join_all(calls).await {
        let reply = reply.unwrap();
        assert_eq!(reply.payload, json!(n * n), "caller {n} got someone else's reply");
        assert!(reply.correlation_id.is_some());
    }
    assert_eq!(h.broker.stats().pending_requests, 0);
}

#[tokio::test]
async fn test_timed_out_request_never_sees_late_reply() {
    let h = harness(BrokerConfig::default());
    let finished = Arc::new(AtomicU32::new(0));
    let done = finished.clone();
    h.broker
        .subscribe_fn("slow.op", MessagePattern::RequestResponse, move |_msg: Message| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(json!("too late"))
            }
        })
        .unwrap();

    let request = Message::new("slow.op", MessagePattern::RequestResponse, json!({}));
    let err = h
        .broker
        .request(request, Duration::from_millis(20))
        .await
        .unwrap_err();
    let message_id = match err {
        BrokerError::RequestTimeout { message_id, .. } => message_id,
        other => panic!("expected timeout, got {other}"),
    };
    assert_eq!(h.broker.stats().pending_requests, 0);

    // the handler still finishes and its reply is dropped
    for _ in 0..100 {
        if finished.load(Ordering::SeqCst) == 1
            && h.broker.message_status(message_id).map(|s| s.status)
                == Some(MessageStatus::Acknowledged)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.broker.message_status(message_id).map(|s| s.status),
        Some(MessageStatus::Acknowledged)
    );
    // replies are never written to the log
    assert_eq!(h.substrate.len(), 1);
}

#[tokio::test]
async fn test_event_fan_out_is_independent_per_handler() {
    let h = harness(BrokerConfig::default().with_default_policy(RetryPolicy::no_retry()));

    let good = Arc::new(AtomicU32::new(0));
    let bad = Arc::new(AtomicU32::new(0));

    let counter = good.clone();
    h.broker
        .subscribe_with(
            "content.stored",
            MessagePattern::Event,
            Arc::new(switchyard_orchestrator::broker::FnHandler::new(move |_msg: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, HandlerError>(json!(null)) }
            })),
            SubscribeOptions::named("indexer"),
        )
        .unwrap();

    let counter = bad.clone();
    h.broker
        .subscribe_with(
            "content.stored",
            MessagePattern::Event,
            Arc::new(switchyard_orchestrator::broker::FnHandler::new(move |_msg: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Value, _>(HandlerError::new("notifier offline")) }
            })),
            SubscribeOptions::named("notifier"),
        )
        .unwrap();

    let message = Message::event("content.stored", json!({"doc": 1}));
    h.broker.publish(message.clone()).await.unwrap();
    wait_for_status(&h.broker, &message, MessageStatus::DeadLettered).await;

    assert_eq!(good.load(Ordering::SeqCst), 1);
    assert_eq!(bad.load(Ordering::SeqCst), 1);

    let dead = h.broker.dead_letters().for_message(message.id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].handler, "notifier");
}

#[tokio::test]
async fn test_same_key_messages_are_handled_in_write_order() {
    let h = harness(BrokerConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    h.broker
        .subscribe_fn("ledger.entry", MessagePattern::Command, move |msg: Message| {
            let log = log.clone();
            async move {
                // jitter the handler so unordered dispatch would show
                let n = msg.payload.as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_micros((n % 3) * 300)).await;
                log.lock().push(n);
                Ok::<_, HandlerError>(json!(null))
            }
        })
        .unwrap();

    let mut last = None;
    for n in 0..40u64 {
        let msg = Message::command("ledger.entry", json!(n)).with_ordering_key("account-1");
        h.broker.publish(msg.clone()).await.unwrap();
        last = Some(msg);
    }
    if let Some(last) = last {
        wait_for_status(&h.broker, &last, MessageStatus::Acknowledged).await;
    }

    assert_eq!(*seen.lock(), (0..40).collect::<Vec<_>>());
}

/// Commits immediately but acknowledges early offsets last, the way a
/// database can return commits out of sequence order
struct SlowAckSubstrate {
    inner: InMemorySubstrate,
}

#[async_trait]
impl SubstrateAdapter for SlowAckSubstrate {
    async fn append(&self, message: &Message) -> Result<Offset, SubstrateError> {
        let offset = self.inner.append(message).await?;
        let delay = 20u64.saturating_sub(5 * offset);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(offset)
    }

    fn read_from(&self, offset: Offset) -> BoxStream<'_, Result<SubstrateRecord, SubstrateError>> {
        self.inner.read_from(offset)
    }

    async fn record_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
        attempt_count: u32,
    ) -> Result<(), SubstrateError> {
        self.inner.record_status(message_id, status, attempt_count).await
    }
}

#[tokio::test]
async fn test_concurrent_publishers_keep_write_order_per_key() {
    let substrate = Arc::new(SlowAckSubstrate {
        inner: InMemorySubstrate::new(),
    });
    let broker = MessageBroker::new(
        substrate.clone(),
        Arc::new(InMemoryStateStore::new()),
        BrokerConfig::default(),
    );

    let seen = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let log = seen.clone();
    broker
        .subscribe_fn("inventory.adjust", MessagePattern::Command, move |msg: Message| {
            log.lock().push(msg.id);
            async { Ok::<_, HandlerError>(json!(null)) }
        })
        .unwrap();

    let publishers: Vec<_> = (0..4)
        .map(|n| {
            let broker = broker.clone();
            tokio::spawn(async move {
                let message = Message::command("inventory.adjust", json!({"n": n}));
                broker.publish(message.clone()).await.unwrap();
                message
            })
        })
        .collect();
    let published: Vec<Message> = join_all(publishers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    for message in &published {
        wait_for_status(&broker, message, MessageStatus::Acknowledged).await;
    }

    let written: Vec<Uuid> = substrate.inner.messages().iter().map(|m| m.id).collect();
    assert_eq!(written.len(), 4);
    assert_eq!(*seen.lock(), written);
}

#[tokio::test]
async fn test_publish_fails_when_substrate_is_down() {
    let h = harness(BrokerConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    h.broker
        .subscribe_fn("audit", MessagePattern::Event, move |_msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(json!(null)) }
        })
        .unwrap();

    h.substrate.set_unavailable(true);
    let err = h
        .broker
        .publish(Message::event("audit", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::SubstrateWrite(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.stats().published, 0);
}

#[tokio::test]
async fn test_dead_letters_filter_by_type() {
    let h = harness(BrokerConfig::default().with_default_policy(RetryPolicy::no_retry()));
    for ty in ["email.send", "pdf.parse"] {
        h.broker
            .subscribe_fn(ty, MessagePattern::Command, |_msg: Message| async {
                Err::<Value, _>(HandlerError::new("down"))
            })
            .unwrap();
    }

    let email = Message::command("email.send", json!({}));
    let pdf = Message::command("pdf.parse", json!({})).with_tenant("acme");
    h.broker.publish(email.clone()).await.unwrap();
    h.broker.publish(pdf.clone()).await.unwrap();
    wait_for_status(&h.broker, &email, MessageStatus::DeadLettered).await;
    wait_for_status(&h.broker, &pdf, MessageStatus::DeadLettered).await;

    let queue = h.broker.dead_letters();
    assert_eq!(queue.count(DeadLetterFilter::default()).await.unwrap(), 2);

    let emails = queue
        .list(DeadLetterFilter::for_type("email.send"), Pagination::default())
        .await
        .unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].message.id, email.id);

    let acme = queue
        .count(DeadLetterFilter::default().with_tenant("acme"))
        .await
        .unwrap();
    assert_eq!(acme, 1);

    let fetched = queue.get(emails[0].id).await.unwrap().unwrap();
    assert_eq!(fetched, emails[0]);
}

//! Restart tests: a fresh broker or engine picks up state left behind in
//! a shared substrate and state store.
//!
//! Run with: cargo test -p switchyard-orchestrator --test recovery_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use switchyard_orchestrator::agent::{bind_agent, AgentContext, AgentExecutor, FnAgent};
use switchyard_orchestrator::broker::{HandlerError, MessageBroker};
use switchyard_orchestrator::engine::{WorkflowEngine, WorkflowStatusView};
use switchyard_orchestrator::message::{Message, MessagePattern, MessageStatus, TenantId};
use switchyard_orchestrator::substrate::{
    InMemoryStateStore, InMemorySubstrate, StateStore, SubstrateAdapter,
};
use switchyard_orchestrator::workflow::{
    InputMapping, WorkflowCheckpoint, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
    WorkflowStep,
};
use switchyard_orchestrator::{BrokerConfig, EngineConfig, RetryPolicy};

fn broker_over(substrate: &Arc<InMemorySubstrate>, store: &Arc<InMemoryStateStore>) -> MessageBroker {
    MessageBroker::new(
        substrate.clone(),
        store.clone(),
        BrokerConfig::default().with_default_policy(RetryPolicy::no_retry()),
    )
}

fn recording_agent(calls: Arc<AtomicU32>, seen: Arc<parking_lot::Mutex<Vec<Value>>>) -> Arc<dyn AgentExecutor> {
    Arc::new(FnAgent::new(move |_ctx: AgentContext, _task: String, input: Value| {
        calls.fetch_add(1, Ordering::SeqCst);
        seen.lock().push(input.clone());
        async move { Ok::<_, HandlerError>(json!({"echo": input})) }
    }))
}

async fn wait_terminal(engine: &WorkflowEngine, id: Uuid) -> WorkflowStatusView {
    for _ in 0..400 {
        let view = engine.get_status(id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("workflow {id} never finished");
}

/// Save `checkpoint` one version at a time, as a running engine would
async fn save_through(store: &InMemoryStateStore, checkpoint: &mut WorkflowCheckpoint, version: u64) {
    while checkpoint.version < version {
        checkpoint.version += 1;
        checkpoint.saved_at = Utc::now();
        store.save_checkpoint(checkpoint).await.unwrap();
    }
}

fn two_step_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("resumable")
        .step(WorkflowStep::new("fetch", "fetcher", "fetch"))
        .step(WorkflowStep::new("parse", "parser", "parse").with_input(InputMapping::value("fetch.body")))
}

// =============================================================================
// Broker
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_broker_replays_unfinished_messages() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let store = Arc::new(InMemoryStateStore::new());

    // left behind by a previous process: one pending, one mid-retry, one done
    let pending = Message::command("invoice.render", json!({"invoice": 1}));
    let retrying = Message::command("invoice.render", json!({"invoice": 2}));
    let finished = Message::command("invoice.render", json!({"invoice": 3}));
    for message in [&pending, &retrying, &finished] {
        substrate.append(message).await.unwrap();
    }
    substrate
        .record_status(retrying.id, MessageStatus::Failed, 1)
        .await
        .unwrap();
    substrate
        .record_status(finished.id, MessageStatus::Acknowledged, 0)
        .await
        .unwrap();

    let broker = broker_over(&substrate, &store);
    let handled = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = handled.clone();
    broker
        .subscribe_fn("invoice.render", MessagePattern::Command, move |msg: Message| {
            log.lock().push(msg.payload["invoice"].as_u64().unwrap_or_default());
            async { Ok::<_, HandlerError>(json!(null)) }
        })
        .unwrap();

    assert_eq!(broker.recover().await.unwrap(), 2);

    for _ in 0..200 {
        if handled.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut seen = handled.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
    assert_eq!(substrate.status_of(pending.id), Some(MessageStatus::Acknowledged));
    assert_eq!(substrate.status_of(retrying.id), Some(MessageStatus::Acknowledged));

    // a second pass finds nothing left to do
    assert_eq!(broker.recover().await.unwrap(), 0);
}

#[tokio::test]
async fn test_broker_recovery_skips_dead_letters() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let store = Arc::new(InMemoryStateStore::new());

    let dead = Message::command("invoice.render", json!({}));
    substrate.append(&dead).await.unwrap();
    substrate
        .record_status(dead.id, MessageStatus::DeadLettered, 4)
        .await
        .unwrap();

    let broker = broker_over(&substrate, &store);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    broker
        .subscribe_fn("invoice.render", MessagePattern::Command, move |_msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(json!(null)) }
        })
        .unwrap();

    assert_eq!(broker.recover().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Engine
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_engine_resumes_from_checkpointed_step() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let store = Arc::new(InMemoryStateStore::new());

    // a previous engine finished `fetch` and crashed before `parse`
    let mut instance = WorkflowInstance::new("resumable", TenantId::new("acme"), json!({"url": "x"}));
    instance.transition(WorkflowStatus::Running).unwrap();
    instance
        .context
        .record_output("fetch", json!({"body": "<html/>"}), 1);
    instance.advance();
    let workflow_id = instance.id;
    let mut checkpoint = WorkflowCheckpoint {
        instance,
        definition: two_step_definition(),
        version: 0,
        saved_at: Utc::now(),
    };
    save_through(&store, &mut checkpoint, 3).await;

    let broker = broker_over(&substrate, &store);
    let fetch_calls = Arc::new(AtomicU32::new(0));
    let parse_calls = Arc::new(AtomicU32::new(0));
    let parse_inputs = Arc::new(parking_lot::Mutex::new(Vec::new()));
    bind_agent(
        &broker,
        "fetcher",
        recording_agent(fetch_calls.clone(), Arc::new(parking_lot::Mutex::new(Vec::new()))),
    )
    .unwrap();
    bind_agent(&broker, "parser", recording_agent(parse_calls.clone(), parse_inputs.clone())).unwrap();

    let engine = WorkflowEngine::new(broker, store.clone(), EngineConfig::default());
    assert_eq!(engine.recover().await.unwrap(), 1);

    let view = wait_terminal(&engine, workflow_id).await;
    assert_eq!(view.status, WorkflowStatus::Completed);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(parse_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*parse_inputs.lock(), vec![json!("<html/>")]);
    assert_eq!(view.context.output("parse"), Some(&json!({"echo": "<html/>"})));
    assert!(view.version > 3);

    // already running or finished workflows are not started twice
    assert_eq!(engine.recover().await.unwrap(), 0);
}

#[tokio::test]
async fn test_engine_restart_reruns_interrupted_step() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let store = Arc::new(InMemoryStateStore::new());

    // first process: the fetch agent hangs, then the engine shuts down
    let first_broker = broker_over(&substrate, &store);
    let gate = Arc::new(Semaphore::new(0));
    let hang = gate.clone();
    bind_agent(
        &first_broker,
        "fetcher",
        Arc::new(FnAgent::new(move |_ctx: AgentContext, _task: String, _input: Value| {
            let hang = hang.clone();
            async move {
                let _permit = hang
                    .acquire()
                    .await
                    .map_err(|_| HandlerError::new("process exited"))?;
                Ok(json!({"body": "never"}))
            }
        })),
    )
    .unwrap();

    let first = WorkflowEngine::new(first_broker.clone(), store.clone(), EngineConfig::default());
    let workflow_id = first.start(two_step_definition(), json!({"url": "x"})).await.unwrap();
    while first_broker.stats().pending_requests == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    first.shutdown().await;
    gate.close();

    let stored = store.load_checkpoint(workflow_id).await.unwrap();
    assert_eq!(stored.instance.status, WorkflowStatus::Running);
    assert_eq!(stored.instance.current_step_index, 0);

    // second process over the same store
    let second_broker = broker_over(&substrate, &store);
    let fetch_calls = Arc::new(AtomicU32::new(0));
    let fetch_inputs = Arc::new(parking_lot::Mutex::new(Vec::new()));
    bind_agent(
        &second_broker,
        "fetcher",
        Arc::new(FnAgent::new({
            let calls = fetch_calls.clone();
            let inputs = fetch_inputs.clone();
            move |_ctx: AgentContext, _task: String, input: Value| {
                calls.fetch_add(1, Ordering::SeqCst);
                inputs.lock().push(input);
                async { Ok::<_, HandlerError>(json!({"body": "page"})) }
            }
        })),
    )
    .unwrap();
    bind_agent(
        &second_broker,
        "parser",
        recording_agent(Arc::new(AtomicU32::new(0)), Arc::new(parking_lot::Mutex::new(Vec::new()))),
    )
    .unwrap();

    let second = WorkflowEngine::new(second_broker, store.clone(), EngineConfig::default());
    assert_eq!(second.recover().await.unwrap(), 1);

    let view = wait_terminal(&second, workflow_id).await;
    assert_eq!(view.status, WorkflowStatus::Completed);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*fetch_inputs.lock(), vec![json!({"url": "x"})]);
    assert_eq!(view.context.output("parse"), Some(&json!({"echo": "page"})));
}

#[tokio::test]
async fn test_recovered_paused_workflow_waits_for_resume() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let store = Arc::new(InMemoryStateStore::new());

    let mut instance = WorkflowInstance::new("resumable", TenantId::default(), json!({"url": "x"}));
    instance.transition(WorkflowStatus::Running).unwrap();
    instance.transition(WorkflowStatus::Paused).unwrap();
    let workflow_id = instance.id;
    let mut checkpoint = WorkflowCheckpoint {
        instance,
        definition: two_step_definition(),
        version: 0,
        saved_at: Utc::now(),
    };
    save_through(&store, &mut checkpoint, 3).await;

    let broker = broker_over(&substrate, &store);
    let fetch_calls = Arc::new(AtomicU32::new(0));
    bind_agent(
        &broker,
        "fetcher",
        Arc::new(FnAgent::new({
            let calls = fetch_calls.clone();
            move |_ctx: AgentContext, _task: String, _input: Value| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, HandlerError>(json!({"body": "page"})) }
            }
        })),
    )
    .unwrap();
    bind_agent(
        &broker,
        "parser",
        recording_agent(Arc::new(AtomicU32::new(0)), Arc::new(parking_lot::Mutex::new(Vec::new()))),
    )
    .unwrap();

    let engine = WorkflowEngine::new(broker, store, EngineConfig::default());
    assert_eq!(engine.recover().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        engine.get_status(workflow_id).await.unwrap().status,
        WorkflowStatus::Paused
    );

    engine.resume(workflow_id).await.unwrap();
    let view = wait_terminal(&engine, workflow_id).await;
    assert_eq!(view.status, WorkflowStatus::Completed);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
}

//! End-to-end scenarios driving the dispatcher against a real graph, the
//! in-memory store, and recording ports. These exercise the six-step
//! processor algorithm and the external entry points together rather than
//! any single module in isolation.

use std::sync::Arc;

use engine_core::dispatcher::Engine;
use engine_core::graph::{
    Element, ElementKind, EventDefinition, EventDefinitionType, GatewayDirection,
    ProcessDefinitionBuilder,
};
use engine_core::model::{InstanceState, TokenState};
use engine_core::ports::Ports;
use engine_core::registries::WaitingRegistries;
use engine_core::store::TokenStore;
use engine_core::store_memory::MemoryTokenStore;
use engine_core::vars::Variables;
use serde_json::{json, Map as JsonMap};

fn bare(id: &str, kind: ElementKind) -> Element {
    Element {
        id: id.to_string(),
        name: None,
        kind,
        extensions: JsonMap::new(),
    }
}

/// S1 — a linear flow: start -> service task -> end, completed via the job
/// subsystem's completion callback.
#[tokio::test]
async fn linear_flow_completes_via_job_callback() {
    let mut builder = ProcessDefinitionBuilder::new("linear", 1);
    builder
        .add_element(bare("start", ElementKind::StartEvent { event_definitions: vec![] }))
        .add_element(bare("task", ElementKind::ServiceTask { task_type: "charge-card".into() }))
        .add_element(bare("end", ElementKind::EndEvent { terminate: false }))
        .add_flow("f1", "start", "task", None, false)
        .add_flow("f2", "task", "end", None, false);
    let def = Arc::new(builder.build().unwrap());

    let store = Arc::new(MemoryTokenStore::new());
    let registries = Arc::new(WaitingRegistries::new());
    let ports = Arc::new(Ports::null());

    let engine = Engine::new(def, store.clone(), registries, ports, 8);
    let instance_id = engine.start_instance(None, Variables::new()).await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Active);
    let tokens = store.load_tokens_by_instance(instance_id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].state, TokenState::Waiting);

    let job_id = match tokens[0].waiting_for.as_ref().unwrap() {
        engine_core::model::WaitingFor::Job(id) => *id,
        other => panic!("expected job wait, got {other:?}"),
    };
    let mut completion = Variables::new();
    completion.set("receiptId", json!("rcpt-1"));
    engine.on_job_completed(job_id, completion).await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
}

/// S2 — exclusive gateway routes on a numeric condition, falling back to the
/// default flow when no branch matches.
#[tokio::test]
async fn exclusive_gateway_takes_matching_branch() {
    let mut builder = ProcessDefinitionBuilder::new("exclusive", 1);
    builder
        .add_element(bare("start", ElementKind::StartEvent { event_definitions: vec![] }))
        .add_element(bare("gw", ElementKind::ExclusiveGateway))
        .add_element(bare("highValue", ElementKind::EndEvent { terminate: false }))
        .add_element(bare("lowValue", ElementKind::EndEvent { terminate: false }))
        .add_flow("toGw", "start", "gw", None, false)
        .add_flow("highFlow", "gw", "highValue", Some("amount > 1000".into()), false)
        .add_flow("lowFlow", "gw", "lowValue", None, true);
    let def = Arc::new(builder.build().unwrap());

    let store = Arc::new(MemoryTokenStore::new());
    let registries = Arc::new(WaitingRegistries::new());
    let ports = Arc::new(Ports::null());
    let engine = Engine::new(def, store.clone(), registries, ports, 8);

    let mut vars = Variables::new();
    vars.set("amount", json!(5000));
    let instance_id = engine.start_instance(None, vars).await.unwrap();

    let tokens = store.load_tokens_by_instance(instance_id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].current_element_id, "highValue");
    assert_eq!(tokens[0].state, TokenState::Completed);
}

/// S3 — a parallel split fans out into two siblings, and the join only
/// releases once both have arrived.
#[tokio::test]
async fn parallel_gateway_splits_and_joins() {
    let mut builder = ProcessDefinitionBuilder::new("parallel", 1);
    builder
        .add_element(bare("start", ElementKind::StartEvent { event_definitions: vec![] }))
        .add_element(bare(
            "split",
            ElementKind::ParallelGateway { direction: GatewayDirection::Diverging },
        ))
        .add_element(bare("left", ElementKind::ScriptTask { script: "leftDone = true".into() }))
        .add_element(bare("right", ElementKind::ScriptTask { script: "rightDone = true".into() }))
        .add_element(bare(
            "join",
            ElementKind::ParallelGateway { direction: GatewayDirection::Converging },
        ))
        .add_element(bare("end", ElementKind::EndEvent { terminate: false }))
        .add_flow("toSplit", "start", "split", None, false)
        .add_flow("toLeft", "split", "left", None, false)
        .add_flow("toRight", "split", "right", None, false)
        .add_flow("leftToJoin", "left", "join", None, false)
        .add_flow("rightToJoin", "right", "join", None, false)
        .add_flow("toEnd", "join", "end", None, false);
    let def = Arc::new(builder.build().unwrap());

    let store = Arc::new(MemoryTokenStore::new());
    let registries = Arc::new(WaitingRegistries::new());
    let ports = Arc::new(Ports::null());
    let engine = Engine::new(def, store.clone(), registries, ports, 8);

    let instance_id = engine.start_instance(None, Variables::new()).await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);

    let tokens = store.load_tokens_by_instance(instance_id).await.unwrap();
    // start/split token, two branch siblings, and the merged token that
    // reached "end" — every one of them terminal.
    assert!(tokens.iter().all(|t| t.is_terminal()));
    assert!(tokens.iter().any(|t| t.current_element_id == "end"));
}

/// S4 — an interrupting boundary timer cancels the attached task and routes
/// the instance down the escalation branch instead.
#[tokio::test]
async fn interrupting_boundary_timer_cancels_attached_task() {
    let mut builder = ProcessDefinitionBuilder::new("escalation", 1);
    builder
        .add_element(bare("start", ElementKind::StartEvent { event_definitions: vec![] }))
        .add_element(bare("approve", ElementKind::ServiceTask { task_type: "manual-approval".into() }))
        .add_element(bare(
            "timeout",
            ElementKind::BoundaryEvent {
                attached_to: "approve".into(),
                cancel_activity: true,
                event_definitions: vec![EventDefinition {
                    kind: EventDefinitionType::Timer,
                    timer: Some(engine_core::timerspec::TimerSpec::parse("PT1H").unwrap()),
                    message_name: None,
                    correlation_key_expr: None,
                    signal_name: None,
                    error_code: None,
                }],
            },
        ))
        .add_element(bare("escalate", ElementKind::EndEvent { terminate: false }))
        .add_element(bare("approved", ElementKind::EndEvent { terminate: false }))
        .add_flow("toApprove", "start", "approve", None, false)
        .add_flow("approveToEnd", "approve", "approved", None, false)
        .add_flow("timeoutToEscalate", "timeout", "escalate", None, false);
    let def = Arc::new(builder.build().unwrap());

    let store = Arc::new(MemoryTokenStore::new());
    let registries = Arc::new(WaitingRegistries::new());
    let ports = Arc::new(Ports::null());
    let engine = Engine::new(def, store.clone(), registries, ports, 8);

    let instance_id = engine.start_instance(None, Variables::new()).await.unwrap();
    let tokens = store.load_tokens_by_instance(instance_id).await.unwrap();
    let approve_token = tokens.iter().find(|t| t.current_element_id == "approve").unwrap();
    assert_eq!(approve_token.state, TokenState::Waiting);

    let timers = store.load_timers_for_token(approve_token.id).await.unwrap();
    assert_eq!(timers.len(), 1);
    let timer_id = timers[0].id;

    engine.on_timer_fired(timer_id).await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    let tokens = store.load_tokens_by_instance(instance_id).await.unwrap();
    let approve_token = tokens.iter().find(|t| t.id == approve_token.id).unwrap();
    assert_eq!(approve_token.state, TokenState::Canceled);
    assert!(tokens.iter().any(|t| t.current_element_id == "escalate"));
}

/// S5 — a job that throws a BPMN error with no matching boundary raises an
/// unhandled-error incident and moves the instance into the incident state.
#[tokio::test]
async fn unhandled_bpmn_error_raises_incident() {
    let mut builder = ProcessDefinitionBuilder::new("risky", 1);
    builder
        .add_element(bare("start", ElementKind::StartEvent { event_definitions: vec![] }))
        .add_element(bare("charge", ElementKind::ServiceTask { task_type: "charge-card".into() }))
        .add_element(bare("end", ElementKind::EndEvent { terminate: false }))
        .add_flow("toCharge", "start", "charge", None, false)
        .add_flow("toEnd", "charge", "end", None, false);
    let def = Arc::new(builder.build().unwrap());

    let store = Arc::new(MemoryTokenStore::new());
    let registries = Arc::new(WaitingRegistries::new());
    let ports = Arc::new(Ports::null());
    let engine = Engine::new(def, store.clone(), registries, ports, 8);

    let instance_id = engine.start_instance(None, Variables::new()).await.unwrap();
    let tokens = store.load_tokens_by_instance(instance_id).await.unwrap();
    let job_id = match tokens[0].waiting_for.as_ref().unwrap() {
        engine_core::model::WaitingFor::Job(id) => *id,
        other => panic!("expected job wait, got {other:?}"),
    };

    engine
        .on_job_error_thrown(job_id, "INSUFFICIENT_FUNDS".into(), "card declined".into(), Variables::new())
        .await
        .unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Incident);
    let incidents = store.load_incidents(instance_id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
}

/// S6 — a message-start event keeps one perpetually-waiting listener token
/// per deployment; every correlated message instantiates a fresh, separate
/// instance that runs straight through (it carries the autostart marker, so
/// it never re-subscribes to the same message).
#[tokio::test]
async fn message_start_event_creates_instance_on_correlation() {
    let mut builder = ProcessDefinitionBuilder::new("order-intake", 1);
    builder
        .add_element(bare(
            "start",
            ElementKind::StartEvent {
                event_definitions: vec![EventDefinition {
                    kind: EventDefinitionType::Message,
                    timer: None,
                    message_name: Some("OrderPlaced".into()),
                    correlation_key_expr: None,
                    signal_name: None,
                    error_code: None,
                }],
            },
        ))
        .add_element(bare("end", ElementKind::EndEvent { terminate: false }))
        .add_flow("toEnd", "start", "end", None, false);
    let def = Arc::new(builder.build().unwrap());

    let store = Arc::new(MemoryTokenStore::new());
    let registries = Arc::new(WaitingRegistries::new());
    let ports = Arc::new(Ports::null());
    let engine = Engine::new(def, store.clone(), registries, ports, 8);

    // Deploy-time: starting at the message-start event itself registers the
    // listening subscription and parks its token in Waiting state forever.
    let listener_instance = engine.start_instance(Some("start"), Variables::new()).await.unwrap();
    let listener_tokens = store.load_tokens_by_instance(listener_instance).await.unwrap();
    assert_eq!(listener_tokens[0].state, TokenState::Waiting);

    let mut payload = Variables::new();
    payload.set("orderId", json!("order-99"));
    let outcome = engine
        .correlate_message("OrderPlaced", &listener_instance.to_string(), payload)
        .await
        .unwrap();
    assert!(outcome.instance_created);
    assert!(outcome.correlated_token_ids.is_empty());

    // The listener itself is untouched — still waiting for the next message.
    let listener_instance_state = store.load_instance(listener_instance).await.unwrap();
    assert_eq!(listener_instance_state.state, InstanceState::Active);
}

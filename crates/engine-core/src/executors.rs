//! Element executors. Every executor implements the uniform
//! `execute(token, element) -> ExecutionResult` contract; the processor
//! interprets the result. Grounded in `vm.rs`'s opcode handlers
//! (`op_fork`, `op_join`, `op_wait_timer`, `op_wait_message`) but
//! restructured as direct element-kind dispatch instead of bytecode
//! execution, since this core has no compile step.

use serde_json::Map as JsonMap;
use uuid::Uuid;

use crate::errors::CoreError;
use tracing::debug;
use crate::expr;
use crate::graph::{ElementKind, EventDefinitionType, GatewayDirection, ProcessDefinition};
use crate::model::{Token, WaitingFor};
use crate::timerspec::TimerSpec;

/// Uniform return value from every executor.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub token_updated: bool,
    pub next_elements: Vec<String>,
    pub new_token_targets: Vec<String>,
    pub variables: JsonMap<String, serde_json::Value>,
    pub waiting_for: Option<WaitingFor>,
    pub completed: bool,
    /// `(owning element id, spec)` pairs. Usually one entry, owned by the
    /// current element; an event-based gateway contributes one per
    /// downstream timer catch.
    pub timer_requests: Vec<(String, TimerSpec)>,
    /// `(owning element id, message name, correlation key)`.
    pub message_catch_subscriptions: Vec<(String, String, String)>,
    /// `(owning element id, signal name)`.
    pub signal_catch_subscriptions: Vec<(String, String)>,
    pub job_request: Option<JobIntent>,
}

/// What the processor should ask the job port to create, decoupled from the
/// port's own request type so executors stay store/port-agnostic.
#[derive(Debug, Clone)]
pub struct JobIntent {
    pub job_type: String,
    pub retries: u32,
}

impl ExecutionResult {
    fn traverse(next_elements: Vec<String>) -> Self {
        Self {
            next_elements,
            ..Default::default()
        }
    }

    fn wait(waiting_for: WaitingFor) -> Self {
        Self {
            waiting_for: Some(waiting_for),
            ..Default::default()
        }
    }

    fn complete() -> Self {
        Self {
            completed: true,
            ..Default::default()
        }
    }
}

fn correlation_key(token: &Token, expr: Option<&str>) -> Result<String, CoreError> {
    match expr {
        Some(expr) => token
            .variables
            .correlation_key(expr)
            .map_err(CoreError::from),
        None => Ok(token.instance_id.to_string()),
    }
}

/// `autostart` detection for message start events: a deterministic marker
/// variable rather than an age heuristic, since every correlation spawns a
/// brand-new instance that must skip re-registering the same subscription.
fn is_autostart(token: &Token) -> bool {
    token.variables.get("__message_start") == Some(&serde_json::Value::Bool(true))
}

/// Executes a single element against a token. This is the sole entry point
/// the processor calls; it never mutates the token or touches the store
/// directly — all effects are returned in the `ExecutionResult` for the
/// processor to apply.
pub fn execute(
    def: &ProcessDefinition,
    token: &Token,
) -> Result<ExecutionResult, CoreError> {
    let element = def.lookup(&token.current_element_id)?;
    match &element.kind {
        ElementKind::StartEvent { event_definitions } => execute_start_event(def, token, event_definitions),
        ElementKind::EndEvent { .. } => Ok(ExecutionResult::complete()),
        ElementKind::IntermediateCatchEvent { event_definitions } => {
            execute_catch_event(token, event_definitions)
        }
        ElementKind::IntermediateThrowEvent { event_definitions } => {
            execute_throw_event(token, event_definitions)
        }
        ElementKind::BoundaryEvent { .. } => {
            // Boundary events are passive: they never execute as the active
            // element of a token; they are registered at attachment time
            // and fired externally.
            Err(CoreError::MalformedEventDefinition(element.id.clone()))
        }
        ElementKind::ServiceTask { task_type } => {
            Ok(execute_activity_task(token, task_type.clone(), None))
        }
        ElementKind::SendTask {
            task_type,
            message_name,
            correlation_key_expr,
        } => {
            let key = correlation_key(token, correlation_key_expr.as_deref())?;
            let mut result = execute_activity_task(token, task_type.clone(), None);
            result.variables.insert(
                "__publish_message".into(),
                serde_json::json!({ "name": message_name, "key": key }),
            );
            Ok(result)
        }
        ElementKind::ReceiveTask {
            correlation_key_expr,
            ..
        } => {
            let key = correlation_key(token, correlation_key_expr.as_deref())?;
            Ok(ExecutionResult::wait(WaitingFor::Message(key)))
        }
        ElementKind::UserTask { .. } => Ok(execute_activity_task(token, "user-task".into(), None)),
        ElementKind::ScriptTask { script } => execute_script_task(token, script),
        ElementKind::SubProcess { start_element } => {
            Ok(ExecutionResult::traverse(vec![start_element.clone()]))
        }
        ElementKind::CallActivity { called_process_key } => execute_call_activity(def, token, called_process_key),
        ElementKind::ExclusiveGateway => execute_exclusive_gateway(def, token),
        ElementKind::ParallelGateway { direction } => {
            execute_parallel_gateway(def, token, *direction)
        }
        ElementKind::InclusiveGateway { direction } => {
            execute_inclusive_gateway(def, token, *direction)
        }
        ElementKind::EventBasedGateway => execute_event_based_gateway(def, token),
        ElementKind::SequenceFlow { .. } | ElementKind::Message { .. } => {
            Err(CoreError::MalformedEventDefinition(element.id.clone()))
        }
    }
}

/// This engine resolves against a single `ProcessDefinition`; there is no
/// process registry to look `called_process_key` up in and spawn a genuine
/// child instance against, so a call activity crosses like a transparent
/// pass-through rather than opening a real child scope. The token still
/// proceeds along the call activity's own outgoing flow instead of
/// completing in place.
fn execute_call_activity(
    def: &ProcessDefinition,
    token: &Token,
    called_process_key: &str,
) -> Result<ExecutionResult, CoreError> {
    debug!(
        element_id = %token.current_element_id,
        called_process_key,
        "call activity has no child-instance registry to resolve against; passing through"
    );
    let outgoing = def.outgoing(&token.current_element_id)?;
    Ok(ExecutionResult::traverse(outgoing.into_iter().map(|f| f.flow_id.clone()).collect()))
}

fn execute_start_event(
    def: &ProcessDefinition,
    token: &Token,
    event_definitions: &[crate::graph::EventDefinition],
) -> Result<ExecutionResult, CoreError> {
    let outgoing = || def.outgoing(&token.current_element_id).map(|flows| {
        flows.into_iter().map(|f| f.flow_id.clone()).collect::<Vec<_>>()
    });
    let Some(event_def) = event_definitions.first() else {
        return Ok(ExecutionResult::traverse(outgoing()?));
    };
    match event_def.kind {
        EventDefinitionType::Message => {
            if is_autostart(token) {
                return Ok(ExecutionResult::traverse(outgoing()?));
            }
            let name = event_def
                .message_name
                .clone()
                .ok_or_else(|| CoreError::MalformedEventDefinition(token.current_element_id.clone()))?;
            let key = correlation_key(token, event_def.correlation_key_expr.as_deref())?;
            Ok(ExecutionResult {
                waiting_for: Some(WaitingFor::Message(key)),
                ..ExecutionResult::default()
            }
            .with_start_subscription(name))
        }
        EventDefinitionType::Timer | EventDefinitionType::Signal | EventDefinitionType::None => {
            Ok(ExecutionResult::traverse(outgoing()?))
        }
        EventDefinitionType::Error => Err(CoreError::MalformedEventDefinition(token.current_element_id.clone())),
    }
}

impl ExecutionResult {
    fn with_start_subscription(mut self, message_name: String) -> Self {
        self.variables.insert(
            "__start_subscription".into(),
            serde_json::json!({ "message_name": message_name }),
        );
        self
    }
}

fn execute_catch_event(
    token: &Token,
    event_definitions: &[crate::graph::EventDefinition],
) -> Result<ExecutionResult, CoreError> {
    let event_def = event_definitions
        .first()
        .ok_or_else(|| CoreError::MalformedEventDefinition(token.current_element_id.clone()))?;
    match event_def.kind {
        EventDefinitionType::Timer => {
            let spec = event_def
                .timer
                .clone()
                .ok_or_else(|| CoreError::MalformedEventDefinition(token.current_element_id.clone()))?;
            Ok(ExecutionResult {
                timer_requests: vec![(token.current_element_id.clone(), spec)],
                waiting_for: Some(WaitingFor::Timer(Uuid::nil())),
                ..Default::default()
            })
        }
        EventDefinitionType::Message => {
            let name = event_def
                .message_name
                .clone()
                .ok_or_else(|| CoreError::MalformedEventDefinition(token.current_element_id.clone()))?;
            let key = correlation_key(token, event_def.correlation_key_expr.as_deref())?;
            Ok(ExecutionResult {
                waiting_for: Some(WaitingFor::Message(key.clone())),
                message_catch_subscriptions: vec![(token.current_element_id.clone(), name, key)],
                ..Default::default()
            })
        }
        EventDefinitionType::Signal => {
            let name = event_def
                .signal_name
                .clone()
                .ok_or_else(|| CoreError::MalformedEventDefinition(token.current_element_id.clone()))?;
            Ok(ExecutionResult {
                waiting_for: Some(WaitingFor::Signal(name.clone())),
                signal_catch_subscriptions: vec![(token.current_element_id.clone(), name)],
                ..Default::default()
            })
        }
        EventDefinitionType::None | EventDefinitionType::Error => {
            Err(CoreError::MalformedEventDefinition(token.current_element_id.clone()))
        }
    }
}

fn execute_throw_event(
    token: &Token,
    event_definitions: &[crate::graph::EventDefinition],
) -> Result<ExecutionResult, CoreError> {
    if let Some(event_def) = event_definitions.first() {
        if event_def.kind == EventDefinitionType::Message {
            let name = event_def
                .message_name
                .clone()
                .ok_or_else(|| CoreError::MalformedEventDefinition(token.current_element_id.clone()))?;
            let key = correlation_key(token, event_def.correlation_key_expr.as_deref())?;
            let mut result = ExecutionResult::default();
            result.variables.insert(
                "__publish_message".into(),
                serde_json::json!({ "name": name, "key": key }),
            );
            return Ok(result);
        }
    }
    Ok(ExecutionResult::default())
}

fn execute_activity_task(token: &Token, job_type: String, retries: Option<u32>) -> ExecutionResult {
    ExecutionResult {
        waiting_for: Some(WaitingFor::Job(Uuid::nil())),
        job_request: Some(JobIntent {
            job_type,
            retries: retries.unwrap_or(3),
        }),
        ..Default::default()
    }
    .suppress_unused(token)
}

impl ExecutionResult {
    fn suppress_unused(self, _token: &Token) -> Self {
        self
    }
}

fn execute_script_task(token: &Token, script: &str) -> Result<ExecutionResult, CoreError> {
    // A script is a single assignment `var = <expr-literal>` evaluated
    // against the token's own variables, kept intentionally small since a
    // full scripting language is out of scope.
    let (target, literal) = script
        .split_once('=')
        .ok_or_else(|| CoreError::ExpressionEval(format!("malformed script on {}", token.current_element_id)))?;
    let value = expr::evaluate_literal(literal.trim()).map_err(|e| CoreError::ExpressionEval(e.to_string()))?;
    let mut result = ExecutionResult::default();
    result.variables.insert(target.trim().to_string(), value);
    Ok(result)
}

fn execute_exclusive_gateway(def: &ProcessDefinition, token: &Token) -> Result<ExecutionResult, CoreError> {
    let outgoing = def.outgoing(&token.current_element_id)?;
    let mut default_flow = None;
    for flow in &outgoing {
        if flow.is_default {
            default_flow = Some(flow.flow_id.clone());
            continue;
        }
        let Some(condition) = &flow.condition else { continue };
        if expr::evaluate(condition, &token.variables).map_err(|e| CoreError::ExpressionEval(e.to_string()))? {
            return Ok(ExecutionResult::traverse(vec![flow.flow_id.clone()]));
        }
    }
    match default_flow {
        Some(flow_id) => Ok(ExecutionResult::traverse(vec![flow_id])),
        None => Err(CoreError::ExpressionEval(format!(
            "NO_PATH: no condition matched and no default flow at {}",
            token.current_element_id
        ))),
    }
}

fn execute_parallel_gateway(
    def: &ProcessDefinition,
    token: &Token,
    direction: GatewayDirection,
) -> Result<ExecutionResult, CoreError> {
    match direction {
        GatewayDirection::Diverging => {
            let outgoing = def.outgoing(&token.current_element_id)?;
            let targets: Vec<String> = outgoing.into_iter().map(|f| f.flow_id.clone()).collect();
            Ok(ExecutionResult {
                completed: targets.len() > 1,
                next_elements: if targets.len() <= 1 { targets.clone() } else { vec![] },
                new_token_targets: if targets.len() > 1 { targets } else { vec![] },
                ..Default::default()
            })
        }
        GatewayDirection::Converging => {
            // The actual atomic join bookkeeping lives in the store
            // (`TokenStore::gateway_arrive`); the processor calls it and
            // decides completed-vs-traverse based on the result, since it
            // needs a store handle the executor doesn't have.
            Ok(ExecutionResult {
                completed: false,
                ..Default::default()
            }
            .mark_pending_join())
        }
    }
}

impl ExecutionResult {
    fn mark_pending_join(mut self) -> Self {
        self.variables.insert("__pending_join".into(), serde_json::json!(true));
        self
    }
}

fn execute_inclusive_gateway(
    def: &ProcessDefinition,
    token: &Token,
    direction: GatewayDirection,
) -> Result<ExecutionResult, CoreError> {
    match direction {
        GatewayDirection::Diverging => {
            let outgoing = def.outgoing(&token.current_element_id)?;
            let mut taken = Vec::new();
            for flow in &outgoing {
                let matches = match &flow.condition {
                    Some(cond) => expr::evaluate(cond, &token.variables)
                        .map_err(|e| CoreError::ExpressionEval(e.to_string()))?,
                    None => flow.is_default,
                };
                if matches {
                    taken.push(flow.flow_id.clone());
                }
            }
            if taken.is_empty() {
                return Err(CoreError::ExpressionEval(format!(
                    "NO_PATH: no inclusive condition matched at {}",
                    token.current_element_id
                )));
            }
            Ok(ExecutionResult {
                completed: taken.len() > 1,
                next_elements: if taken.len() <= 1 { taken.clone() } else { vec![] },
                new_token_targets: if taken.len() > 1 { taken } else { vec![] },
                ..Default::default()
            })
        }
        GatewayDirection::Converging => execute_parallel_gateway(def, token, GatewayDirection::Converging),
    }
}

/// An event-based gateway registers a catch subscription for every
/// downstream event, keyed by that event's own element id, not the
/// gateway's: whichever fires first resumes the token at that element, and
/// the processor cancels the rest.
fn execute_event_based_gateway(def: &ProcessDefinition, token: &Token) -> Result<ExecutionResult, CoreError> {
    let outgoing = def.outgoing(&token.current_element_id)?;
    let mut result = ExecutionResult::default();
    for flow in &outgoing {
        let target = def.resolve_target_of_flow(&flow.flow_id)?;
        if let ElementKind::IntermediateCatchEvent { event_definitions } = &target.kind {
            if let Some(event_def) = event_definitions.first() {
                match event_def.kind {
                    EventDefinitionType::Message => {
                        if let Some(name) = &event_def.message_name {
                            let key = correlation_key(token, event_def.correlation_key_expr.as_deref())?;
                            result.message_catch_subscriptions.push((target.id.clone(), name.clone(), key));
                        }
                    }
                    EventDefinitionType::Signal => {
                        if let Some(name) = &event_def.signal_name {
                            result.signal_catch_subscriptions.push((target.id.clone(), name.clone()));
                        }
                    }
                    EventDefinitionType::Timer => {
                        if let Some(spec) = &event_def.timer {
                            result.timer_requests.push((target.id.clone(), spec.clone()));
                        }
                    }
                    EventDefinitionType::None | EventDefinitionType::Error => {}
                }
            }
        }
    }
    if result.message_catch_subscriptions.is_empty()
        && result.signal_catch_subscriptions.is_empty()
        && result.timer_requests.is_empty()
    {
        return Err(CoreError::MalformedEventDefinition(token.current_element_id.clone()));
    }
    result.waiting_for = Some(WaitingFor::Message(token.instance_id.to_string()));
    Ok(result)
}

/// Attachment protocol: subscriptions an activity-entering token
/// must register for its boundary events. Best-effort — a failure here is
/// logged by the processor, never propagated as a hard error.
pub fn boundary_registrations(
    def: &ProcessDefinition,
    token: &Token,
) -> Vec<BoundaryRegistration> {
    def.boundary_events_attached_to(&token.current_element_id)
        .into_iter()
        .filter_map(|boundary| {
            let ElementKind::BoundaryEvent {
                event_definitions,
                cancel_activity,
                ..
            } = &boundary.kind
            else {
                return None;
            };
            let outgoing_flows = def
                .outgoing(&boundary.id)
                .ok()?
                .into_iter()
                .map(|f| f.flow_id.clone())
                .collect();
            let event_def = event_definitions.first()?;
            Some(BoundaryRegistration {
                element_id: boundary.id.clone(),
                attached_to: token.current_element_id.clone(),
                cancel_activity: *cancel_activity,
                kind: event_def.kind.clone(),
                timer: event_def.timer.clone(),
                message_name: event_def.message_name.clone(),
                correlation_key_expr: event_def.correlation_key_expr.clone(),
                signal_name: event_def.signal_name.clone(),
                error_code: event_def.error_code.clone(),
                outgoing_flows,
            })
        })
        .collect()
}

pub struct BoundaryRegistration {
    pub element_id: String,
    pub attached_to: String,
    pub cancel_activity: bool,
    pub kind: EventDefinitionType,
    pub timer: Option<TimerSpec>,
    pub message_name: Option<String>,
    pub correlation_key_expr: Option<String>,
    pub signal_name: Option<String>,
    pub error_code: Option<String>,
    pub outgoing_flows: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Element, ElementKind as EK, ProcessDefinitionBuilder};
    use crate::vars::Variables;
    use chrono::Utc;

    fn linear_def() -> ProcessDefinition {
        let mut b = ProcessDefinitionBuilder::new("p", 1);
        b.add_element(Element {
            id: "start".into(),
            name: None,
            kind: EK::StartEvent { event_definitions: vec![] },
            extensions: JsonMap::new(),
        });
        b.add_element(Element {
            id: "end".into(),
            name: None,
            kind: EK::EndEvent { terminate: false },
            extensions: JsonMap::new(),
        });
        b.add_flow("f1", "start", "end", None, false);
        b.build().unwrap()
    }

    #[test]
    fn start_event_with_no_definitions_traverses_outgoing() {
        let def = linear_def();
        let token = Token::new_root(Uuid::now_v7(), "p", "start", Variables::new(), Utc::now());
        let result = execute(&def, &token).unwrap();
        assert_eq!(result.next_elements, vec!["f1".to_string()]);
    }

    #[test]
    fn end_event_completes() {
        let def = linear_def();
        let mut token = Token::new_root(Uuid::now_v7(), "p", "end", Variables::new(), Utc::now());
        token.current_element_id = "end".into();
        let result = execute(&def, &token).unwrap();
        assert!(result.completed);
    }
}

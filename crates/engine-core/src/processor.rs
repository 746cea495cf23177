//! Execution processor: interprets an `ExecutionResult` against the store
//! and registries in a fixed commit sequence, then runs the
//! instance-completion check. Grounded in the `tick_fiber` commit phase
//! (`vm.rs`), adapted from bytecode-program-counter advancement to
//! sequence-flow traversal.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::{CoreError, IncidentType};
use crate::events::CoreEvent;
use crate::executors::{self, BoundaryRegistration, ExecutionResult};
use crate::graph::{EventDefinitionType, ProcessDefinition};
use crate::incident::Incident;
use crate::model::{
    ErrorBoundarySubscription, InstanceState, MessageSubscription, SignalSubscription, Token,
    TokenState, WaitingFor,
};
use crate::ports::{JobRequest, Ports};
use crate::store::TokenStore;
use crate::registries::WaitingRegistries;

/// What a single `advance` pass produced, for the dispatcher to decide what
/// to schedule next.
pub enum Advance {
    /// The token suspended; nothing further to schedule.
    Waiting,
    /// The token reached a terminal state.
    Terminal,
    /// Re-enter the dispatcher immediately for this token (single traversal).
    Reenter(Token),
    /// The token completed via split/join and these new tokens must each be
    /// scheduled independently.
    Spawned(Vec<Token>),
}

pub struct Processor<'a> {
    pub def: &'a ProcessDefinition,
    pub store: &'a dyn TokenStore,
    pub registries: &'a WaitingRegistries,
    pub ports: &'a Ports,
}

impl<'a> Processor<'a> {
    pub fn new(
        def: &'a ProcessDefinition,
        store: &'a dyn TokenStore,
        registries: &'a WaitingRegistries,
        ports: &'a Ports,
    ) -> Self {
        Self { def, store, registries, ports }
    }

    /// Executes `token`'s current element and applies the result.
    pub async fn advance(&self, token: Token) -> Result<Advance, CoreError> {
        let result = match executors::execute(self.def, &token) {
            Ok(r) => r,
            Err(e) => return self.fail_token(token, e).await.map(|_| Advance::Terminal),
        };
        self.apply(token, result).await
    }

    async fn apply(&self, mut token: Token, mut result: ExecutionResult) -> Result<Advance, CoreError> {
        // Step 1: variable merge. Side-channel `__`-prefixed keys are read
        // below, so the map must survive this pass intact.
        for (k, v) in result.variables.iter() {
            if k.starts_with("__") {
                continue;
            }
            token.variables.set(k.clone(), v.clone());
        }

        // Side-channel variables the executors stash for the processor.
        let publish = result
            .variables
            .get("__publish_message")
            .cloned()
            .or_else(|| None);
        let pending_join = result.variables.contains_key("__pending_join");

        // Step 2: timer requests. Usually one, owned by the current
        // element; an event-based gateway contributes one per downstream
        // timer catch, all resolved before any of them is known to win.
        let mut resolved_immediately = false;
        for (owner, spec) in &result.timer_requests {
            let timer_id = self
                .ports
                .timers
                .create_timer(spec)
                .await
                .map_err(|e| CoreError::MalformedEventDefinition(e.to_string()))?;
            let record = crate::model::TimerRecord {
                id: timer_id,
                token_id: Some(token.id),
                element_id: owner.clone(),
                instance_id: token.instance_id,
                kind: crate::model::TimerKind::Event,
                state: crate::model::TimerState::Scheduled,
                due_at: spec.due_at(Utc::now()),
                spec: spec.clone(),
                attached_to: None,
                cancel_activity: None,
            };
            self.store.save_timer(&record).await.map_err(CoreError::from)?;
            self.registries.register_timer(timer_id, token.id, owner.clone());
            self.store
                .append_event(token.instance_id, &CoreEvent::TimerScheduled {
                    timer_id,
                    element_id: owner.clone(),
                    due_at: record.due_at,
                })
                .await
                .map_err(CoreError::from)?;
            result.waiting_for = Some(WaitingFor::Timer(timer_id));
        }

        // Register message/signal catch subscriptions produced by the
        // executor; an event-based gateway contributes one per downstream
        // event, each keyed by that event's own element id rather than the
        // gateway's.
        for (owner, name, key) in &result.message_catch_subscriptions {
            let sub = MessageSubscription {
                id: Uuid::now_v7(),
                definition_key: token.definition_key.clone(),
                start_event_id: None,
                token_id: Some(token.id),
                message_name: name.clone(),
                correlation_key: key.clone(),
                active: true,
                created_at: Utc::now(),
                element_id: Some(owner.clone()),
                cancel_activity: None,
            };
            // Ordering guarantee: check for a buffered match before
            // the subscription becomes externally visible via registration.
            if let Some(buffered) = self
                .store
                .take_buffered_message(name, key)
                .await
                .map_err(CoreError::from)?
            {
                token.variables.merge(&buffered.variables);
                token.current_element_id = owner.clone();
                result.waiting_for = None;
                result.next_elements = self
                    .def
                    .outgoing(owner)?
                    .into_iter()
                    .map(|f| f.flow_id.clone())
                    .collect();
                resolved_immediately = true;
            } else {
                self.store.save_message_subscription(&sub).await.map_err(CoreError::from)?;
                self.registries.register_message_catch(sub);
            }
        }
        for (owner, name) in &result.signal_catch_subscriptions {
            let sub = SignalSubscription {
                id: Uuid::now_v7(),
                signal_name: name.clone(),
                token_id: token.id,
                element_id: owner.clone(),
                cancel_activity: false,
                variables: token.variables.clone(),
            };
            self.store.save_signal_subscription(&sub).await.map_err(CoreError::from)?;
            self.registries.register_signal(sub);
        }

        // One of several event-based-gateway catches already resolved from
        // a buffered message: the rest never get a chance to fire, so tear
        // them down now instead of leaving them pending forever.
        if resolved_immediately {
            self.clear_pending_catches(token.id).await;
        }
        if let Some(job) = &result.job_request {
            let job_id = self
                .ports
                .jobs
                .create_job(JobRequest {
                    job_type: job.job_type.clone(),
                    instance_id: token.instance_id,
                    element_id: token.current_element_id.clone(),
                    token_id: token.id,
                    retries: job.retries,
                    variables: token.variables.clone(),
                    headers: Default::default(),
                    timeout_ms: None,
                })
                .await
                .map_err(|e| CoreError::MalformedEventDefinition(e.to_string()))?;
            self.registries.register_job(job_id, token.id, token.current_element_id.clone());
            result.waiting_for = Some(WaitingFor::Job(job_id));
            self.store
                .append_event(token.instance_id, &CoreEvent::JobCreated {
                    job_id,
                    element_id: token.current_element_id.clone(),
                })
                .await
                .map_err(CoreError::from)?;
        }
        if let Some(publish) = &publish {
            let name = publish["name"].as_str().unwrap_or_default();
            let key = publish["key"].as_str().unwrap_or_default();
            self.ports
                .messages
                .publish_message(name, key, &token.variables)
                .await
                .map_err(|e| CoreError::MalformedEventDefinition(e.to_string()))?;
        }
        if let Some(sub) = result.variables.get("__start_subscription").cloned() {
            let name = sub["message_name"].as_str().unwrap_or_default().to_string();
            let ms = MessageSubscription {
                id: Uuid::now_v7(),
                definition_key: token.definition_key.clone(),
                start_event_id: Some(token.current_element_id.clone()),
                token_id: None,
                message_name: name,
                correlation_key: token.instance_id.to_string(),
                active: true,
                created_at: Utc::now(),
                element_id: None,
                cancel_activity: None,
            };
            self.store.save_message_subscription(&ms).await.map_err(CoreError::from)?;
            self.registries.register_message_start(ms);
        }

        // Boundary-event attachment, best-effort.
        if !pending_join {
            for reg in executors::boundary_registrations(self.def, &token) {
                if let Err(e) = self.register_boundary(&token, reg).await {
                    tracing::warn!(error = %e, token_id = %token.id, "boundary registration failed, continuing");
                }
            }
        }

        // Parallel/inclusive join: delegate to the store's atomic op.
        if pending_join {
            return self.advance_join(token).await;
        }

        // Step 3: waiting.
        if let Some(waiting_for) = result.waiting_for {
            let tag = waiting_for.to_string();
            token.state = TokenState::Waiting;
            token.waiting_for = Some(waiting_for);
            token.updated_at = Utc::now();
            self.store.update_token(&token).await.map_err(CoreError::from)?;
            self.store
                .append_event(token.instance_id, &CoreEvent::TokenWaiting { token_id: token.id, waiting_for: tag })
                .await
                .map_err(CoreError::from)?;
            return Ok(Advance::Waiting);
        }

        // Step 4: completion.
        if result.completed {
            return self.complete_token(token).await;
        }

        // Step 5/6: traversal, possibly spawning siblings for splits.
        let mut targets: Vec<String> = Vec::new();
        for flow_id in &result.next_elements {
            targets.push(self.def.resolve_target_of_flow(flow_id)?.id.clone());
        }
        for target in &result.new_token_targets {
            targets.push(self.def.resolve_target_of_flow(target)?.id.clone());
        }
        self.traverse(token, targets).await
    }

    /// Resolves `targets` (already-resolved element ids, not flow ids) from
    /// the token's current element and either re-enters on the sole target,
    /// completes if there are none, or splits into one sibling per target.
    async fn traverse(&self, mut token: Token, mut targets: Vec<String>) -> Result<Advance, CoreError> {
        match targets.len() {
            0 => self.complete_token(token).await,
            1 => {
                let from = token.current_element_id.clone();
                token.previous_element_id = Some(from.clone());
                token.current_element_id = targets.remove(0);
                token.updated_at = Utc::now();
                self.store.update_token(&token).await.map_err(CoreError::from)?;
                self.store
                    .append_event(token.instance_id, &CoreEvent::TokenTraversed {
                        token_id: token.id,
                        from,
                        to: token.current_element_id.clone(),
                    })
                    .await
                    .map_err(CoreError::from)?;
                Ok(Advance::Reenter(token))
            }
            _ => {
                token.state = TokenState::Completed;
                token.updated_at = Utc::now();
                self.store.update_token(&token).await.map_err(CoreError::from)?;
                self.deregister_all(&token).await;
                let mut spawned = Vec::new();
                for target in targets {
                    let sibling = token.spawn_sibling(target, Utc::now());
                    self.store.save_token(&sibling).await.map_err(CoreError::from)?;
                    self.store
                        .append_event(sibling.instance_id, &CoreEvent::TokenCreated {
                            token_id: sibling.id,
                            instance_id: sibling.instance_id,
                            element_id: sibling.current_element_id.clone(),
                            parent_token_id: sibling.parent_token_id,
                        })
                        .await
                        .map_err(CoreError::from)?;
                    spawned.push(sibling);
                }
                self.check_instance_completion(token.instance_id).await?;
                Ok(Advance::Spawned(spawned))
            }
        }
    }

    /// Resumes a token whose wait has just been satisfied (job/timer fired,
    /// message/signal correlated) at `arrived_at` — the specific element
    /// whose wait condition was met. For a plain catch event or task this
    /// is always the token's own current element; for an event-based
    /// gateway it's whichever downstream catch won the race, which is why
    /// callers must name it explicitly rather than this method assuming
    /// `token.current_element_id`. Merges the incoming variables, cancels
    /// any sibling catches still pending for this token, then traverses
    /// past `arrived_at` along its outgoing flows — the element itself is
    /// never re-executed, since re-invoking its executor would simply
    /// re-request the same job/timer/subscription.
    pub async fn resume(
        &self,
        mut token: Token,
        variables: &crate::vars::Variables,
        arrived_at: &str,
    ) -> Result<Advance, CoreError> {
        token.variables.merge(variables);
        token.current_element_id = arrived_at.to_string();
        self.clear_pending_catches(token.id).await;
        let outgoing = self.def.outgoing(arrived_at)?;
        let targets: Vec<String> = outgoing
            .into_iter()
            .map(|f| f.flow_id.clone())
            .collect();
        let mut resolved = Vec::with_capacity(targets.len());
        for flow_id in &targets {
            resolved.push(self.def.resolve_target_of_flow(flow_id)?.id.clone());
        }
        self.traverse(token, resolved).await
    }

    /// Cancels and deregisters every timer/message/signal catch still
    /// pending for `token_id` — called once one of them has fired, so the
    /// rest of an event-based gateway's downstream events don't linger.
    async fn clear_pending_catches(&self, token_id: Uuid) {
        for timer_id in self.registries.timers_for_token(token_id) {
            let _ = self.ports.timers.cancel_timer(timer_id).await;
        }
        self.registries.deregister_timers_for_token(token_id);
        for sub in self.registries.take_message_catches_for_token(token_id) {
            let _ = self.store.delete_message_subscription(sub.id).await;
        }
        for sub in self.registries.take_signals_for_token(token_id) {
            let _ = self.store.delete_signal_subscription(sub.id).await;
        }
    }

    async fn advance_join(&self, mut token: Token) -> Result<Advance, CoreError> {
        let gateway_id = token.current_element_id.clone();
        let required = self.def.incoming_count(&gateway_id)?;
        let flow_id = token
            .previous_element_id
            .clone()
            .unwrap_or_else(|| gateway_id.clone());
        let sync = self
            .store
            .gateway_arrive(&gateway_id, token.instance_id, &flow_id, required)
            .await
            .map_err(CoreError::from)?;
        self.store
            .append_event(token.instance_id, &CoreEvent::GatewayJoinArrived {
                gateway_id: gateway_id.clone(),
                instance_id: token.instance_id,
                arrived: sync.arrived_from_flows.len(),
                expected: sync.required_incoming_count,
            })
            .await
            .map_err(CoreError::from)?;

        if sync.arrived_from_flows.len() < sync.required_incoming_count {
            token.state = TokenState::Completed;
            token.updated_at = Utc::now();
            self.store.update_token(&token).await.map_err(CoreError::from)?;
            self.check_instance_completion(token.instance_id).await?;
            return Ok(Advance::Terminal);
        }

        self.store
            .delete_gateway_sync(&gateway_id, token.instance_id)
            .await
            .map_err(CoreError::from)?;
        self.store
            .append_event(token.instance_id, &CoreEvent::GatewayJoinReleased {
                gateway_id: gateway_id.clone(),
                instance_id: token.instance_id,
            })
            .await
            .map_err(CoreError::from)?;

        let outgoing = self.def.outgoing(&gateway_id)?;
        match outgoing.len() {
            0 => self.complete_token(token).await,
            1 => {
                token.current_element_id = self.def.resolve_target_of_flow(&outgoing[0].flow_id)?.id.clone();
                token.updated_at = Utc::now();
                self.store.update_token(&token).await.map_err(CoreError::from)?;
                Ok(Advance::Reenter(token))
            }
            _ => {
                let mut spawned = Vec::new();
                for flow in &outgoing {
                    let target = self.def.resolve_target_of_flow(&flow.flow_id)?.id.clone();
                    let sibling = token.spawn_sibling(target, Utc::now());
                    self.store.save_token(&sibling).await.map_err(CoreError::from)?;
                    spawned.push(sibling);
                }
                token.state = TokenState::Completed;
                self.store.update_token(&token).await.map_err(CoreError::from)?;
                Ok(Advance::Spawned(spawned))
            }
        }
    }

    async fn register_boundary(&self, token: &Token, reg: BoundaryRegistration) -> Result<(), CoreError> {
        let reg_element_id = reg.element_id.clone();
        match reg.kind {
            EventDefinitionType::Timer => {
                let spec = reg
                    .timer
                    .ok_or_else(|| CoreError::MalformedEventDefinition(reg.element_id.clone()))?;
                let timer_id = self
                    .ports
                    .timers
                    .create_timer(&spec)
                    .await
                    .map_err(|e| CoreError::MalformedEventDefinition(e.to_string()))?;
                let record = crate::model::TimerRecord {
                    id: timer_id,
                    token_id: Some(token.id),
                    element_id: reg.element_id.clone(),
                    instance_id: token.instance_id,
                    kind: crate::model::TimerKind::Boundary,
                    state: crate::model::TimerState::Scheduled,
                    due_at: spec.due_at(Utc::now()),
                    spec,
                    attached_to: Some(reg.attached_to),
                    cancel_activity: Some(reg.cancel_activity),
                };
                self.store.save_timer(&record).await.map_err(CoreError::from)?;
                self.registries.register_timer(timer_id, token.id, reg.element_id);
            }
            EventDefinitionType::Error => {
                let sub = ErrorBoundarySubscription {
                    token_id: token.id,
                    element_id: reg.element_id,
                    error_code: reg.error_code,
                    attached_to_ref: reg.attached_to,
                    cancel_activity: reg.cancel_activity,
                    outgoing_flows: reg.outgoing_flows,
                };
                self.store.save_error_boundary(&sub).await.map_err(CoreError::from)?;
                self.registries.register_error_boundary(sub);
            }
            EventDefinitionType::Message => {
                let name = reg
                    .message_name
                    .ok_or_else(|| CoreError::MalformedEventDefinition(reg.element_id.clone()))?;
                let key = match reg.correlation_key_expr.as_deref() {
                    Some(expr) => token.variables.correlation_key(expr).map_err(CoreError::from)?,
                    None => token.instance_id.to_string(),
                };
                let sub = MessageSubscription {
                    id: Uuid::now_v7(),
                    definition_key: token.definition_key.clone(),
                    start_event_id: None,
                    token_id: Some(token.id),
                    message_name: name,
                    correlation_key: key,
                    active: true,
                    created_at: Utc::now(),
                    element_id: Some(reg.element_id.clone()),
                    cancel_activity: Some(reg.cancel_activity),
                };
                self.store.save_message_subscription(&sub).await.map_err(CoreError::from)?;
                self.registries.register_message_catch(sub);
            }
            EventDefinitionType::Signal => {
                let name = reg
                    .signal_name
                    .ok_or_else(|| CoreError::MalformedEventDefinition(reg.element_id.clone()))?;
                let sub = SignalSubscription {
                    id: Uuid::now_v7(),
                    signal_name: name,
                    token_id: token.id,
                    element_id: reg.element_id,
                    cancel_activity: reg.cancel_activity,
                    variables: token.variables.clone(),
                };
                self.store.save_signal_subscription(&sub).await.map_err(CoreError::from)?;
                self.registries.register_signal(sub);
            }
            EventDefinitionType::None => {}
        }
        self.store
            .append_event(token.instance_id, &CoreEvent::BoundaryRegistered {
                token_id: token.id,
                boundary_element_id: reg_element_id,
            })
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    async fn complete_token(&self, mut token: Token) -> Result<Advance, CoreError> {
        token.state = TokenState::Completed;
        token.waiting_for = None;
        token.updated_at = Utc::now();
        self.store.update_token(&token).await.map_err(CoreError::from)?;
        self.deregister_all(&token).await;
        self.store
            .append_event(token.instance_id, &CoreEvent::TokenCompleted { token_id: token.id })
            .await
            .map_err(CoreError::from)?;
        self.check_instance_completion(token.instance_id).await?;
        Ok(Advance::Terminal)
    }

    async fn fail_token(&self, mut token: Token, err: CoreError) -> Result<(), CoreError> {
        token.state = TokenState::Failed;
        token.updated_at = Utc::now();
        self.store.update_token(&token).await.map_err(CoreError::from)?;
        self.deregister_all(&token).await;
        let incident = Incident {
            id: Uuid::now_v7(),
            incident_type: err.incident_type(),
            message: err.to_string(),
            instance_id: token.instance_id,
            element_id: token.current_element_id.clone(),
            element_type: "unknown".into(),
            job_id: None,
            error_code: None,
            original_retries: None,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        self.store.save_incident(&incident).await.map_err(CoreError::from)?;
        self.store
            .update_instance_state(token.instance_id, InstanceState::Incident)
            .await
            .map_err(CoreError::from)?;
        let _ = self.ports.incidents.raise(&incident).await;
        self.store
            .append_event(token.instance_id, &CoreEvent::InstanceIncident {
                instance_id: token.instance_id,
                incident_id: incident.id,
                incident_type: incident.incident_type,
            })
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    async fn deregister_all(&self, token: &Token) {
        self.registries.deregister_timers_for_token(token.id);
        self.registries.deregister_message_catch(token.id);
        self.registries.deregister_error_boundaries_for_token(token.id);
        let _ = self.store.delete_error_boundaries_for_token(token.id).await;
    }

    /// Idempotent, runs after every terminal transition.
    pub async fn check_instance_completion(&self, instance_id: Uuid) -> Result<(), CoreError> {
        let tokens = self.store.load_tokens_by_instance(instance_id).await.map_err(CoreError::from)?;
        if !tokens.is_empty() && tokens.iter().all(|t| t.is_terminal()) {
            self.store
                .update_instance_state(instance_id, InstanceState::Completed)
                .await
                .map_err(CoreError::from)?;
            self.store
                .append_event(instance_id, &CoreEvent::InstanceCompleted { instance_id })
                .await
                .map_err(CoreError::from)?;
        }
        Ok(())
    }

    /// Cancel every non-terminal token of an instance.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> Result<(), CoreError> {
        self.store
            .update_instance_state(instance_id, InstanceState::Canceled)
            .await
            .map_err(CoreError::from)?;
        let tokens = self.store.load_tokens_by_instance(instance_id).await.map_err(CoreError::from)?;
        for mut token in tokens {
            if token.is_terminal() {
                continue;
            }
            if let Some(WaitingFor::Timer(timer_id)) = token.waiting_for {
                let _ = self.ports.timers.cancel_timer(timer_id).await;
                self.registries.deregister_timer(timer_id);
            }
            if let Some(WaitingFor::Job(job_id)) = token.waiting_for {
                let _ = self.ports.jobs.cancel_job(job_id).await;
                self.registries.deregister_job(job_id);
            }
            token.state = TokenState::Canceled;
            token.waiting_for = None;
            token.updated_at = Utc::now();
            self.store.update_token(&token).await.map_err(CoreError::from)?;
            self.deregister_all(&token).await;
            self.store
                .append_event(instance_id, &CoreEvent::TokenCanceled {
                    token_id: token.id,
                    reason: "instance cancelled".into(),
                })
                .await
                .map_err(CoreError::from)?;
        }
        self.store
            .append_event(instance_id, &CoreEvent::InstanceCanceled {
                instance_id,
                reason: "cancel requested".into(),
            })
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }
}

pub fn incident_type_for(err: &CoreError) -> IncidentType {
    err.incident_type()
}

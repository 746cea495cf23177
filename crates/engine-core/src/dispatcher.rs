//! Dispatcher. The engine facade: `execute_token` is the sole entry
//! point for internal re-entry; `on_timer_fired`/`on_job_completed`/
//! `correlate_message`/`broadcast_signal`/`cancel_instance` are the entry
//! points external adapters call into. Owns per-token and per-instance lock
//! tables (the engine's analogue of `BpmnLiteEngine`'s single facade over
//! fibers) and bounds concurrency with a semaphore; the lock-free `DashMap`
//! registration table is the same concurrent-access shape workflow engines
//! in this space reach for when many tokens can be in flight at once.

use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::graph::ProcessDefinition;
use crate::model::{InstanceState, ProcessInstance, Token};
use crate::ports::Ports;
use crate::processor::{Advance, Processor};
use crate::registries::WaitingRegistries;
use crate::store::TokenStore;
use crate::vars::Variables;

/// Catches a panic inside executor/processor code and converts it into a
/// `SYSTEM` incident instead of letting it unwind into the worker pool.
async fn guarded<F, T>(fut: F) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    // `catch_unwind` needs `UnwindSafe`; futures aren't generally that, so
    // this relies on `AssertUnwindSafe` the way a fiber-tick loop would
    // wrap each step.
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "executor panicked".to_string());
            Err(CoreError::ExecutorPanic(message))
        }
    }
}
pub struct Engine {
    def: Arc<ProcessDefinition>,
    store: Arc<dyn TokenStore>,
    registries: Arc<WaitingRegistries>,
    ports: Arc<Ports>,
    token_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    instance_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    worker_permits: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        def: Arc<ProcessDefinition>,
        store: Arc<dyn TokenStore>,
        registries: Arc<WaitingRegistries>,
        ports: Arc<Ports>,
        max_concurrent_tokens: usize,
    ) -> Self {
        Self {
            def,
            store,
            registries,
            ports,
            token_locks: DashMap::new(),
            instance_locks: DashMap::new(),
            worker_permits: Arc::new(Semaphore::new(max_concurrent_tokens)),
        }
    }

    /// Warm-start: rebuild registries from the store, for recovery after a
    /// restart.
    pub async fn rehydrate(&self) -> Result<(), CoreError> {
        self.registries.rehydrate(self.store.as_ref()).await.map_err(CoreError::from)
    }

    fn token_lock(&self, token_id: Uuid) -> Arc<Mutex<()>> {
        self.token_locks.entry(token_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn instance_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.instance_locks.entry(instance_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn processor(&self) -> Processor<'_> {
        Processor::new(&self.def, self.store.as_ref(), &self.registries, &self.ports)
    }

    /// Resolves where a fired boundary event actually sends its token: the
    /// element downstream of the boundary's own outgoing sequence flow, not
    /// the boundary element itself (which executors refuse to run directly).
    fn boundary_target(&self, boundary_element_id: &str) -> Result<String, CoreError> {
        let flow = self
            .def
            .outgoing(boundary_element_id)?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::MalformedEventDefinition(boundary_element_id.to_string()))?;
        Ok(self.def.resolve_target_of_flow(&flow.flow_id)?.id.clone())
    }

    /// Starts a new process instance at its (unique, non-message) start
    /// event, or at `start_element_id` when given explicitly.
    pub async fn start_instance(
        &self,
        start_element_id: Option<&str>,
        variables: Variables,
    ) -> Result<Uuid, CoreError> {
        let start_id = match start_element_id {
            Some(id) => id.to_string(),
            None => self
                .def
                .start_event_ids
                .first()
                .cloned()
                .ok_or_else(|| CoreError::MalformedEventDefinition("no start event".into()))?,
        };
        let now = chrono::Utc::now();
        let instance = ProcessInstance::new(self.def.key.clone(), variables.clone(), now);
        self.store.save_instance(&instance).await.map_err(CoreError::from)?;
        let token = Token::new_root(instance.id, self.def.key.clone(), start_id, variables, now);
        self.store.save_token(&token).await.map_err(CoreError::from)?;
        self.execute_token(token).await?;
        Ok(instance.id)
    }

    /// The sole internal re-entry point: runs a token to its next
    /// suspension or terminal state, looping on `Reenter` and
    /// fanning out on `Spawned` — each spawned sibling gets its own
    /// concurrency permit and lock acquisition.
    pub async fn execute_token(&self, mut token: Token) -> Result<(), CoreError> {
        loop {
            let _permit = self.worker_permits.acquire().await.expect("semaphore not closed");
            let lock = self.token_lock(token.id);
            let _guard = lock.lock().await;

            // Re-check state under lock: a cancellation may have landed
            // between acquiring the permit and the lock.
            let fresh = self.store.load_token(token.id).await.map_err(CoreError::from)?;
            if fresh.is_terminal() {
                return Ok(());
            }

            let advance = guarded(self.processor().advance(fresh)).await?;
            drop(_guard);
            drop(_permit);

            match advance {
                Advance::Waiting | Advance::Terminal => return Ok(()),
                Advance::Reenter(next) => {
                    token = next;
                    continue;
                }
                Advance::Spawned(children) => {
                    for child in children {
                        // Box the recursive async call (see `Box::pin` below)
                        // so the dispatcher tree stays stack-bounded.
                        Box::pin(self.execute_token(child)).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Drives an `Advance` already produced by the processor to completion,
    /// the same way `execute_token`'s loop does, without reloading the token
    /// from the store first (the caller already holds the authoritative
    /// in-memory copy).
    async fn drive(&self, advance: Advance) -> Result<(), CoreError> {
        match advance {
            Advance::Waiting | Advance::Terminal => Ok(()),
            Advance::Reenter(next) => self.execute_token(next).await,
            Advance::Spawned(children) => {
                for child in children {
                    Box::pin(self.execute_token(child)).await?;
                }
                Ok(())
            }
        }
    }

    /// Resumes a token whose wait condition has just been satisfied
    /// externally (job completed, timer fired, message/signal correlated):
    /// merges `variables` and traverses past the now-satisfied element
    /// rather than re-entering it, since re-entering would simply
    /// re-request the same job/timer/subscription.
    async fn resume_token(&self, token: Token, variables: &Variables, arrived_at: &str) -> Result<(), CoreError> {
        let _permit = self.worker_permits.acquire().await.expect("semaphore not closed");
        let lock = self.token_lock(token.id);
        let _guard = lock.lock().await;
        let advance = guarded(self.processor().resume(token, variables, arrived_at)).await?;
        drop(_guard);
        drop(_permit);
        self.drive(advance).await
    }

    // ── External entry points ──

    pub async fn on_timer_fired(&self, timer_id: Uuid) -> Result<(), CoreError> {
        let Some((token_id, _element_id)) = self.registries.lookup_timer(timer_id) else {
            return Ok(());
        };
        self.registries.deregister_timer(timer_id);
        let mut timer = self.store.load_timer(timer_id).await.map_err(CoreError::from)?;
        timer.state = crate::model::TimerState::Fired;
        self.store.update_timer(&timer).await.map_err(CoreError::from)?;

        let instance_lock = self.instance_lock(timer.instance_id);
        let _instance_guard = instance_lock.lock().await;

        let mut token = self.store.load_token(token_id).await.map_err(CoreError::from)?;
        if token.is_terminal() {
            return Ok(());
        }

        if timer.kind == crate::model::TimerKind::Boundary && timer.cancel_activity == Some(true) {
            // Interrupting boundary timer: cancel the attached token, emit
            // a fresh token from the boundary event.
            token.state = crate::model::TokenState::Canceled;
            token.waiting_for = None;
            self.store.update_token(&token).await.map_err(CoreError::from)?;
            self.registries.deregister_timers_for_token(token.id);
            self.registries.deregister_error_boundaries_for_token(token.id);
            drop(_instance_guard);
            let target = self.boundary_target(&timer.element_id)?;
            let sibling = token.spawn_sibling(target, chrono::Utc::now());
            self.store.save_token(&sibling).await.map_err(CoreError::from)?;
            self.execute_token(sibling).await?;
            return Ok(());
        }

        if timer.kind == crate::model::TimerKind::Boundary {
            // Non-interrupting: spawn a sibling, leave the attached token
            // running.
            drop(_instance_guard);
            let target = self.boundary_target(&timer.element_id)?;
            let sibling = token.spawn_sibling(target, chrono::Utc::now());
            self.store.save_token(&sibling).await.map_err(CoreError::from)?;
            self.execute_token(sibling).await?;
            return Ok(());
        }

        drop(_instance_guard);
        let element_id = timer.element_id.clone();
        self.resume_token(token, &Variables::new(), &element_id).await
    }

    pub async fn on_job_completed(&self, job_id: Uuid, variables: Variables) -> Result<(), CoreError> {
        let Some((token_id, element_id)) = self.registries.lookup_job(job_id) else { return Ok(()) };
        self.registries.deregister_job(job_id);
        let token = self.store.load_token(token_id).await.map_err(CoreError::from)?;
        if token.is_terminal() {
            return Ok(());
        }
        self.resume_token(token, &variables, &element_id).await
    }

    /// Retries remaining: the job subsystem itself reschedules; core takes
    /// no action. Retries exhausted: route via error boundary or raise a
    /// `JOB_FAILURE` incident.
    pub async fn on_job_failed(
        &self,
        job_id: Uuid,
        error_message: String,
        retries_remaining: u32,
    ) -> Result<(), CoreError> {
        if retries_remaining > 0 {
            return Ok(());
        }
        let Some((token_id, element_id)) = self.registries.lookup_job(job_id) else { return Ok(()) };
        self.registries.deregister_job(job_id);
        let mut token = self.store.load_token(token_id).await.map_err(CoreError::from)?;
        if token.is_terminal() {
            return Ok(());
        }
        if let Some(boundary) = self.registries.lookup_error_boundary(token.id, None) {
            return self.route_to_boundary(token, boundary).await;
        }
        let incident = crate::incident::Incident {
            id: Uuid::now_v7(),
            incident_type: crate::errors::IncidentType::JobFailure,
            message: error_message,
            instance_id: token.instance_id,
            element_id,
            element_type: "job".into(),
            job_id: Some(job_id),
            error_code: None,
            original_retries: None,
            created_at: chrono::Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        self.store.save_incident(&incident).await.map_err(CoreError::from)?;
        token.state = crate::model::TokenState::Failed;
        self.store.update_token(&token).await.map_err(CoreError::from)?;
        self.store
            .update_instance_state(token.instance_id, InstanceState::Incident)
            .await
            .map_err(CoreError::from)?;
        let _ = self.ports.incidents.raise(&incident).await;
        Ok(())
    }

    pub async fn on_job_error_thrown(
        &self,
        job_id: Uuid,
        error_code: String,
        error_message: String,
        variables: Variables,
    ) -> Result<(), CoreError> {
        let Some((token_id, element_id)) = self.registries.lookup_job(job_id) else { return Ok(()) };
        self.registries.deregister_job(job_id);
        let mut token = self.store.load_token(token_id).await.map_err(CoreError::from)?;
        if token.is_terminal() {
            return Ok(());
        }
        token.variables.merge(&variables);
        token.variables.set("errorCode", serde_json::json!(error_code.clone()));
        token.variables.set("errorMessage", serde_json::json!(error_message.clone()));

        if let Some(boundary) = self.registries.lookup_error_boundary(token.id, Some(&error_code)) {
            return self.route_to_boundary(token, boundary).await;
        }

        token.state = crate::model::TokenState::Canceled;
        self.store.update_token(&token).await.map_err(CoreError::from)?;
        let incident = crate::incident::Incident {
            id: Uuid::now_v7(),
            incident_type: crate::errors::IncidentType::UnhandledBpmnError,
            message: error_message,
            instance_id: token.instance_id,
            element_id,
            element_type: "job".into(),
            job_id: Some(job_id),
            error_code: Some(error_code),
            original_retries: None,
            created_at: chrono::Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        self.store.save_incident(&incident).await.map_err(CoreError::from)?;
        self.store
            .update_instance_state(token.instance_id, InstanceState::Incident)
            .await
            .map_err(CoreError::from)?;
        let _ = self.ports.incidents.raise(&incident).await;
        Ok(())
    }

    async fn route_to_boundary(
        &self,
        mut token: Token,
        boundary: crate::model::ErrorBoundarySubscription,
    ) -> Result<(), CoreError> {
        token.state = crate::model::TokenState::Canceled;
        token.waiting_for = None;
        self.store.update_token(&token).await.map_err(CoreError::from)?;
        self.registries.deregister_error_boundaries_for_token(token.id);
        self.store
            .delete_error_boundaries_for_token(token.id)
            .await
            .map_err(CoreError::from)?;
        let flow_id = boundary
            .outgoing_flows
            .first()
            .ok_or_else(|| CoreError::MalformedEventDefinition(boundary.element_id.clone()))?;
        let target = self.def.resolve_target_of_flow(flow_id)?.id.clone();
        let sibling = token.spawn_sibling(target, chrono::Utc::now());
        self.store.save_token(&sibling).await.map_err(CoreError::from)?;
        self.execute_token(sibling).await
    }

    /// Inbound message correlation.
    pub async fn correlate_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: Variables,
    ) -> Result<crate::ports::MessageCorrelationOutcome, CoreError> {
        let starts = self.registries.lookup_message_start(name, correlation_key);
        let catches = self.registries.lookup_message_catch(name, correlation_key);

        let mut outcome = crate::ports::MessageCorrelationOutcome {
            instance_created: false,
            correlated_token_ids: Vec::new(),
        };

        for start in starts {
            let Some(start_element_id) = start.start_event_id.clone() else { continue };
            let mut init = variables.clone();
            init.set("__message_start", serde_json::json!(true));
            self.start_instance(Some(&start_element_id), init).await?;
            outcome.instance_created = true;
        }

        for catch in catches {
            let Some(token_id) = catch.token_id else { continue };
            let mut token = self.store.load_token(token_id).await.map_err(CoreError::from)?;
            if token.is_terminal() {
                continue;
            }
            self.registries.remove_message_catch(catch.id);
            self.store.delete_message_subscription(catch.id).await.map_err(CoreError::from)?;
            outcome.correlated_token_ids.push(token_id);

            match catch.cancel_activity {
                Some(true) => {
                    // Interrupting message boundary event: cancel the attached
                    // activity and spawn a sibling down the escalation path.
                    token.state = crate::model::TokenState::Canceled;
                    self.store.update_token(&token).await.map_err(CoreError::from)?;
                    let boundary_id = catch.element_id.as_deref().unwrap_or(token.current_element_id.as_str());
                    let target = self.boundary_target(boundary_id)?;
                    let mut sibling = token.spawn_sibling(target, chrono::Utc::now());
                    sibling.variables.merge(&variables);
                    self.store.save_token(&sibling).await.map_err(CoreError::from)?;
                    self.execute_token(sibling).await?;
                }
                Some(false) => {
                    // Non-interrupting boundary: the attached activity keeps
                    // running, a sibling starts down the escalation path.
                    let boundary_id = catch.element_id.as_deref().unwrap_or(token.current_element_id.as_str());
                    let target = self.boundary_target(boundary_id)?;
                    let mut sibling = token.spawn_sibling(target, chrono::Utc::now());
                    sibling.variables.merge(&variables);
                    self.store.save_token(&sibling).await.map_err(CoreError::from)?;
                    self.execute_token(sibling).await?;
                }
                None => {
                    // Plain intermediate catch event: resume the same token.
                    let element_id =
                        catch.element_id.clone().unwrap_or_else(|| token.current_element_id.clone());
                    self.resume_token(token, &variables, &element_id).await?;
                }
            }
        }

        if !outcome.instance_created && outcome.correlated_token_ids.is_empty() {
            let buffered = crate::model::BufferedMessage {
                message_name: name.to_string(),
                correlation_key: correlation_key.to_string(),
                sequence: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
                variables,
                buffered_at: chrono::Utc::now(),
                ttl: std::time::Duration::from_secs(300),
            };
            self.store.buffer_message(&buffered).await.map_err(CoreError::from)?;
        }

        Ok(outcome)
    }

    /// Signal broadcast; mirrors message-catch delivery for every
    /// subscriber.
    pub async fn broadcast_signal(&self, name: &str, variables: Variables) -> Result<usize, CoreError> {
        let subs = self.registries.lookup_signal(name);
        let mut delivered = 0;
        for sub in subs {
            let mut token = self.store.load_token(sub.token_id).await.map_err(CoreError::from)?;
            if token.is_terminal() {
                continue;
            }
            self.registries.deregister_signal(sub.token_id, &sub.element_id);
            self.store.delete_signal_subscription(sub.id).await.map_err(CoreError::from)?;
            let is_boundary =
                self.def.lookup(&sub.element_id).map(|e| e.is_boundary_event()).unwrap_or(false);
            if sub.cancel_activity {
                token.state = crate::model::TokenState::Canceled;
                self.store.update_token(&token).await.map_err(CoreError::from)?;
                let target = self.boundary_target(&sub.element_id)?;
                let mut sibling = token.spawn_sibling(target, chrono::Utc::now());
                sibling.variables.merge(&variables);
                self.store.save_token(&sibling).await.map_err(CoreError::from)?;
                self.execute_token(sibling).await?;
            } else if is_boundary {
                // Non-interrupting boundary signal: the attached activity
                // keeps running, a sibling starts down the escalation path.
                let target = self.boundary_target(&sub.element_id)?;
                let mut sibling = token.spawn_sibling(target, chrono::Utc::now());
                sibling.variables.merge(&variables);
                self.store.save_token(&sibling).await.map_err(CoreError::from)?;
                self.execute_token(sibling).await?;
            } else {
                let element_id = sub.element_id.clone();
                self.resume_token(token, &variables, &element_id).await?;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Cancellation, serialized per instance.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> Result<(), CoreError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;
        self.processor().cancel_instance(instance_id).await
    }
}

//! Waiting registries: in-memory, concurrent-safe indices over the token
//! store for hot dispatch lookups. Backed by `dashmap::DashMap` for
//! lock-free concurrent access, split into five separate tables (timers,
//! jobs, message starts, message catches, signals, error boundaries)
//! instead of one polymorphic key space, since each is keyed and looked up
//! differently.

use std::collections::HashMap;

use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::graph::ElementId;
use crate::model::{ErrorBoundarySubscription, MessageSubscription, SignalSubscription};
use crate::store::TokenStore;

/// Timer table entry: who is waiting and where.
#[derive(Clone, Copy, Debug)]
pub struct TimerEntry {
    pub token_id: Uuid,
    pub element_id_index: usize,
}

#[derive(Default)]
pub struct WaitingRegistries {
    /// timerId -> (tokenId, elementId)
    timers: DashMap<Uuid, (Uuid, ElementId)>,
    /// tokenId -> set of timerIds, for boundary-timer cancellation lookups.
    timers_by_token: DashMap<Uuid, Vec<Uuid>>,
    /// jobId -> (tokenId, elementId)
    jobs: DashMap<Uuid, (Uuid, ElementId)>,
    /// (messageName, correlationKey) -> catch subscriptions
    message_catch: DashMap<(String, String), Vec<MessageSubscription>>,
    /// (messageName, correlationKey) -> process-start subscriptions
    message_start: DashMap<(String, String), Vec<MessageSubscription>>,
    /// signalName -> subscriptions
    signals: DashMap<String, Vec<SignalSubscription>>,
    /// tokenId -> error-boundary subscriptions attached to that token
    error_boundaries: DashMap<Uuid, Vec<ErrorBoundarySubscription>>,
}

impl WaitingRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Timers ──

    pub fn register_timer(&self, timer_id: Uuid, token_id: Uuid, element_id: ElementId) {
        self.timers.insert(timer_id, (token_id, element_id));
        self.timers_by_token.entry(token_id).or_default().push(timer_id);
    }

    pub fn deregister_timer(&self, timer_id: Uuid) {
        if let Some((_, (token_id, _))) = self.timers.remove(&timer_id) {
            if let Some(mut list) = self.timers_by_token.get_mut(&token_id) {
                list.retain(|id| *id != timer_id);
            }
        }
    }

    pub fn lookup_timer(&self, timer_id: Uuid) -> Option<(Uuid, ElementId)> {
        self.timers.get(&timer_id).map(|e| e.clone())
    }

    pub fn timers_for_token(&self, token_id: Uuid) -> Vec<Uuid> {
        self.timers_by_token.get(&token_id).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn deregister_timers_for_token(&self, token_id: Uuid) {
        for timer_id in self.timers_for_token(token_id) {
            self.timers.remove(&timer_id);
        }
        self.timers_by_token.remove(&token_id);
    }

    // ── Jobs ──

    pub fn register_job(&self, job_id: Uuid, token_id: Uuid, element_id: ElementId) {
        self.jobs.insert(job_id, (token_id, element_id));
    }

    pub fn deregister_job(&self, job_id: Uuid) {
        self.jobs.remove(&job_id);
    }

    pub fn lookup_job(&self, job_id: Uuid) -> Option<(Uuid, ElementId)> {
        self.jobs.get(&job_id).map(|e| e.clone())
    }

    // ── Message subscriptions ──

    pub fn register_message_catch(&self, sub: MessageSubscription) {
        let key = (sub.message_name.clone(), sub.correlation_key.clone());
        self.message_catch.entry(key).or_default().push(sub);
    }

    pub fn deregister_message_catch(&self, token_id: Uuid) {
        for mut entry in self.message_catch.iter_mut() {
            entry.retain(|s| s.token_id != Some(token_id));
        }
    }

    /// Removes exactly one catch subscription by id, leaving any other
    /// pending catches for the same token untouched — the event-based
    /// gateway's sibling branches in particular must survive this call.
    pub fn remove_message_catch(&self, id: Uuid) {
        for mut entry in self.message_catch.iter_mut() {
            entry.retain(|s| s.id != id);
        }
    }

    /// Removes and returns every catch subscription still pending for
    /// `token_id`, across every message name — used to tear down the
    /// losing branches once one event-based-gateway catch has fired.
    pub fn take_message_catches_for_token(&self, token_id: Uuid) -> Vec<MessageSubscription> {
        let mut removed = Vec::new();
        for mut entry in self.message_catch.iter_mut() {
            let list = std::mem::take(&mut *entry);
            let (taken, kept): (Vec<_>, Vec<_>) =
                list.into_iter().partition(|s| s.token_id == Some(token_id));
            *entry = kept;
            removed.extend(taken);
        }
        removed
    }

    pub fn lookup_message_catch(&self, name: &str, key: &str) -> Vec<MessageSubscription> {
        self.message_catch
            .get(&(name.to_string(), key.to_string()))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn register_message_start(&self, sub: MessageSubscription) {
        let key = (sub.message_name.clone(), sub.correlation_key.clone());
        self.message_start.entry(key).or_default().push(sub);
    }

    pub fn lookup_message_start(&self, name: &str, key: &str) -> Vec<MessageSubscription> {
        self.message_start
            .get(&(name.to_string(), key.to_string()))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// All subscriptions (catch + start) matching a correlation, in dispatch
    /// order: live catches first, then process-starts.
    pub fn lookup_message(&self, name: &str, key: &str) -> Vec<MessageSubscription> {
        let mut out = self.lookup_message_catch(name, key);
        out.extend(self.lookup_message_start(name, key));
        out
    }

    // ── Signal subscriptions ──

    pub fn register_signal(&self, sub: SignalSubscription) {
        self.signals.entry(sub.signal_name.clone()).or_default().push(sub);
    }

    pub fn deregister_signal(&self, token_id: Uuid, element_id: &str) {
        for mut entry in self.signals.iter_mut() {
            entry.retain(|s| !(s.token_id == token_id && s.element_id == element_id));
        }
    }

    pub fn lookup_signal(&self, name: &str) -> Vec<SignalSubscription> {
        self.signals.get(name).map(|v| v.clone()).unwrap_or_default()
    }

    /// Removes and returns every signal subscription still pending for
    /// `token_id`, across every signal name — the signal counterpart of
    /// `take_message_catches_for_token`.
    pub fn take_signals_for_token(&self, token_id: Uuid) -> Vec<SignalSubscription> {
        let mut removed = Vec::new();
        for mut entry in self.signals.iter_mut() {
            let list = std::mem::take(&mut *entry);
            let (taken, kept): (Vec<_>, Vec<_>) =
                list.into_iter().partition(|s| s.token_id == token_id);
            *entry = kept;
            removed.extend(taken);
        }
        removed
    }

    // ── Error boundaries ──

    pub fn register_error_boundary(&self, sub: ErrorBoundarySubscription) {
        self.error_boundaries.entry(sub.token_id).or_default().push(sub);
    }

    pub fn deregister_error_boundaries_for_token(&self, token_id: Uuid) {
        self.error_boundaries.remove(&token_id);
    }

    /// Longest-exact-match-over-catch-all lookup.
    pub fn lookup_error_boundary(
        &self,
        token_id: Uuid,
        error_code: Option<&str>,
    ) -> Option<ErrorBoundarySubscription> {
        let subs = self.error_boundaries.get(&token_id)?;
        let exact = error_code.and_then(|code| {
            subs.iter().find(|s| s.error_code.as_deref() == Some(code)).cloned()
        });
        exact.or_else(|| subs.iter().find(|s| s.error_code.is_none()).cloned())
    }

    /// Warm-up: rebuild all tables from the durable store after restart.
    pub async fn rehydrate(&self, store: &dyn TokenStore) -> Result<(), StoreError> {
        for timer in store.load_all_timers().await? {
            if matches!(timer.state, crate::model::TimerState::Scheduled) {
                if let Some(token_id) = timer.token_id {
                    self.register_timer(timer.id, token_id, timer.element_id.clone());
                }
            }
        }
        for sub in store.load_all_message_subscriptions().await? {
            if sub.is_process_start() {
                self.register_message_start(sub);
            } else if sub.active {
                self.register_message_catch(sub);
            }
        }
        for sub in store.load_all_signal_subscriptions().await? {
            self.register_signal(sub);
        }
        let active_tokens = store.load_active_tokens().await?;
        let mut seen_instances = HashMap::new();
        for token in &active_tokens {
            seen_instances.entry(token.instance_id).or_insert_with(Vec::new).push(token.id);
        }
        for token in active_tokens {
            for sub in store.load_error_boundaries_for_token(token.id).await? {
                self.register_error_boundary(sub);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageSubscription;
    use chrono::Utc;

    fn sub(name: &str, key: &str, token_id: Option<Uuid>) -> MessageSubscription {
        MessageSubscription {
            id: Uuid::now_v7(),
            definition_key: "p".into(),
            start_event_id: if token_id.is_none() { Some("start".into()) } else { None },
            token_id,
            message_name: name.into(),
            correlation_key: key.into(),
            active: true,
            created_at: Utc::now(),
            element_id: token_id.map(|_| "task".to_string()),
            cancel_activity: None,
        }
    }

    #[test]
    fn timer_registry_round_trip() {
        let reg = WaitingRegistries::new();
        let timer_id = Uuid::now_v7();
        let token_id = Uuid::now_v7();
        reg.register_timer(timer_id, token_id, "t1".into());
        assert_eq!(reg.lookup_timer(timer_id), Some((token_id, "t1".to_string())));
        assert_eq!(reg.timers_for_token(token_id), vec![timer_id]);
        reg.deregister_timer(timer_id);
        assert!(reg.lookup_timer(timer_id).is_none());
        assert!(reg.timers_for_token(token_id).is_empty());
    }

    #[test]
    fn message_catch_and_start_are_distinct_tables() {
        let reg = WaitingRegistries::new();
        reg.register_message_catch(sub("Approved", "order-1", Some(Uuid::now_v7())));
        reg.register_message_start(sub("Approved", "order-1", None));
        assert_eq!(reg.lookup_message_catch("Approved", "order-1").len(), 1);
        assert_eq!(reg.lookup_message_start("Approved", "order-1").len(), 1);
        assert_eq!(reg.lookup_message("Approved", "order-1").len(), 2);
    }

    #[test]
    fn error_boundary_prefers_exact_match_over_catch_all() {
        let reg = WaitingRegistries::new();
        let token_id = Uuid::now_v7();
        reg.register_error_boundary(ErrorBoundarySubscription {
            token_id,
            element_id: "catchAll".into(),
            error_code: None,
            attached_to_ref: "task1".into(),
            cancel_activity: true,
            outgoing_flows: vec![],
        });
        reg.register_error_boundary(ErrorBoundarySubscription {
            token_id,
            element_id: "catchSpecific".into(),
            error_code: Some("INSUFFICIENT_FUNDS".into()),
            attached_to_ref: "task1".into(),
            cancel_activity: true,
            outgoing_flows: vec![],
        });
        let found = reg.lookup_error_boundary(token_id, Some("INSUFFICIENT_FUNDS")).unwrap();
        assert_eq!(found.element_id, "catchSpecific");
        let fallback = reg.lookup_error_boundary(token_id, Some("OTHER_CODE")).unwrap();
        assert_eq!(fallback.element_id, "catchAll");
    }

    #[test]
    fn deregister_boundary_then_register_leaves_preregister_state() {
        let reg = WaitingRegistries::new();
        let token_id = Uuid::now_v7();
        assert!(reg.lookup_error_boundary(token_id, None).is_none());
        reg.register_error_boundary(ErrorBoundarySubscription {
            token_id,
            element_id: "b1".into(),
            error_code: None,
            attached_to_ref: "task1".into(),
            cancel_activity: true,
            outgoing_flows: vec![],
        });
        reg.deregister_error_boundaries_for_token(token_id);
        assert!(reg.lookup_error_boundary(token_id, None).is_none());
    }
}

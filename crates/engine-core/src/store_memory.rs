//! In-memory `TokenStore`, for tests and single-process demos. Mirrors a
//! `MemoryStore`-style store: one `tokio::sync::RwLock<Inner>` guarding
//! plain `HashMap`s, one lock acquire per method.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::events::CoreEvent;
use crate::incident::Incident;
use crate::model::{
    BufferedMessage, ErrorBoundarySubscription, GatewaySyncState, InstanceState,
    MessageSubscription, ProcessInstance, SignalSubscription, TimerRecord, Token, TokenState,
};
use crate::store::{StoreResult, TokenStore};

struct Inner {
    instances: HashMap<Uuid, ProcessInstance>,
    tokens: HashMap<Uuid, Token>,
    message_subs: HashMap<Uuid, MessageSubscription>,
    signal_subs: HashMap<Uuid, SignalSubscription>,
    error_boundaries: HashMap<Uuid, Vec<ErrorBoundarySubscription>>,
    timers: HashMap<Uuid, TimerRecord>,
    gateway_sync: HashMap<(String, Uuid), GatewaySyncState>,
    buffered_messages: Vec<BufferedMessage>,
    events: HashMap<Uuid, Vec<(u64, CoreEvent)>>,
    event_seq: HashMap<Uuid, u64>,
    incidents: HashMap<Uuid, Vec<Incident>>,
}

pub struct MemoryTokenStore {
    inner: RwLock<Inner>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                instances: HashMap::new(),
                tokens: HashMap::new(),
                message_subs: HashMap::new(),
                signal_subs: HashMap::new(),
                error_boundaries: HashMap::new(),
                timers: HashMap::new(),
                gateway_sync: HashMap::new(),
                buffered_messages: Vec::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
                incidents: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save_token(&self, token: &Token) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn update_token(&self, token: &Token) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        if !w.tokens.contains_key(&token.id) {
            return Err(StoreError::NotFound);
        }
        w.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn load_token(&self, id: Uuid) -> StoreResult<Token> {
        let r = self.inner.read().await;
        r.tokens.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn delete_token(&self, id: Uuid) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.tokens.remove(&id);
        Ok(())
    }

    async fn load_tokens_by_instance(&self, instance_id: Uuid) -> StoreResult<Vec<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn load_tokens_by_state(&self, state: TokenState) -> StoreResult<Vec<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens.values().filter(|t| t.state == state).cloned().collect())
    }

    async fn load_active_tokens(&self) -> StoreResult<Vec<Token>> {
        self.load_tokens_by_state(TokenState::Active).await
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        if !w.instances.contains_key(&instance.id) {
            return Err(StoreError::NotFound);
        }
        w.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> StoreResult<ProcessInstance> {
        let r = self.inner.read().await;
        r.instances.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_instance_state(&self, id: Uuid, state: InstanceState) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        let inst = w.instances.get_mut(&id).ok_or(StoreError::NotFound)?;
        inst.state = state;
        if matches!(state, InstanceState::Completed | InstanceState::Canceled) {
            inst.ended_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn save_message_subscription(&self, sub: &MessageSubscription) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.message_subs.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn delete_message_subscription(&self, id: Uuid) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.message_subs.remove(&id);
        Ok(())
    }

    async fn load_message_subscriptions(
        &self,
        message_name: &str,
        correlation_key: &str,
        process_start_only: bool,
    ) -> StoreResult<Vec<MessageSubscription>> {
        let r = self.inner.read().await;
        Ok(r.message_subs
            .values()
            .filter(|s| {
                s.active
                    && s.message_name == message_name
                    && s.correlation_key == correlation_key
                    && (!process_start_only || s.is_process_start())
            })
            .cloned()
            .collect())
    }

    async fn load_all_message_subscriptions(&self) -> StoreResult<Vec<MessageSubscription>> {
        let r = self.inner.read().await;
        Ok(r.message_subs.values().cloned().collect())
    }

    async fn save_signal_subscription(&self, sub: &SignalSubscription) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.signal_subs.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn delete_signal_subscription(&self, id: Uuid) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.signal_subs.remove(&id);
        Ok(())
    }

    async fn load_signal_subscriptions(
        &self,
        signal_name: &str,
    ) -> StoreResult<Vec<SignalSubscription>> {
        let r = self.inner.read().await;
        Ok(r.signal_subs
            .values()
            .filter(|s| s.signal_name == signal_name)
            .cloned()
            .collect())
    }

    async fn load_all_signal_subscriptions(&self) -> StoreResult<Vec<SignalSubscription>> {
        let r = self.inner.read().await;
        Ok(r.signal_subs.values().cloned().collect())
    }

    async fn save_error_boundary(&self, sub: &ErrorBoundarySubscription) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.error_boundaries
            .entry(sub.token_id)
            .or_default()
            .push(sub.clone());
        Ok(())
    }

    async fn delete_error_boundaries_for_token(&self, token_id: Uuid) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.error_boundaries.remove(&token_id);
        Ok(())
    }

    async fn load_error_boundaries_for_token(
        &self,
        token_id: Uuid,
    ) -> StoreResult<Vec<ErrorBoundarySubscription>> {
        let r = self.inner.read().await;
        Ok(r.error_boundaries.get(&token_id).cloned().unwrap_or_default())
    }

    async fn save_timer(&self, timer: &TimerRecord) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.timers.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn update_timer(&self, timer: &TimerRecord) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        if !w.timers.contains_key(&timer.id) {
            return Err(StoreError::NotFound);
        }
        w.timers.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn load_timer(&self, id: Uuid) -> StoreResult<TimerRecord> {
        let r = self.inner.read().await;
        r.timers.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn load_timers_for_token(&self, token_id: Uuid) -> StoreResult<Vec<TimerRecord>> {
        let r = self.inner.read().await;
        Ok(r.timers
            .values()
            .filter(|t| t.token_id == Some(token_id))
            .cloned()
            .collect())
    }

    async fn load_all_timers(&self) -> StoreResult<Vec<TimerRecord>> {
        let r = self.inner.read().await;
        Ok(r.timers.values().cloned().collect())
    }

    async fn load_gateway_sync(
        &self,
        gateway_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Option<GatewaySyncState>> {
        let r = self.inner.read().await;
        Ok(r.gateway_sync
            .get(&(gateway_id.to_string(), instance_id))
            .cloned())
    }

    async fn gateway_arrive(
        &self,
        gateway_id: &str,
        instance_id: Uuid,
        flow_id: &str,
        required_incoming_count: usize,
    ) -> StoreResult<GatewaySyncState> {
        let mut w = self.inner.write().await;
        let key = (gateway_id.to_string(), instance_id);
        let entry = w.gateway_sync.entry(key).or_insert_with(|| GatewaySyncState {
            gateway_id: gateway_id.to_string(),
            instance_id,
            arrived_from_flows: vec![],
            required_incoming_count,
        });
        entry.arrived_from_flows.push(flow_id.to_string());
        Ok(entry.clone())
    }

    async fn delete_gateway_sync(&self, gateway_id: &str, instance_id: Uuid) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.gateway_sync.remove(&(gateway_id.to_string(), instance_id));
        Ok(())
    }

    async fn buffer_message(&self, msg: &BufferedMessage) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.buffered_messages.push(msg.clone());
        Ok(())
    }

    async fn take_buffered_message(
        &self,
        message_name: &str,
        correlation_key: &str,
    ) -> StoreResult<Option<BufferedMessage>> {
        let mut w = self.inner.write().await;
        let now = chrono::Utc::now();
        w.buffered_messages.retain(|m| !m.is_expired(now));
        let pos = w
            .buffered_messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.message_name == message_name && m.correlation_key == correlation_key)
            .min_by_key(|(_, m)| m.sequence)
            .map(|(i, _)| i);
        Ok(pos.map(|i| w.buffered_messages.remove(i)))
    }

    async fn append_event(&self, instance_id: Uuid, event: &CoreEvent) -> StoreResult<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(instance_id).or_insert(0);
        *seq += 1;
        let seq = *seq;
        w.events.entry(instance_id).or_default().push((seq, event.clone()));
        event.trace();
        Ok(seq)
    }

    async fn load_events(&self, instance_id: Uuid) -> StoreResult<Vec<(u64, CoreEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn save_incident(&self, incident: &Incident) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        w.incidents.entry(incident.instance_id).or_default().push(incident.clone());
        Ok(())
    }

    async fn load_incidents(&self, instance_id: Uuid) -> StoreResult<Vec<Incident>> {
        let r = self.inner.read().await;
        Ok(r.incidents.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn resolve_incident(&self, incident_id: Uuid, resolution: &str) -> StoreResult<()> {
        let mut w = self.inner.write().await;
        for incidents in w.incidents.values_mut() {
            if let Some(inc) = incidents.iter_mut().find(|i| i.id == incident_id) {
                inc.resolved_at = Some(chrono::Utc::now());
                inc.resolution = Some(resolution.to_string());
                return Ok(());
            }
        }
        Err(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WaitingFor;
    use crate::vars::Variables;

    fn mk_token(instance_id: Uuid) -> Token {
        Token::new_root(instance_id, "p", "start", Variables::new(), chrono::Utc::now())
    }

    #[tokio::test]
    async fn save_then_load_round_trips_token() {
        let store = MemoryTokenStore::new();
        let instance_id = Uuid::now_v7();
        let token = mk_token(instance_id);
        store.save_token(&token).await.unwrap();
        let loaded = store.load_token(token.id).await.unwrap();
        assert_eq!(loaded.id, token.id);
        assert_eq!(loaded.current_element_id, "start");
    }

    #[tokio::test]
    async fn update_nonexistent_token_errors_not_found() {
        let store = MemoryTokenStore::new();
        let token = mk_token(Uuid::now_v7());
        assert_eq!(store.update_token(&token).await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn gateway_arrive_accumulates_until_required_count() {
        let store = MemoryTokenStore::new();
        let instance_id = Uuid::now_v7();
        let s1 = store.gateway_arrive("gw", instance_id, "f1", 2).await.unwrap();
        assert_eq!(s1.arrived_from_flows.len(), 1);
        let s2 = store.gateway_arrive("gw", instance_id, "f2", 2).await.unwrap();
        assert_eq!(s2.arrived_from_flows.len(), 2);
        assert_eq!(s2.required_incoming_count, 2);
    }

    #[tokio::test]
    async fn buffered_message_is_returned_fifo_by_sequence() {
        let store = MemoryTokenStore::new();
        let now = chrono::Utc::now();
        for seq in [2, 1, 3] {
            store
                .buffer_message(&BufferedMessage {
                    message_name: "M".into(),
                    correlation_key: "k".into(),
                    sequence: seq,
                    variables: Variables::new(),
                    buffered_at: now,
                    ttl: std::time::Duration::from_secs(60),
                })
                .await
                .unwrap();
        }
        let first = store.take_buffered_message("M", "k").await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
    }

    #[tokio::test]
    async fn waiting_for_round_trips_through_token_store() {
        let store = MemoryTokenStore::new();
        let instance_id = Uuid::now_v7();
        let mut token = mk_token(instance_id);
        token.waiting_for = Some(WaitingFor::Message("M".into()));
        store.save_token(&token).await.unwrap();
        let loaded = store.load_token(token.id).await.unwrap();
        assert_eq!(loaded.waiting_for, Some(WaitingFor::Message("M".into())));
    }
}

//! Token store contract. Every method is synchronous-semantically
//! (no partial results) and failure-reporting; implementers supply either a
//! true transaction or optimistic CAS for `gateway_arrive`/`transaction`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::events::CoreEvent;
use crate::model::{
    BufferedMessage, ErrorBoundarySubscription, GatewaySyncState, InstanceState,
    MessageSubscription, ProcessInstance, SignalSubscription, TimerRecord, Token, TokenState,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TokenStore: Send + Sync {
    // ── Tokens ──
    async fn save_token(&self, token: &Token) -> StoreResult<()>;
    async fn update_token(&self, token: &Token) -> StoreResult<()>;
    async fn load_token(&self, id: Uuid) -> StoreResult<Token>;
    async fn delete_token(&self, id: Uuid) -> StoreResult<()>;
    async fn load_tokens_by_instance(&self, instance_id: Uuid) -> StoreResult<Vec<Token>>;
    async fn load_tokens_by_state(&self, state: TokenState) -> StoreResult<Vec<Token>>;
    async fn load_active_tokens(&self) -> StoreResult<Vec<Token>>;

    // ── Process instances ──
    async fn save_instance(&self, instance: &ProcessInstance) -> StoreResult<()>;
    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<()>;
    async fn load_instance(&self, id: Uuid) -> StoreResult<ProcessInstance>;
    async fn update_instance_state(&self, id: Uuid, state: InstanceState) -> StoreResult<()>;

    // ── Message subscriptions ──
    async fn save_message_subscription(&self, sub: &MessageSubscription) -> StoreResult<()>;
    async fn delete_message_subscription(&self, id: Uuid) -> StoreResult<()>;
    async fn load_message_subscriptions(
        &self,
        message_name: &str,
        correlation_key: &str,
        process_start_only: bool,
    ) -> StoreResult<Vec<MessageSubscription>>;
    async fn load_all_message_subscriptions(&self) -> StoreResult<Vec<MessageSubscription>>;

    // ── Signal subscriptions ──
    async fn save_signal_subscription(&self, sub: &SignalSubscription) -> StoreResult<()>;
    async fn delete_signal_subscription(&self, id: Uuid) -> StoreResult<()>;
    async fn load_signal_subscriptions(&self, signal_name: &str)
        -> StoreResult<Vec<SignalSubscription>>;
    async fn load_all_signal_subscriptions(&self) -> StoreResult<Vec<SignalSubscription>>;

    // ── Error-boundary subscriptions ──
    async fn save_error_boundary(&self, sub: &ErrorBoundarySubscription) -> StoreResult<()>;
    async fn delete_error_boundaries_for_token(&self, token_id: Uuid) -> StoreResult<()>;
    async fn load_error_boundaries_for_token(
        &self,
        token_id: Uuid,
    ) -> StoreResult<Vec<ErrorBoundarySubscription>>;

    // ── Timers ──
    async fn save_timer(&self, timer: &TimerRecord) -> StoreResult<()>;
    async fn update_timer(&self, timer: &TimerRecord) -> StoreResult<()>;
    async fn load_timer(&self, id: Uuid) -> StoreResult<TimerRecord>;
    async fn load_timers_for_token(&self, token_id: Uuid) -> StoreResult<Vec<TimerRecord>>;
    async fn load_all_timers(&self) -> StoreResult<Vec<TimerRecord>>;

    // ── Gateway sync state (join bookkeeping) ──
    async fn load_gateway_sync(
        &self,
        gateway_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Option<GatewaySyncState>>;
    /// Atomically record that `flow_id` has arrived at `gateway_id` for
    /// `instance_id`, creating the sync record on first arrival. Returns the
    /// updated state. This is the single operation both the memory and
    /// Postgres backends must make atomic.
    async fn gateway_arrive(
        &self,
        gateway_id: &str,
        instance_id: Uuid,
        flow_id: &str,
        required_incoming_count: usize,
    ) -> StoreResult<GatewaySyncState>;
    async fn delete_gateway_sync(&self, gateway_id: &str, instance_id: Uuid) -> StoreResult<()>;

    // ── Buffered messages ──
    async fn buffer_message(&self, msg: &BufferedMessage) -> StoreResult<()>;
    /// Remove and return the oldest buffered match, if any.
    async fn take_buffered_message(
        &self,
        message_name: &str,
        correlation_key: &str,
    ) -> StoreResult<Option<BufferedMessage>>;

    // ── Event log ──
    async fn append_event(&self, instance_id: Uuid, event: &CoreEvent) -> StoreResult<u64>;
    async fn load_events(&self, instance_id: Uuid) -> StoreResult<Vec<(u64, CoreEvent)>>;

    // ── Incidents ──
    async fn save_incident(&self, incident: &crate::incident::Incident) -> StoreResult<()>;
    async fn load_incidents(&self, instance_id: Uuid) -> StoreResult<Vec<crate::incident::Incident>>;
    async fn resolve_incident(&self, incident_id: Uuid, resolution: &str) -> StoreResult<()>;
}

//! The mutable runtime records owned by the token store and the waiting
//! registries: tokens, instances, timers, jobs, and catch subscriptions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::ElementId;
use crate::timerspec::TimerSpec;
use crate::vars::Variables;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    Completed,
    Canceled,
    Incident,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_key: String,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub variables: Variables,
}

impl ProcessInstance {
    pub fn new(definition_key: impl Into<String>, variables: Variables, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_key: definition_key.into(),
            state: InstanceState::Active,
            started_at: now,
            ended_at: None,
            variables,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Waiting,
    Completed,
    Canceled,
    Failed,
}

/// A tagged key identifying what a token is waiting on: `timer:<id>`,
/// `job:<id>`, `message:<name>`, `signal:<name>`,
/// `error_boundary:<elementId>`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WaitingFor {
    Timer(Uuid),
    Job(Uuid),
    Message(String),
    Signal(String),
    ErrorBoundary(ElementId),
}

impl fmt::Display for WaitingFor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitingFor::Timer(id) => write!(f, "timer:{id}"),
            WaitingFor::Job(id) => write!(f, "job:{id}"),
            WaitingFor::Message(name) => write!(f, "message:{name}"),
            WaitingFor::Signal(name) => write!(f, "signal:{name}"),
            WaitingFor::ErrorBoundary(id) => write!(f, "error_boundary:{id}"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed waitingFor tag: {0}")]
pub struct WaitingForParseError(pub String);

impl FromStr for WaitingFor {
    type Err = WaitingForParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| WaitingForParseError(s.to_string()))?;
        match tag {
            "timer" => Uuid::parse_str(rest)
                .map(WaitingFor::Timer)
                .map_err(|_| WaitingForParseError(s.to_string())),
            "job" => Uuid::parse_str(rest)
                .map(WaitingFor::Job)
                .map_err(|_| WaitingForParseError(s.to_string())),
            "message" => Ok(WaitingFor::Message(rest.to_string())),
            "signal" => Ok(WaitingFor::Signal(rest.to_string())),
            "error_boundary" => Ok(WaitingFor::ErrorBoundary(rest.to_string())),
            _ => Err(WaitingForParseError(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub definition_key: String,
    pub current_element_id: ElementId,
    pub previous_element_id: Option<ElementId>,
    pub state: TokenState,
    pub waiting_for: Option<WaitingFor>,
    pub variables: Variables,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parent_token_id: Option<Uuid>,
    pub child_token_ids: Vec<Uuid>,
}

impl Token {
    pub fn new_root(
        instance_id: Uuid,
        definition_key: impl Into<String>,
        start_element_id: impl Into<String>,
        variables: Variables,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            definition_key: definition_key.into(),
            current_element_id: start_element_id.into(),
            previous_element_id: None,
            state: TokenState::Active,
            waiting_for: None,
            variables,
            created_at: now,
            updated_at: now,
            parent_token_id: None,
            child_token_ids: vec![],
        }
    }

    pub fn spawn_sibling(&self, target_element_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: self.instance_id,
            definition_key: self.definition_key.clone(),
            current_element_id: target_element_id.into(),
            previous_element_id: Some(self.current_element_id.clone()),
            state: TokenState::Active,
            waiting_for: None,
            variables: self.variables.clone(),
            created_at: now,
            updated_at: now,
            parent_token_id: Some(self.id),
            child_token_ids: vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TokenState::Completed | TokenState::Canceled)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerKind {
    Start,
    Boundary,
    Event,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimerState {
    Scheduled,
    Fired,
    Canceled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerRecord {
    pub id: Uuid,
    pub token_id: Option<Uuid>,
    pub element_id: ElementId,
    pub instance_id: Uuid,
    pub kind: TimerKind,
    pub state: TimerState,
    pub due_at: DateTime<Utc>,
    pub spec: TimerSpec,
    pub attached_to: Option<ElementId>,
    pub cancel_activity: Option<bool>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Created,
    Activated,
    Completed,
    Failed,
    ErrorThrown,
    Canceled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub instance_id: Uuid,
    pub element_id: ElementId,
    pub token_id: Uuid,
    pub retries: u32,
    pub state: JobState,
    pub variables: Variables,
    /// Opaque to the core; owned entirely by the external job subsystem.
    pub backoff_spec: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSubscription {
    pub id: Uuid,
    pub definition_key: String,
    pub start_event_id: Option<ElementId>,
    pub token_id: Option<Uuid>,
    pub message_name: String,
    pub correlation_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// The catching element, for catch subscriptions (`None` for
    /// process-start subscriptions, which already carry `start_event_id`).
    pub element_id: Option<ElementId>,
    /// `None` for a plain intermediate catch event (resume in place).
    /// `Some(true)`/`Some(false)` mark an interrupting/non-interrupting
    /// boundary-event subscription, mirroring [`SignalSubscription::cancel_activity`].
    pub cancel_activity: Option<bool>,
}

impl MessageSubscription {
    pub fn is_process_start(&self) -> bool {
        self.start_event_id.is_some() && self.token_id.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalSubscription {
    pub id: Uuid,
    pub signal_name: String,
    pub token_id: Uuid,
    pub element_id: ElementId,
    pub cancel_activity: bool,
    pub variables: Variables,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBoundarySubscription {
    pub token_id: Uuid,
    pub element_id: ElementId,
    /// Empty/`None` = catch-all.
    pub error_code: Option<String>,
    pub attached_to_ref: ElementId,
    pub cancel_activity: bool,
    pub outgoing_flows: Vec<ElementId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GatewaySyncState {
    pub gateway_id: ElementId,
    pub instance_id: Uuid,
    pub arrived_from_flows: Vec<ElementId>,
    pub required_incoming_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub message_name: String,
    pub correlation_key: String,
    pub sequence: u64,
    pub variables: Variables,
    pub buffered_at: DateTime<Utc>,
    pub ttl: std::time::Duration,
}

impl BufferedMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_default();
        now > self.buffered_at + ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_for_round_trips_through_display_and_parse() {
        let id = Uuid::now_v7();
        for wf in [
            WaitingFor::Timer(id),
            WaitingFor::Job(id),
            WaitingFor::Message("M".into()),
            WaitingFor::Signal("S".into()),
            WaitingFor::ErrorBoundary("boundary1".into()),
        ] {
            let s = wf.to_string();
            let parsed: WaitingFor = s.parse().unwrap();
            assert_eq!(parsed, wf);
        }
    }

    #[test]
    fn rejects_malformed_waiting_for() {
        assert!("garbage".parse::<WaitingFor>().is_err());
        assert!("timer:not-a-uuid".parse::<WaitingFor>().is_err());
    }

    #[test]
    fn process_start_subscription_requires_no_token() {
        let sub = MessageSubscription {
            id: Uuid::now_v7(),
            definition_key: "p".into(),
            start_event_id: Some("start".into()),
            token_id: None,
            message_name: "M".into(),
            correlation_key: "k".into(),
            active: true,
            created_at: Utc::now(),
            element_id: None,
            cancel_activity: None,
        };
        assert!(sub.is_process_start());
    }
}

//! Append-only audit trail. Mirrors `RuntimeEvent`-style event logs: every
//! observable state transition is recorded here *and* emitted through
//! `tracing`, so a store backend can replay history while an operator can
//! still `tail` structured logs live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::IncidentType;
use crate::graph::ElementId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoreEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition_key: String,
    },
    TokenCreated {
        token_id: Uuid,
        instance_id: Uuid,
        element_id: ElementId,
        parent_token_id: Option<Uuid>,
    },
    TokenTraversed {
        token_id: Uuid,
        from: ElementId,
        to: ElementId,
    },
    TokenWaiting {
        token_id: Uuid,
        waiting_for: String,
    },
    TokenResumed {
        token_id: Uuid,
    },
    TokenCompleted {
        token_id: Uuid,
    },
    TokenCanceled {
        token_id: Uuid,
        reason: String,
    },
    TokenFailed {
        token_id: Uuid,
        error: String,
    },
    GatewayTaken {
        gateway_id: ElementId,
        flow_id: ElementId,
    },
    GatewayJoinArrived {
        gateway_id: ElementId,
        instance_id: Uuid,
        arrived: usize,
        expected: usize,
    },
    GatewayJoinReleased {
        gateway_id: ElementId,
        instance_id: Uuid,
    },
    InstanceCompleted {
        instance_id: Uuid,
    },
    InstanceCanceled {
        instance_id: Uuid,
        reason: String,
    },
    InstanceIncident {
        instance_id: Uuid,
        incident_id: Uuid,
        incident_type: IncidentType,
    },
    MessageCorrelated {
        message_name: String,
        correlation_key: String,
        token_id: Option<Uuid>,
        started_instance_id: Option<Uuid>,
    },
    MessageBuffered {
        message_name: String,
        correlation_key: String,
    },
    MessageDiscarded {
        message_name: String,
        correlation_key: String,
    },
    SignalBroadcast {
        signal_name: String,
        delivered_to: usize,
    },
    ErrorRouted {
        token_id: Uuid,
        error_code: String,
        boundary_element_id: ElementId,
    },
    ErrorUnhandled {
        token_id: Uuid,
        error_code: String,
    },
    TimerScheduled {
        timer_id: Uuid,
        element_id: ElementId,
        due_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: Uuid,
    },
    TimerCanceled {
        timer_id: Uuid,
    },
    JobCreated {
        job_id: Uuid,
        element_id: ElementId,
    },
    JobCompleted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        retries_remaining: u32,
    },
    JobErrorThrown {
        job_id: Uuid,
        error_code: String,
    },
    BoundaryRegistered {
        token_id: Uuid,
        boundary_element_id: ElementId,
    },
    BoundaryFired {
        token_id: Uuid,
        boundary_element_id: ElementId,
        interrupting: bool,
    },
}

impl CoreEvent {
    /// Emit this event through `tracing` at a severity appropriate to its
    /// kind (failures/incidents at `warn`/`error`, everything else `info`).
    pub fn trace(&self) {
        match self {
            CoreEvent::TokenFailed { token_id, error } => {
                tracing::error!(token_id = %token_id, error = %error, "token failed");
            }
            CoreEvent::InstanceIncident {
                instance_id,
                incident_id,
                incident_type,
            } => {
                tracing::warn!(instance_id = %instance_id, incident_id = %incident_id, ?incident_type, "incident raised");
            }
            CoreEvent::ErrorUnhandled { token_id, error_code } => {
                tracing::warn!(token_id = %token_id, error_code = %error_code, "unhandled bpmn error");
            }
            other => {
                tracing::debug!(event = ?other, "core event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_does_not_panic_for_every_variant() {
        let events = vec![
            CoreEvent::InstanceStarted {
                instance_id: Uuid::now_v7(),
                definition_key: "p".into(),
            },
            CoreEvent::TokenFailed {
                token_id: Uuid::now_v7(),
                error: "boom".into(),
            },
        ];
        for e in events {
            e.trace();
        }
    }
}

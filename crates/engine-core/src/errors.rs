//! Error taxonomy: infrastructure failures bubble straight to callers,
//! process-modelling and expression failures move a token to an incident
//! instead of unwinding.

use thiserror::Error;

use crate::graph::GraphError;
use crate::vars::VariableError;

/// Class 1 — infrastructure failures bubbled to the caller; never change
/// token state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: stale update")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Classes 2 & 3 — process-modelling and expression-evaluation failures
/// that move a token to FAILED and raise an incident.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] StoreError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("expression evaluation failed: {0}")]
    ExpressionEval(String),
    #[error("required variable missing: {0}")]
    MissingVariable(#[from] VariableError),
    #[error("malformed event definition on element {0}")]
    MalformedEventDefinition(String),
    #[error("executor panicked: {0}")]
    ExecutorPanic(String),
}

impl CoreError {
    /// The incident type this error class maps to.
    pub fn incident_type(&self) -> IncidentType {
        match self {
            CoreError::Infrastructure(_) => IncidentType::System,
            CoreError::Graph(_) => IncidentType::System,
            CoreError::ExpressionEval(_) => IncidentType::Expression,
            CoreError::MissingVariable(_) => IncidentType::Expression,
            CoreError::MalformedEventDefinition(_) => IncidentType::System,
            CoreError::ExecutorPanic(_) => IncidentType::System,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum IncidentType {
    JobFailure,
    UnhandledBpmnError,
    Expression,
    Timer,
    Message,
    System,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct IncidentRequest {
    pub incident_type: IncidentType,
    pub message: String,
    pub instance_id: uuid::Uuid,
    pub element_id: String,
    pub element_type: String,
    pub job_id: Option<uuid::Uuid>,
    pub error_code: Option<String>,
    pub original_retries: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_errors_map_to_expression_incident() {
        let e = CoreError::ExpressionEval("bad cond".into());
        assert_eq!(e.incident_type(), IncidentType::Expression);
    }

    #[test]
    fn infra_errors_map_to_system_incident() {
        let e = CoreError::Infrastructure(StoreError::Unavailable("down".into()));
        assert_eq!(e.incident_type(), IncidentType::System);
    }
}

//! Operator-visible incidents, raised by the error taxonomy and surfaced
//! through an incident sink port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::IncidentType;
use crate::graph::ElementId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub incident_type: IncidentType,
    pub message: String,
    pub instance_id: Uuid,
    pub element_id: ElementId,
    pub element_type: String,
    pub job_id: Option<Uuid>,
    pub error_code: Option<String>,
    pub original_retries: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

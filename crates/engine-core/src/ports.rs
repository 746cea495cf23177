//! Outbound ports the dispatcher calls into: one `async_trait` per external
//! subsystem (timers, jobs, messaging, signals, incidents), the same split
//! an `AgentAdapter`-style abstraction layer draws between concerns instead
//! of routing everything through one store trait. `Null*` no-op
//! implementations and `recording::Recording*` test doubles back every
//! trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::timerspec::TimerSpec;
use crate::vars::Variables;

#[async_trait]
pub trait TimerPort: Send + Sync {
    async fn create_timer(&self, spec: &TimerSpec) -> anyhow::Result<Uuid>;
    async fn cancel_timer(&self, timer_id: Uuid) -> anyhow::Result<()>;
}

pub struct JobRequest {
    pub job_type: String,
    pub instance_id: Uuid,
    pub element_id: String,
    pub token_id: Uuid,
    pub retries: u32,
    pub variables: Variables,
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub timeout_ms: Option<u64>,
}

#[async_trait]
pub trait JobPort: Send + Sync {
    async fn create_job(&self, request: JobRequest) -> anyhow::Result<Uuid>;
    async fn cancel_job(&self, job_id: Uuid) -> anyhow::Result<()>;
}

pub struct MessageCorrelationOutcome {
    pub instance_created: bool,
    pub correlated_token_ids: Vec<Uuid>,
}

#[async_trait]
pub trait MessageBrokerPort: Send + Sync {
    async fn publish_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: &Variables,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SignalBrokerPort: Send + Sync {
    async fn broadcast_signal(&self, name: &str, variables: &Variables) -> anyhow::Result<()>;
}

#[async_trait]
pub trait IncidentSinkPort: Send + Sync {
    async fn raise(&self, incident: &crate::incident::Incident) -> anyhow::Result<()>;
}

/// A bundle of all outbound ports, wired once into the dispatcher.
pub struct Ports {
    pub timers: Box<dyn TimerPort>,
    pub jobs: Box<dyn JobPort>,
    pub messages: Box<dyn MessageBrokerPort>,
    pub signals: Box<dyn SignalBrokerPort>,
    pub incidents: Box<dyn IncidentSinkPort>,
}

/// Ports that do nothing, for unit tests that never exercise an external
/// subsystem.
pub struct NullTimerPort;
#[async_trait]
impl TimerPort for NullTimerPort {
    async fn create_timer(&self, _spec: &TimerSpec) -> anyhow::Result<Uuid> {
        Ok(Uuid::now_v7())
    }
    async fn cancel_timer(&self, _timer_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NullJobPort;
#[async_trait]
impl JobPort for NullJobPort {
    async fn create_job(&self, _request: JobRequest) -> anyhow::Result<Uuid> {
        Ok(Uuid::now_v7())
    }
    async fn cancel_job(&self, _job_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NullMessageBrokerPort;
#[async_trait]
impl MessageBrokerPort for NullMessageBrokerPort {
    async fn publish_message(&self, _name: &str, _key: &str, _vars: &Variables) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NullSignalBrokerPort;
#[async_trait]
impl SignalBrokerPort for NullSignalBrokerPort {
    async fn broadcast_signal(&self, _name: &str, _vars: &Variables) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NullIncidentSinkPort;
#[async_trait]
impl IncidentSinkPort for NullIncidentSinkPort {
    async fn raise(&self, _incident: &crate::incident::Incident) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Ports {
    /// All ports are no-ops; useful for exercising the graph-traversal logic
    /// in isolation from any external subsystem.
    pub fn null() -> Self {
        Self {
            timers: Box::new(NullTimerPort),
            jobs: Box::new(NullJobPort),
            messages: Box::new(NullMessageBrokerPort),
            signals: Box::new(NullSignalBrokerPort),
            incidents: Box::new(NullIncidentSinkPort),
        }
    }
}

/// Records every call made through it, for assertions in integration tests
/// that need to see what the dispatcher asked external subsystems to do.
pub mod recording {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTimerPort {
        pub created: Mutex<Vec<TimerSpec>>,
        pub canceled: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl TimerPort for RecordingTimerPort {
        async fn create_timer(&self, spec: &TimerSpec) -> anyhow::Result<Uuid> {
            self.created.lock().await.push(spec.clone());
            Ok(Uuid::now_v7())
        }
        async fn cancel_timer(&self, timer_id: Uuid) -> anyhow::Result<()> {
            self.canceled.lock().await.push(timer_id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingJobPort {
        pub created: Mutex<Vec<(String, Uuid)>>,
        pub canceled: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl JobPort for RecordingJobPort {
        async fn create_job(&self, request: JobRequest) -> anyhow::Result<Uuid> {
            let id = Uuid::now_v7();
            self.created.lock().await.push((request.job_type, id));
            Ok(id)
        }
        async fn cancel_job(&self, job_id: Uuid) -> anyhow::Result<()> {
            self.canceled.lock().await.push(job_id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingMessageBrokerPort {
        pub published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageBrokerPort for RecordingMessageBrokerPort {
        async fn publish_message(
            &self,
            name: &str,
            correlation_key: &str,
            _vars: &Variables,
        ) -> anyhow::Result<()> {
            self.published.lock().await.push((name.to_string(), correlation_key.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingSignalBrokerPort {
        pub broadcast: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalBrokerPort for RecordingSignalBrokerPort {
        async fn broadcast_signal(&self, name: &str, _vars: &Variables) -> anyhow::Result<()> {
            self.broadcast.lock().await.push(name.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingIncidentSinkPort {
        pub raised: Mutex<Vec<crate::errors::IncidentType>>,
    }

    #[async_trait]
    impl IncidentSinkPort for RecordingIncidentSinkPort {
        async fn raise(&self, incident: &crate::incident::Incident) -> anyhow::Result<()> {
            self.raised.lock().await.push(incident.incident_type);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_ports_never_error() {
        let ports = Ports::null();
        let spec = TimerSpec::parse("PT5S").unwrap();
        let id = ports.timers.create_timer(&spec).await.unwrap();
        ports.timers.cancel_timer(id).await.unwrap();
        ports
            .messages
            .publish_message("M", "k", &Variables::new())
            .await
            .unwrap();
        ports.signals.broadcast_signal("S", &Variables::new()).await.unwrap();
    }

    #[tokio::test]
    async fn recording_job_port_tracks_creates() {
        let port = recording::RecordingJobPort::default();
        let req = JobRequest {
            job_type: "send-email".into(),
            instance_id: Uuid::now_v7(),
            element_id: "task1".into(),
            token_id: Uuid::now_v7(),
            retries: 3,
            variables: Variables::new(),
            headers: serde_json::Map::new(),
            timeout_ms: None,
        };
        port.create_job(req).await.unwrap();
        assert_eq!(port.created.lock().await.len(), 1);
    }
}

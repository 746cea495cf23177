//! Execution core for a business-process engine: token scheduling,
//! element-executor dispatch, waiting-state registries, and the
//! correlation paths that wake sleeping tokens.

pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod executors;
pub mod expr;
pub mod graph;
pub mod incident;
pub mod model;
pub mod ports;
pub mod processor;
pub mod registries;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod timerspec;
pub mod vars;

pub use dispatcher::Engine;
pub use errors::{CoreError, IncidentType};
pub use graph::{Element, ElementKind, ProcessDefinition, ProcessDefinitionBuilder};
pub use model::{ProcessInstance, Token};
pub use ports::Ports;
pub use vars::Variables;

//! The immutable, in-memory process definition graph.
//!
//! Mirrors the `IRGraph = DiGraph<IRNode, IREdge>` shape used elsewhere in
//! this codebase, but kept as the actual runtime model (not an intermediate
//! form lowered to bytecode): executors read `Element`s directly. No
//! mutation after load — `ProcessDefinition` is built once by a parser
//! (out of scope here) and handed to the engine by `Arc` reference.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Map as JsonMap;
use serde_json::Value as Json;
use thiserror::Error;

use crate::timerspec::TimerSpec;

pub type ElementId = String;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventDefinitionType {
    Timer,
    Message,
    Signal,
    Error,
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventDefinition {
    pub kind: EventDefinitionType,
    /// Timer ISO-8601 spec string (duration/date/cycle), for `Timer`.
    pub timer: Option<TimerSpec>,
    /// Message name, for `Message`.
    pub message_name: Option<String>,
    /// Variable name whose value resolves the correlation key, for `Message`.
    pub correlation_key_expr: Option<String>,
    /// Signal name, for `Signal`.
    pub signal_name: Option<String>,
    /// Error code to match (empty/None = catch-all), for `Error`.
    pub error_code: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GatewayDirection {
    Diverging,
    Converging,
}

/// Tagged per-kind element payload. This is the DESIGN-NOTES resolution of
/// the "dynamic property bags" anti-pattern: kind-specific fields live on
/// the variant instead of a shared stringly-typed map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ElementKind {
    StartEvent {
        event_definitions: Vec<EventDefinition>,
    },
    EndEvent {
        terminate: bool,
    },
    IntermediateCatchEvent {
        event_definitions: Vec<EventDefinition>,
    },
    IntermediateThrowEvent {
        event_definitions: Vec<EventDefinition>,
    },
    BoundaryEvent {
        attached_to: ElementId,
        event_definitions: Vec<EventDefinition>,
        cancel_activity: bool,
    },
    ServiceTask {
        task_type: String,
    },
    SendTask {
        task_type: String,
        message_name: String,
        correlation_key_expr: Option<String>,
    },
    ReceiveTask {
        message_name: String,
        correlation_key_expr: Option<String>,
    },
    UserTask {
        form_key: Option<String>,
    },
    ScriptTask {
        script: String,
    },
    SubProcess {
        start_element: ElementId,
    },
    CallActivity {
        called_process_key: String,
    },
    ExclusiveGateway,
    ParallelGateway {
        direction: GatewayDirection,
    },
    InclusiveGateway {
        direction: GatewayDirection,
    },
    EventBasedGateway,
    SequenceFlow {
        source: ElementId,
        target: ElementId,
        condition: Option<String>,
        is_default: bool,
    },
    Message {
        name: String,
    },
}

impl ElementKind {
    pub fn boundary_event_definitions(&self) -> Option<&[EventDefinition]> {
        match self {
            ElementKind::BoundaryEvent {
                event_definitions, ..
            } => Some(event_definitions),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub name: Option<String>,
    pub kind: ElementKind,
    /// Vendor/custom attributes the core never interprets.
    pub extensions: JsonMap<String, Json>,
}

impl Element {
    pub fn is_boundary_event(&self) -> bool {
        matches!(self.kind, ElementKind::BoundaryEvent { .. })
    }

    pub fn attached_to(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::BoundaryEvent { attached_to, .. } => Some(attached_to.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlowMeta {
    pub flow_id: ElementId,
    pub condition: Option<String>,
    pub is_default: bool,
    /// Position among `add_flow` calls at build time. Exclusive-gateway
    /// condition evaluation must walk flows in this order, not in
    /// `flow_id` order — the two only coincide by accident.
    pub declaration_index: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown element id: {0}")]
    UnknownElement(String),
    #[error("unknown sequence flow id: {0}")]
    UnknownFlow(String),
    #[error("element {0} has no outgoing flows")]
    NoOutgoing(String),
}

/// Immutable process definition: elements-by-id plus the flow graph.
pub struct ProcessDefinition {
    pub key: String,
    pub version: u32,
    pub start_event_ids: Vec<ElementId>,
    /// messageName -> start-event element id, for process-start subscriptions
    /// built at load time.
    pub message_definitions_by_id: HashMap<String, ElementId>,
    graph: DiGraph<Element, SequenceFlowMeta>,
    index_by_id: HashMap<ElementId, NodeIndex>,
    /// flow id -> (source, target) resolved eagerly for O(1) traversal.
    flow_endpoints: HashMap<ElementId, (ElementId, ElementId)>,
}

pub struct ProcessDefinitionBuilder {
    graph: DiGraph<Element, SequenceFlowMeta>,
    index_by_id: HashMap<ElementId, NodeIndex>,
    flows: Vec<(ElementId, ElementId, SequenceFlowMeta)>,
    key: String,
    version: u32,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: impl Into<String>, version: u32) -> Self {
        Self {
            graph: DiGraph::new(),
            index_by_id: HashMap::new(),
            flows: Vec::new(),
            key: key.into(),
            version,
        }
    }

    pub fn add_element(&mut self, element: Element) -> &mut Self {
        let id = element.id.clone();
        let idx = self.graph.add_node(element);
        self.index_by_id.insert(id, idx);
        self
    }

    /// Register a sequence flow; `source`/`target` must already have been
    /// added via `add_element`.
    pub fn add_flow(
        &mut self,
        flow_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: Option<String>,
        is_default: bool,
    ) -> &mut Self {
        let declaration_index = self.flows.len();
        self.flows.push((
            source.into(),
            target.into(),
            SequenceFlowMeta {
                flow_id: flow_id.into(),
                condition,
                is_default,
                declaration_index,
            },
        ));
        self
    }

    pub fn build(mut self) -> Result<ProcessDefinition, GraphError> {
        let mut flow_endpoints = HashMap::new();
        for (src, tgt, meta) in self.flows.drain(..) {
            let src_idx = *self
                .index_by_id
                .get(&src)
                .ok_or_else(|| GraphError::UnknownElement(src.clone()))?;
            let tgt_idx = *self
                .index_by_id
                .get(&tgt)
                .ok_or_else(|| GraphError::UnknownElement(tgt.clone()))?;
            flow_endpoints.insert(meta.flow_id.clone(), (src.clone(), tgt.clone()));
            self.graph.add_edge(src_idx, tgt_idx, meta);
        }

        let start_event_ids: Vec<ElementId> = self
            .graph
            .node_indices()
            .filter(|&idx| matches!(self.graph[idx].kind, ElementKind::StartEvent { .. }))
            .map(|idx| self.graph[idx].id.clone())
            .collect();

        let mut message_definitions_by_id = HashMap::new();
        for &idx in &self.graph.node_indices().collect::<Vec<_>>() {
            if let ElementKind::StartEvent { event_definitions } = &self.graph[idx].kind {
                for ed in event_definitions {
                    if ed.kind == EventDefinitionType::Message {
                        if let Some(name) = &ed.message_name {
                            message_definitions_by_id
                                .insert(name.clone(), self.graph[idx].id.clone());
                        }
                    }
                }
            }
        }

        Ok(ProcessDefinition {
            key: self.key,
            version: self.version,
            start_event_ids,
            message_definitions_by_id,
            graph: self.graph,
            index_by_id: self.index_by_id,
            flow_endpoints,
        })
    }
}

impl ProcessDefinition {
    pub fn lookup(&self, id: &str) -> Result<&Element, GraphError> {
        let idx = self
            .index_by_id
            .get(id)
            .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;
        Ok(&self.graph[*idx])
    }

    /// Outgoing sequence-flow ids of `id`, in declaration order.
    pub fn outgoing(&self, id: &str) -> Result<Vec<&SequenceFlowMeta>, GraphError> {
        let idx = self
            .index_by_id
            .get(id)
            .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(*idx, Direction::Outgoing)
            .map(|e| e.weight())
            .collect();
        edges.sort_by_key(|e| e.declaration_index);
        Ok(edges)
    }

    pub fn incoming_count(&self, id: &str) -> Result<usize, GraphError> {
        let idx = self
            .index_by_id
            .get(id)
            .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;
        Ok(self.graph.edges_directed(*idx, Direction::Incoming).count())
    }

    pub fn boundary_events_attached_to(&self, id: &str) -> Vec<&Element> {
        self.graph
            .node_weights()
            .filter(|e| e.attached_to() == Some(id))
            .collect()
    }

    pub fn resolve_target_of_flow(&self, flow_id: &str) -> Result<&Element, GraphError> {
        let (_, target) = self
            .flow_endpoints
            .get(flow_id)
            .ok_or_else(|| GraphError::UnknownFlow(flow_id.to_string()))?;
        self.lookup(target)
    }

    pub fn source_of_flow(&self, flow_id: &str) -> Result<&str, GraphError> {
        self.flow_endpoints
            .get(flow_id)
            .map(|(s, _)| s.as_str())
            .ok_or_else(|| GraphError::UnknownFlow(flow_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(id: &str, kind: ElementKind) -> Element {
        Element {
            id: id.to_string(),
            name: None,
            kind,
            extensions: JsonMap::new(),
        }
    }

    #[test]
    fn linear_flow_outgoing_and_target_resolve() {
        let mut b = ProcessDefinitionBuilder::new("p", 1);
        b.add_element(bare(
            "start",
            ElementKind::StartEvent {
                event_definitions: vec![],
            },
        ));
        b.add_element(bare(
            "t",
            ElementKind::ServiceTask {
                task_type: "x".into(),
            },
        ));
        b.add_element(bare("end", ElementKind::EndEvent { terminate: false }));
        b.add_flow("f1", "start", "t", None, false);
        b.add_flow("f2", "t", "end", None, false);
        let def = b.build().unwrap();

        assert_eq!(def.start_event_ids, vec!["start".to_string()]);
        let out = def.outgoing("start").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flow_id, "f1");
        let target = def.resolve_target_of_flow("f1").unwrap();
        assert_eq!(target.id, "t");
    }

    #[test]
    fn boundary_events_are_found_by_attachment() {
        let mut b = ProcessDefinitionBuilder::new("p", 1);
        b.add_element(bare(
            "t",
            ElementKind::ServiceTask {
                task_type: "x".into(),
            },
        ));
        b.add_element(bare(
            "boundary",
            ElementKind::BoundaryEvent {
                attached_to: "t".into(),
                event_definitions: vec![],
                cancel_activity: true,
            },
        ));
        let def = b.build().unwrap();
        let attached = def.boundary_events_attached_to("t");
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, "boundary");
    }

    #[test]
    fn unknown_element_lookup_errors() {
        let def = ProcessDefinitionBuilder::new("p", 1).build().unwrap();
        assert!(matches!(
            def.lookup("nope"),
            Err(GraphError::UnknownElement(ref id)) if id == "nope"
        ));
    }
}

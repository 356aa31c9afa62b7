//! Workflow plan coercion
//!
//! Tool outputs carrying a node/edge graph come in several shapes. Each shape is
//! a separate extraction strategy tried in a fixed order, and each candidate is
//! validated on its own before it is accepted. A plan is either fully valid or
//! not produced at all.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_WORKFLOW_ID: &str = "generated";
pub const DEFAULT_DURATION_SEC: f64 = 60.0;

/// Keys checked, in order, for the nested shape.
const NESTED_KEYS: [&str; 2] = ["plan", "workflow"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    /// Nodes exactly as received.
    pub nodes: Vec<Value>,
    /// Edges exactly as received.
    pub edges: Vec<Value>,
    pub workflow_id: String,
    pub narrative_dna: Option<Value>,
    pub agent_assignments: Map<String, Value>,
    pub estimated_duration_sec: f64,
    pub capsule_id: Option<String>,
    pub logic_vector: Option<Value>,
    pub persona_vector: Option<Value>,
}

impl WorkflowPlan {
    /// Typed view of every structurally valid node.
    pub fn typed_nodes(&self) -> Vec<Node> {
        self.nodes.iter().filter_map(Node::from_value).collect()
    }

    /// Typed view of every edge with string endpoints.
    pub fn typed_edges(&self) -> Vec<Edge> {
        self.edges.iter().filter_map(Edge::from_value).collect()
    }

    fn from_container(nodes: Vec<Value>, edges: Vec<Value>, container: &Map<String, Value>) -> Self {
        Self {
            nodes,
            edges,
            workflow_id: container
                .get("workflow_id")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_WORKFLOW_ID)
                .to_string(),
            narrative_dna: non_null(container.get("narrative_dna")),
            agent_assignments: container
                .get("agent_assignments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            estimated_duration_sec: container
                .get("estimated_duration_sec")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_DURATION_SEC),
            capsule_id: container
                .get("capsule_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            logic_vector: non_null(container.get("logic_vector")),
            persona_vector: non_null(container.get("persona_vector")),
        }
    }

    fn with_defaults(nodes: Vec<Value>) -> Self {
        Self::from_container(nodes, Vec::new(), &Map::new())
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub node_type: String,
    pub position: Position,
    pub data: Option<Value>,
}

impl Node {
    /// Structural check: string `id`, string `type`, numeric `position.x`/`position.y`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = obj.get("id")?.as_str()?;
        let node_type = obj.get("type")?.as_str()?;
        let position = obj.get("position")?.as_object()?;
        let x = position.get("x")?.as_f64()?;
        let y = position.get("y")?.as_f64()?;

        Some(Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            position: Position { x, y },
            data: non_null(obj.get("data")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: Option<String>,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            id: obj.get("id").and_then(Value::as_str).map(str::to_string),
            source: obj.get("source")?.as_str()?.to_string(),
            target: obj.get("target")?.as_str()?.to_string(),
        })
    }
}

/// Extraction strategies, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Flat,
    Nested,
    NodesOnly,
}

const STRATEGIES: [Strategy; 3] = [Strategy::Flat, Strategy::Nested, Strategy::NodesOnly];

impl Strategy {
    fn extract(self, output: &Map<String, Value>) -> Option<WorkflowPlan> {
        match self {
            Strategy::Flat => {
                let (nodes, edges) = graph_arrays(output)?;
                accept(self, nodes)?;
                Some(WorkflowPlan::from_container(
                    nodes.clone(),
                    edges.clone(),
                    output,
                ))
            }
            Strategy::Nested => NESTED_KEYS.iter().find_map(|key| {
                let container = output.get(*key)?.as_object()?;
                let (nodes, edges) = graph_arrays(container)?;
                accept(self, nodes)?;
                Some(WorkflowPlan::from_container(
                    nodes.clone(),
                    edges.clone(),
                    container,
                ))
            }),
            Strategy::NodesOnly => {
                let nodes = output.get("nodes")?.as_array()?;
                accept(self, nodes)?;
                Some(WorkflowPlan::with_defaults(nodes.clone()))
            }
        }
    }
}

fn graph_arrays(container: &Map<String, Value>) -> Option<(&Vec<Value>, &Vec<Value>)> {
    let nodes = container.get("nodes")?.as_array()?;
    let edges = container.get("edges")?.as_array()?;
    Some((nodes, edges))
}

/// Validate the first node of a candidate.
fn accept(strategy: Strategy, nodes: &[Value]) -> Option<()> {
    match nodes.first() {
        Some(first) if Node::from_value(first).is_some() => Some(()),
        Some(_) => {
            tracing::warn!(?strategy, "Rejecting workflow plan: first node fails shape check");
            None
        }
        None => {
            tracing::warn!(?strategy, "Rejecting workflow plan: no nodes");
            None
        }
    }
}

/// Extract a workflow plan from a tool's free-form output.
///
/// `None` means "no plan produced"; callers leave their canvas untouched.
pub fn coerce_plan(output: &Value) -> Option<WorkflowPlan> {
    let obj = output.as_object()?;
    STRATEGIES.iter().find_map(|strategy| strategy.extract(obj))
}

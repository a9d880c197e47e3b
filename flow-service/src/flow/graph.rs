// Flow Graph (DAG) Builder
// Builds the port-induced dependency graph of a flow and enforces its structural rules

use crate::flow::models::{Flow, DESTINATION_PORT, MAX_FLOW_PRIORITY, SOURCE_PORT};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Error type for flow validation
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Declared priority outside 0-4
    InvalidPriority,
    /// Not exactly one model produces "dst"
    DestinationCount,
    /// Some model consumes "dst"
    DestinationConsumed,
    /// Some model produces "src"
    SourceProduced,
    /// Circular dependency between models
    CyclicDependency,
    /// A consumed port has no producer, or a produced port has no consumer
    UnbalancedPorts,
}

impl GraphErrorKind {
    /// Number of the structural rule this kind enforces, if any
    pub fn rule(self) -> Option<u8> {
        match self {
            GraphErrorKind::InvalidPriority => None,
            GraphErrorKind::DestinationCount => Some(1),
            GraphErrorKind::DestinationConsumed => Some(2),
            GraphErrorKind::SourceProduced => Some(3),
            GraphErrorKind::CyclicDependency => Some(4),
            GraphErrorKind::UnbalancedPorts => Some(5),
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.rule() {
            Some(rule) => write!(f, "invalid flow (rule {}): {}", rule, self.message),
            None => write!(f, "invalid flow: {}", self.message),
        }
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn new(kind: GraphErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn rule(&self) -> Option<u8> {
        self.kind.rule()
    }
}

/// A data dependency: `producer` writes `port`, `consumer` reads it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortEdge {
    pub producer: usize,
    pub consumer: usize,
    pub port: String,
}

/// Typed dependency graph over model indices
#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: DiGraph<usize, String>,
    /// Node handle per model index
    nodes: Vec<NodeIndex>,
    edges: Vec<PortEdge>,
}

impl FlowGraph {
    /// Build the graph: one edge per (output port, input port) name match.
    ///
    /// A model reading a port it also writes gets a self-edge, which the
    /// validator rejects as a cycle: such a model could never become ready.
    pub fn build(flow: &Flow) -> Self {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..flow.models.len()).map(|i| graph.add_node(i)).collect();

        // Index consumers by port so edge construction is linear in the port count
        let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, model) in flow.models.iter().enumerate() {
            for port in model.input_port_names() {
                consumers.entry(port).or_default().push(index);
            }
        }

        let mut edges = Vec::new();
        for (producer, model) in flow.models.iter().enumerate() {
            for port in model.output_port_names() {
                for &consumer in consumers.get(port).into_iter().flatten() {
                    graph.add_edge(nodes[producer], nodes[consumer], port.to_string());
                    edges.push(PortEdge {
                        producer,
                        consumer,
                        port: port.to_string(),
                    });
                }
            }
        }
        edges.sort();

        Self {
            graph,
            nodes,
            edges,
        }
    }

    /// All edges, ordered by (producer, consumer, port)
    pub fn edges(&self) -> &[PortEdge] {
        &self.edges
    }

    /// Models whose outputs `index` consumes
    pub fn upstream(&self, index: usize) -> BTreeSet<usize> {
        self.neighbors(index, Direction::Incoming)
    }

    /// Models consuming outputs of `index`
    pub fn downstream(&self, index: usize) -> BTreeSet<usize> {
        self.neighbors(index, Direction::Outgoing)
    }

    fn neighbors(&self, index: usize, direction: Direction) -> BTreeSet<usize> {
        let Some(&node) = self.nodes.get(index) else {
            return BTreeSet::new();
        };
        self.graph
            .edges_directed(node, direction)
            .map(|edge| match direction {
                Direction::Incoming => self.graph[edge.source()],
                Direction::Outgoing => self.graph[edge.target()],
            })
            .collect()
    }

    /// Model indices in dependency order, or the index of a model on a cycle
    pub fn topological_order(&self) -> Result<Vec<usize>, usize> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|cycle| self.graph[cycle.node_id()])
    }

    /// Group models into levels that can run in parallel
    pub fn parallel_levels(&self) -> Vec<Vec<usize>> {
        let Ok(order) = self.topological_order() else {
            return Vec::new();
        };

        let mut levels: Vec<Vec<usize>> = Vec::new();
        let mut assigned: HashMap<usize, usize> = HashMap::new();

        for index in order {
            let level = self
                .upstream(index)
                .iter()
                .filter_map(|dep| assigned.get(dep))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);

            assigned.insert(index, level);

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(index);
        }

        for level in &mut levels {
            level.sort_unstable();
        }
        levels
    }
}

/// A flow that passed every structural rule. Immutable.
#[derive(Debug, Clone)]
pub struct ValidatedFlow {
    flow: Flow,
    graph: FlowGraph,
}

impl ValidatedFlow {
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn into_flow(self) -> Flow {
        self.flow
    }
}

/// Structural validation of flow definitions
pub struct FlowValidator;

impl FlowValidator {
    /// Validate a flow, returning the first rule it breaks
    pub fn validate(flow: Flow) -> Result<ValidatedFlow, GraphError> {
        if flow.priority > MAX_FLOW_PRIORITY {
            return Err(GraphError::new(
                GraphErrorKind::InvalidPriority,
                format!(
                    "priority {} is outside 0-{}",
                    flow.priority, MAX_FLOW_PRIORITY
                ),
            ));
        }

        Self::check_ports(&flow)?;

        let graph = FlowGraph::build(&flow);
        if let Err(index) = graph.topological_order() {
            let name = flow
                .model(index)
                .map(|m| m.name.as_str())
                .unwrap_or("unknown");
            return Err(GraphError::new(
                GraphErrorKind::CyclicDependency,
                format!(
                    "circular dependency detected through model '{}' (index {})",
                    name, index
                ),
            ));
        }

        Self::check_balance(&flow)?;

        Ok(ValidatedFlow { flow, graph })
    }

    /// Rules 1-3: membership checks on the reserved ports
    fn check_ports(flow: &Flow) -> Result<(), GraphError> {
        let producers: Vec<&str> = flow
            .models
            .iter()
            .filter(|m| m.produces(DESTINATION_PORT))
            .map(|m| m.name.as_str())
            .collect();
        if producers.len() != 1 {
            return Err(GraphError::new(
                GraphErrorKind::DestinationCount,
                format!(
                    "exactly one model must output '{}', found {} ({})",
                    DESTINATION_PORT,
                    producers.len(),
                    producers.join(", ")
                ),
            ));
        }

        if let Some(model) = flow.models.iter().find(|m| m.consumes(DESTINATION_PORT)) {
            return Err(GraphError::new(
                GraphErrorKind::DestinationConsumed,
                format!("model '{}' declares '{}' as an input", model.name, DESTINATION_PORT),
            ));
        }

        if let Some(model) = flow.models.iter().find(|m| m.produces(SOURCE_PORT)) {
            return Err(GraphError::new(
                GraphErrorKind::SourceProduced,
                format!("model '{}' declares '{}' as an output", model.name, SOURCE_PORT),
            ));
        }

        Ok(())
    }

    /// Rule 5: inputs and outputs differ exactly by {src, dst}
    fn check_balance(flow: &Flow) -> Result<(), GraphError> {
        let inputs = flow.input_port_names();
        let outputs = flow.output_port_names();
        let difference: BTreeSet<&str> = inputs.symmetric_difference(&outputs).copied().collect();
        let expected: BTreeSet<&str> = [SOURCE_PORT, DESTINATION_PORT].into_iter().collect();

        if difference == expected {
            return Ok(());
        }

        let unproduced: Vec<&str> = inputs
            .difference(&outputs)
            .copied()
            .filter(|p| *p != SOURCE_PORT)
            .collect();
        let unconsumed: Vec<&str> = outputs
            .difference(&inputs)
            .copied()
            .filter(|p| *p != DESTINATION_PORT)
            .collect();

        let mut problems = Vec::new();
        if !unproduced.is_empty() {
            problems.push(format!("no producer for {}", unproduced.join(", ")));
        }
        if !unconsumed.is_empty() {
            problems.push(format!("no consumer for {}", unconsumed.join(", ")));
        }
        if !inputs.contains(SOURCE_PORT) {
            problems.push(format!("no model reads '{}'", SOURCE_PORT));
        }

        Err(GraphError::new(
            GraphErrorKind::UnbalancedPorts,
            format!("unbalanced ports: {}", problems.join("; ")),
        ))
    }
}

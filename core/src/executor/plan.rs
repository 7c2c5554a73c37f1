use std::collections::HashMap;
use std::fmt;

const OUTPUT_PREFIX: &str = "OUTPUT:";

/// A node in the execution graph: run the task, or only fetch its output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Run(String),
    OutputOnly(String),
}

impl NodeId {
    pub fn task_id(&self) -> &str {
        match self {
            NodeId::Run(id) | NodeId::OutputOnly(id) => id,
        }
    }

    pub fn is_output_only(&self) -> bool {
        matches!(self, NodeId::OutputOnly(_))
    }

    /// Inverse of `Display`: `OUTPUT:<id>` or a bare task id.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix(OUTPUT_PREFIX) {
            Some(id) => NodeId::OutputOnly(id.to_string()),
            None => NodeId::Run(s.to_string()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Run(id) => f.write_str(id),
            NodeId::OutputOnly(id) => write!(f, "{OUTPUT_PREFIX}{id}"),
        }
    }
}

/// Batches of nodes in dependency order, plus each node's direct predecessors.
///
/// Every predecessor of a node sits in a strictly earlier batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    batches: Vec<Vec<NodeId>>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
}

impl ExecutionPlan {
    pub fn new(batches: Vec<Vec<NodeId>>, predecessors: HashMap<NodeId, Vec<NodeId>>) -> Self {
        Self {
            batches,
            predecessors,
        }
    }

    /// Isolated execution of one task, dependencies assumed satisfied.
    pub fn single(task_id: impl Into<String>) -> Self {
        Self {
            batches: vec![vec![NodeId::Run(task_id.into())]],
            predecessors: HashMap::new(),
        }
    }

    pub fn batches(&self) -> &[Vec<NodeId>] {
        &self.batches
    }

    /// All nodes, batch by batch.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.batches.iter().flatten()
    }

    pub fn predecessors(&self, node: &NodeId) -> &[NodeId] {
        self.predecessors
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch index of `node`, if planned.
    pub fn batch_of(&self, node: &NodeId) -> Option<usize> {
        self.batches.iter().position(|b| b.contains(node))
    }
}

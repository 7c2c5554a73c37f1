//! Dependency-graph execution: planning, batching and the bounded execution queue.
//!
//! # Architecture
//!
//! ```text
//! Vec<Task>
//!   ↓
//! reverse_dependencies() / filter_by_tags() / find_only_task()
//!   ↓
//! DependencyGraph::build(selected, universe) → run + output-only nodes, pruned
//!   ↓
//! DependencyGraph::batches() → ExecutionPlan { batches, predecessors }
//!   ↓
//! ExecutionQueue::run() → TaskExecutor::execute() per node
//! ```
//!
//! Batches describe waves of maximal parallelism. The queue does not treat them
//! as hard barriers: a node starts as soon as its own predecessors are done.

mod engine;
mod graph;
mod output;
mod plan;
mod scheduler;
mod task_exec;
pub mod types;

pub use engine::ExecutionEngine;
pub use graph::{plan_run, DependencyGraph};
pub use output::{emit_execution_plan, node_label, render_plan};
pub use plan::{ExecutionPlan, NodeId};
pub use scheduler::ExecutionQueue;
pub use task_exec::{TaskExecutor, TaskRunOptions};
pub use types::{RunOptions, RunOutcome, RunReport};

use serde_json::Value;

use crate::task::TaskSet;

use super::plan::{ExecutionPlan, NodeId};

/// Human-readable name of a plan node: the task's pretty ref, annotated for output-only fetches.
pub fn node_label(node: &NodeId, tasks: &TaskSet) -> String {
    let pretty = tasks
        .get(node.task_id())
        .map(|t| t.pretty_ref.clone())
        .unwrap_or_else(|| node.task_id().to_string());
    if node.is_output_only() {
        format!("(Output Only) {pretty}")
    } else {
        pretty
    }
}

/// The plan as a JSON array of batches, for `--graph`.
pub fn render_plan(plan: &ExecutionPlan, tasks: &TaskSet) -> Value {
    Value::Array(
        plan.batches()
            .iter()
            .map(|batch| {
                Value::Array(
                    batch
                        .iter()
                        .map(|node| Value::String(node_label(node, tasks)))
                        .collect(),
                )
            })
            .collect(),
    )
}

/// Logs the execution plan at debug level.
pub fn emit_execution_plan(run_id: &str, plan: &ExecutionPlan) {
    tracing::debug!(
        target: "nixtask.flow",
        stage = "run.plan",
        run_id = %run_id,
        batches = plan.batches().len(),
        nodes = plan.len()
    );
    for (i, batch) in plan.batches().iter().enumerate() {
        let nodes: Vec<String> = batch.iter().map(NodeId::to_string).collect();
        tracing::trace!(run_id = %run_id, batch = i, nodes = %nodes.join(", "), "planned batch");
    }
}

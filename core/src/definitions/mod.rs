//! Task-definition collaborator: loading tasks, lazy bodies, output transforms and realisation.

mod nix;
mod realise;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutorError;
use crate::task::Task;

pub use nix::{find_flake_root, rewrite_task_path, split_task_path, NixTaskDefinitions};
pub use realise::{is_gc_warning, is_store_path_line, realise_store_paths};

#[async_trait]
pub trait TaskDefinitions: Send + Sync {
    /// Evaluates a lazy task against its runtime context and returns the concrete record.
    async fn resolve_lazy_task(&self, task: &Task, context: &Value) -> Result<Task, ExecutorError>;

    /// Runs the task's output transform over the captured output. `None` keeps the captured value.
    async fn compute_output(
        &self,
        task: &Task,
        captured: Option<&Value>,
    ) -> Result<Option<Value>, ExecutorError>;

    /// Materialises everything the tasks reference before they run.
    async fn realise(&self, tasks: &[Arc<Task>]) -> Result<(), ExecutorError>;
}

//! Execution-environment collaborator: everything a task needs before it can be spawned.

mod lazy_context;
mod local;
mod preamble;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use crate::error::RunnerError;
use crate::task::{Task, TaskSet};

pub use lazy_context::build_lazy_context;
pub use local::{flake_local_repo_root, LocalRunEnvironment};
pub use preamble::{render_preamble, shell_quote, PreambleOptions};

/// Per-run inputs to environment preparation.
#[derive(Debug, Clone, Copy)]
pub struct PrepareContext<'a> {
    pub dry_run: bool,
    /// Every loaded task, not just the selection. Used to find dependency outputs.
    pub universe: &'a TaskSet,
}

/// A prepared task environment. The temporary directory is released exactly once.
#[derive(Debug)]
pub struct PreparedEnvironment {
    pub working_dir: PathBuf,
    pub home_dir: PathBuf,
    pub output_file: PathBuf,
    pub env: BTreeMap<String, String>,
    pub lazy_context: Value,
    pub preamble: String,
    pub spawn_program: String,
    pub spawn_args: Vec<String>,
    /// Shell used for commands the task issues over the control channel.
    pub shell: String,
    pub temp_dir: Option<TempDir>,
}

impl PreparedEnvironment {
    pub fn temp_path(&self) -> Option<&std::path::Path> {
        self.temp_dir.as_ref().map(|t| t.path())
    }

    /// Removes the temporary directory. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove task temp dir");
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.temp_dir.is_none()
    }
}

#[async_trait]
pub trait RunEnvironment: Send + Sync {
    /// Once per run, before any task.
    async fn prepare_global(&self) -> Result<(), RunnerError>;

    async fn prepare(
        &self,
        task: &Task,
        ctx: PrepareContext<'_>,
    ) -> Result<PreparedEnvironment, RunnerError>;
}

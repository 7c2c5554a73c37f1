use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EvaluationError, ExecutorError, SelectionError};
use crate::evaluator::{nix_string, EvaluatorHandle};
use crate::task::{collect_tasks, RawTask, Task};

use super::realise::realise_store_paths;
use super::TaskDefinitions;

const TASKS_PREFIX: &str = "tasks.";

/// Task definitions backed by the evaluator process.
#[derive(Debug, Clone)]
pub struct NixTaskDefinitions {
    evaluator: EvaluatorHandle,
    lib_path: Option<String>,
    realise_program: String,
    root_dir: PathBuf,
}

impl NixTaskDefinitions {
    pub fn new(
        evaluator: EvaluatorHandle,
        lib_path: Option<String>,
        realise_program: impl Into<String>,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            evaluator,
            lib_path,
            realise_program: realise_program.into(),
            root_dir: root_dir.into(),
        }
    }

    pub async fn current_system(&self) -> Result<String, ExecutorError> {
        match self.evaluator.eval("builtins.currentSystem").await? {
            Some(Value::String(system)) => Ok(system),
            other => Err(EvaluationError::Decode(format!("currentSystem: {other:?}")).into()),
        }
    }

    /// Loads every task reachable from `task_paths` (`<flakeUrl>#<attr>`), flake by flake.
    #[tracing::instrument(name = "definitions.load_tasks", skip(self))]
    pub async fn load_tasks(&self, task_paths: &[String]) -> Result<Vec<Task>, ExecutorError> {
        let system = self.current_system().await?;
        let rewritten: Vec<(String, String)> = task_paths
            .iter()
            .map(|p| split_task_path(&rewrite_task_path(p, &system)))
            .collect();

        let mut flake_urls: Vec<&str> = Vec::new();
        for (url, _) in &rewritten {
            if !flake_urls.contains(&url.as_str()) {
                flake_urls.push(url.as_str());
            }
        }

        let mut tasks = Vec::new();
        for flake_url in flake_urls {
            let attributes: Vec<String> = rewritten
                .iter()
                .filter(|(url, _)| url == flake_url)
                .map(|(_, attr)| attr.clone())
                .collect();

            let raw = self.tasks_from_flake(flake_url, &attributes).await?;
            let resolved = if flake_url == "." {
                self.resolve_local_flake_url()
                    .unwrap_or_else(|| flake_url.to_string())
            } else {
                flake_url.to_string()
            };
            let collected = collect_tasks(raw, flake_url, &resolved, &attributes);
            tracing::debug!(flake = flake_url, count = collected.len(), "tasks loaded");
            tasks.extend(collected);
        }
        Ok(tasks)
    }

    async fn tasks_from_flake(
        &self,
        flake_url: &str,
        attributes: &[String],
    ) -> Result<Vec<RawTask>, ExecutorError> {
        for attr in attributes {
            if !attr.starts_with(TASKS_PREFIX) {
                return Err(SelectionError::InvalidTaskPath(attr.clone()).into());
            }
        }

        match &self.lib_path {
            Some(lib) => {
                self.evaluator.eval(format!(":l {lib}")).await?;
            }
            None => tracing::warn!("no task library configured; expecting the evaluator to provide it"),
        }
        self.evaluator.eval(format!(":lf {flake_url}")).await?;

        let collect: Vec<String> = attributes
            .iter()
            .map(|attr| {
                format!(
                    "(collectTasks {{ output = {attr}; currentPath = {}; }})",
                    nix_string(attr)
                )
            })
            .collect();
        let expr = format!(
            "builtins.toJSON (formatTasks (flatten [ {} ]))",
            collect.join(" ")
        );

        decode_raw_tasks(self.evaluator.eval(expr).await?)
    }

    /// `.` resolves to the nearest directory holding `flake.nix`.
    fn resolve_local_flake_url(&self) -> Option<String> {
        let root = find_flake_root(&self.root_dir)?;
        let scheme = if root.join(".git").exists() {
            "git+file://"
        } else {
            "file://"
        };
        Some(format!("{scheme}{}", root.display()))
    }
}

fn decode_raw_tasks(value: Option<Value>) -> Result<Vec<RawTask>, ExecutorError> {
    let value = value.unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(value)
        .map_err(|e| EvaluationError::Decode(format!("task records: {e}")).into())
}

/// Splits `<flakeUrl>#<attr>`. A missing `#` means the flake's root.
pub fn split_task_path(path: &str) -> (String, String) {
    match path.split_once('#') {
        Some((url, attr)) => (url.to_string(), attr.to_string()),
        None => (path.to_string(), String::new()),
    }
}

/// `<flakeUrl>#<attr>` becomes `<flakeUrl>#tasks.<system>[.<attr>]`.
pub fn rewrite_task_path(path: &str, system: &str) -> String {
    let (url, attr) = split_task_path(path);
    if attr.is_empty() {
        format!("{url}#tasks.{system}")
    } else {
        format!("{url}#tasks.{system}.{attr}")
    }
}

pub fn find_flake_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join("flake.nix").is_file())
        .map(Path::to_path_buf)
}

#[async_trait]
impl TaskDefinitions for NixTaskDefinitions {
    #[tracing::instrument(name = "definitions.resolve_lazy", skip(self, task, context), fields(task_id = %task.id))]
    async fn resolve_lazy_task(&self, task: &Task, context: &Value) -> Result<Task, ExecutorError> {
        let attr = &task.flake_attribute_path;
        if !attr.starts_with(TASKS_PREFIX) {
            return Err(SelectionError::InvalidTaskPath(attr.clone()).into());
        }
        let expr = format!(
            "__toJSON (formatTasks (collectTasks {{ output = {attr}.getLazy (builtins.fromJSON {}); currentPath = {}; }}))",
            nix_string(&context.to_string()),
            nix_string(attr)
        );
        let raw = decode_raw_tasks(self.evaluator.eval(expr).await?)?;
        collect_tasks(
            raw,
            &task.original_flake_url,
            &task.resolved_original_flake_url,
            &[],
        )
        .into_iter()
        .next()
        .ok_or_else(|| EvaluationError::Decode(format!("lazy task {attr} produced no record")).into())
    }

    #[tracing::instrument(name = "definitions.compute_output", skip(self, task, captured), fields(task_id = %task.id))]
    async fn compute_output(
        &self,
        task: &Task,
        captured: Option<&Value>,
    ) -> Result<Option<Value>, ExecutorError> {
        let current = captured.cloned().unwrap_or_else(|| serde_json::json!({}));
        let expr = format!(
            "__toJSON ({}.getOutput (builtins.fromJSON {}))",
            task.flake_attribute_path,
            nix_string(&current.to_string())
        );
        Ok(self.evaluator.eval(expr).await?)
    }

    async fn realise(&self, tasks: &[Arc<Task>]) -> Result<(), ExecutorError> {
        let mut seen = HashSet::new();
        let paths: Vec<String> = tasks
            .iter()
            .flat_map(|t| t.store_dependencies.iter())
            .filter(|p| seen.insert(p.as_str()))
            .cloned()
            .collect();
        realise_store_paths(&self.realise_program, &paths).await?;
        Ok(())
    }
}

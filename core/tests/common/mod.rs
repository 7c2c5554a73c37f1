#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use nixtask_core::config::{EnvironmentConfig, EvaluatorConfig, ExecutorConfig};
use nixtask_core::definitions::TaskDefinitions;
use nixtask_core::environment::LocalRunEnvironment;
use nixtask_core::error::ExecutorError;
use nixtask_core::evaluator::EvaluatorDriver;
use nixtask_core::executor::ExecutionEngine;
use nixtask_core::task::{discover_dependencies, Dependency, Script, Task};

pub fn task(id: &str, deps: &[&str], body: &str) -> Task {
    let deps: BTreeMap<String, Dependency> = deps
        .iter()
        .map(|d| (d.to_string(), Dependency::Task(d.to_string())))
        .collect();
    Task {
        id: id.to_string(),
        name: id.to_string(),
        flake_attribute_path: format!("tasks.x86_64-linux.{id}"),
        flake_pretty_attribute_path: id.to_string(),
        reference: format!(".#tasks.x86_64-linux.{id}"),
        pretty_ref: format!(".#{id}"),
        original_flake_url: ".".to_string(),
        resolved_original_flake_url: "path:/nonexistent".to_string(),
        all_discovered_deps: discover_dependencies(&deps),
        deps,
        original_deps: None,
        run: Some(Script::Body(body.to_string())),
        fetch_output: None,
        custom_functions: BTreeMap::new(),
        has_get_output: false,
        artifacts: vec![],
        dir: None,
        // "" becomes /bin, next to the workspace's /usr/bin
        path: vec![String::new()],
        tags: vec![],
        impure_env_passthrough: vec![],
        store_dependencies: vec![],
        exact_ref_match: false,
    }
}

/// Task-definition collaborator with canned lazy bodies; records what it was asked.
#[derive(Default)]
pub struct FakeDefinitions {
    pub lazy_bodies: HashMap<String, String>,
    pub computed_outputs: HashMap<String, Value>,
    pub realised: Mutex<Vec<String>>,
    pub lazy_contexts: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl TaskDefinitions for FakeDefinitions {
    async fn resolve_lazy_task(&self, task: &Task, context: &Value) -> Result<Task, ExecutorError> {
        self.lazy_contexts
            .lock()
            .unwrap()
            .push((task.id.clone(), context.clone()));
        let mut concrete = task.clone();
        concrete.run = self.lazy_bodies.get(&task.id).cloned().map(Script::Body);
        Ok(concrete)
    }

    async fn compute_output(
        &self,
        task: &Task,
        _captured: Option<&Value>,
    ) -> Result<Option<Value>, ExecutorError> {
        Ok(self.computed_outputs.get(&task.id).cloned())
    }

    async fn realise(&self, tasks: &[Arc<Task>]) -> Result<(), ExecutorError> {
        self.realised
            .lock()
            .unwrap()
            .extend(tasks.iter().map(|t| t.id.clone()));
        Ok(())
    }
}

/// Scratch workspace: state directory plus a marker directory scripts can write into.
pub struct Workspace {
    pub root: tempfile::TempDir,
    pub marks: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let marks = root.path().join("marks");
        std::fs::create_dir_all(&marks).unwrap();
        Self { root, marks }
    }

    pub fn mark(&self, name: &str) -> String {
        self.marks.join(name).display().to_string()
    }

    pub fn environment(&self) -> LocalRunEnvironment {
        LocalRunEnvironment::new(
            self.root.path(),
            EnvironmentConfig {
                coreutils: Some("/usr".into()),
                ..EnvironmentConfig::default()
            },
        )
        .with_host_env(BTreeMap::new())
    }

    pub fn engine(&self, definitions: Arc<FakeDefinitions>) -> ExecutionEngine {
        ExecutionEngine::new(
            definitions,
            Arc::new(self.environment()),
            ExecutorConfig {
                flush_interval_ms: 50,
                background_grace_ms: 500,
                ..ExecutorConfig::default()
            },
        )
    }

    pub fn output_of(&self, task: &Task) -> Option<Value> {
        let path = self.environment().output_file(task);
        let raw = std::fs::read_to_string(path).ok()?;
        Some(serde_json::from_str(&raw).unwrap())
    }
}

pub fn exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

pub fn evaluator_config() -> EvaluatorConfig {
    EvaluatorConfig {
        startup_marker: "Type :? for help".into(),
        startup_timeout_ms: 2_000,
        ..EvaluatorConfig::default()
    }
}

/// A fake evaluator that answers slowly with `"reply:<command>"` and records every command.
pub async fn start_recording_evaluator(received: Arc<Mutex<Vec<String>>>) -> EvaluatorDriver {
    let (drv_in, fake_in) = tokio::io::duplex(64 * 1024);
    let (mut fake_out, drv_out) = tokio::io::duplex(64 * 1024);
    let (mut fake_err, drv_err) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        fake_err
            .write_all(b"Welcome to Nix\nType :? for help.\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(fake_in).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            received.lock().unwrap().push(line.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            let reply = serde_json::to_string(&format!("reply:{line}")).unwrap();
            fake_out.write_all(reply.as_bytes()).await.unwrap();
            fake_out.write_all(b"\n").await.unwrap();
        }
    });

    EvaluatorDriver::start(drv_in, drv_out, drv_err, &evaluator_config())
        .await
        .unwrap()
}

/// Shared in-memory writer for console output.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

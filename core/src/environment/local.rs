use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::EnvironmentConfig;
use crate::error::RunnerError;
use crate::task::Task;

use super::lazy_context::build_lazy_context;
use super::preamble::{render_preamble, PreambleOptions};
use super::{PrepareContext, PreparedEnvironment, RunEnvironment};

/// Placeholder store path the evaluator uses for sources that stay in the local checkout.
const LAZY_SOURCE_PREFIX: &str = "/nix/store/lazylaz";

/// Per-task state under `<root>/<state_dir>`: home, work, artifacts and output directories.
#[derive(Debug, Clone)]
pub struct LocalRunEnvironment {
    root_dir: PathBuf,
    state_dir: PathBuf,
    cfg: EnvironmentConfig,
    host_env: BTreeMap<String, String>,
}

impl LocalRunEnvironment {
    pub fn new(root_dir: impl Into<PathBuf>, cfg: EnvironmentConfig) -> Self {
        let root_dir = root_dir.into();
        Self {
            state_dir: root_dir.join(&cfg.state_dir),
            root_dir,
            cfg,
            host_env: std::env::vars().collect(),
        }
    }

    /// Replaces the environment the impure passthrough variables are read from.
    pub fn with_host_env(mut self, host_env: BTreeMap<String, String>) -> Self {
        self.host_env = host_env;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn output_file(&self, task: &Task) -> PathBuf {
        self.state_dir
            .join("output")
            .join(format!("{}.json", task.dir_key()))
    }

    fn working_dir(&self, task: &Task, work_dir: &Path) -> PathBuf {
        let Some(dir) = task.dir.as_deref() else {
            return work_dir.to_path_buf();
        };
        if !dir.starts_with(LAZY_SOURCE_PREFIX) {
            return PathBuf::from(dir);
        }
        if let Some(path) = task.resolved_original_flake_url.strip_prefix("file://") {
            return PathBuf::from(strip_query(path));
        }
        // /nix/store/<hash>-source/<rest> maps onto <root>/<rest>
        let rest: Vec<&str> = dir.split('/').skip(4).collect();
        self.root_dir.join(rest.join("/"))
    }

    fn spawn_command(&self) -> (String, Vec<String>) {
        if self.namespaces_enabled() {
            let unshare = match &self.cfg.util_linux {
                Some(prefix) => format!("{prefix}/bin/unshare"),
                None => "unshare".to_string(),
            };
            (
                unshare,
                vec![
                    "--map-root-user".into(),
                    "--mount".into(),
                    self.cfg.bash.clone(),
                ],
            )
        } else {
            (self.cfg.bash.clone(), Vec::new())
        }
    }

    fn namespaces_enabled(&self) -> bool {
        self.cfg.task_user_namespaces && cfg!(target_os = "linux")
    }
}

fn io_err(what: &str, path: &Path, e: std::io::Error) -> RunnerError {
    RunnerError::Environment(format!("{what} {}: {e}", path.display()))
}

fn strip_query(s: &str) -> &str {
    s.split(['?', '#']).next().unwrap_or(s)
}

/// Checkout root of a `git+file://` flake URL.
pub fn flake_local_repo_root(resolved_flake_url: &str) -> Option<PathBuf> {
    let path = strip_query(resolved_flake_url.strip_prefix("git+file://")?);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[async_trait]
impl RunEnvironment for LocalRunEnvironment {
    async fn prepare_global(&self) -> Result<(), RunnerError> {
        let output = self.state_dir.join("output");
        tokio::fs::create_dir_all(&output)
            .await
            .map_err(|e| io_err("create", &output, e))
    }

    async fn prepare(
        &self,
        task: &Task,
        ctx: PrepareContext<'_>,
    ) -> Result<PreparedEnvironment, RunnerError> {
        let key = task.dir_key();
        let home_dir = self.state_dir.join("home").join(&key);
        let work_dir = self.state_dir.join("work").join(&key);
        let artifacts_dir = self.state_dir.join("artifacts").join(&key);
        let output_file = self.output_file(task);

        let temp_dir = tempfile::Builder::new()
            .prefix("nix-task-")
            .tempdir()
            .map_err(|e| RunnerError::Environment(format!("temp dir: {e}")))?;
        let tmp = temp_dir.path().to_string_lossy().into_owned();

        if task.dir.is_none() {
            tokio::fs::create_dir_all(&work_dir)
                .await
                .map_err(|e| io_err("create", &work_dir, e))?;
        }
        tokio::fs::create_dir_all(&home_dir)
            .await
            .map_err(|e| io_err("create", &home_dir, e))?;
        if !task.artifacts.is_empty() {
            tokio::fs::create_dir_all(&artifacts_dir)
                .await
                .map_err(|e| io_err("create", &artifacts_dir, e))?;
        }

        let mut env = BTreeMap::new();
        if let Some(home) = self.host_env.get("HOME") {
            env.insert("IMPURE_HOME".to_string(), home.clone());
        }
        if let Some(root) = flake_local_repo_root(&task.resolved_original_flake_url) {
            env.insert(
                "IMPURE_LOCAL_REPO_ROOT".to_string(),
                root.to_string_lossy().into_owned(),
            );
        }
        let task_path: Vec<String> = self
            .cfg
            .coreutils
            .iter()
            .chain(task.path.iter())
            .map(|p| format!("{p}/bin"))
            .collect();
        env.insert("__taskPath".to_string(), task_path.join(":"));
        for name in ["TMP", "TMPDIR", "TEMP", "TEMPDIR"] {
            env.insert(name.to_string(), tmp.clone());
        }
        env.insert("NIX_TASK_FLAKE_PATH".to_string(), task.reference.clone());
        env.insert(
            "out".to_string(),
            artifacts_dir.to_string_lossy().into_owned(),
        );
        for name in &task.impure_env_passthrough {
            if let Some(value) = self.host_env.get(name) {
                env.insert(format!("IMPURE_{name}"), value.clone());
            }
        }

        let lazy_context =
            build_lazy_context(task, ctx.universe, |dep| self.output_file(dep)).await;
        tracing::debug!(task_id = %task.id, lazy_context = %lazy_context, "task lazy context");

        let mount = self
            .cfg
            .util_linux
            .as_ref()
            .map(|p| format!("{p}/bin/mount"))
            .unwrap_or_else(|| "mount".to_string());
        let preamble = render_preamble(&PreambleOptions {
            jq: &self.cfg.jq,
            curl: &self.cfg.curl,
            deps: &lazy_context["deps"],
            dry_run: ctx.dry_run,
            namespace_home: self
                .namespaces_enabled()
                .then_some((mount.as_str(), home_dir.as_path())),
        });

        let (spawn_program, spawn_args) = self.spawn_command();

        Ok(PreparedEnvironment {
            working_dir: self.working_dir(task, &work_dir),
            home_dir,
            output_file,
            env,
            lazy_context,
            preamble,
            spawn_program,
            spawn_args,
            shell: self.cfg.bash.clone(),
            temp_dir: Some(temp_dir),
        })
    }
}

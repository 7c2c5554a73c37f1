use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::config::ExecutorConfig;
use crate::definitions::TaskDefinitions;
use crate::environment::{PrepareContext, PreparedEnvironment, RunEnvironment};
use crate::error::{EvaluationError, ExecutorError, RunnerError};
use crate::evaluator::EvaluatorHandle;
use crate::runner::{
    run_finally, spawn_aggregator, spawn_control_reader, spawn_task, AggregatorOptions,
    BackgroundSupervisor, Console, ControlCommand, ControlDispatcher, ControlSocket, HeaderKind,
    SectionLabel, ShellContext, StdioMode, TaskSpawn, CONTROL_SOCKET_ENV,
};
use crate::task::{Script, ScriptSelection, Task, TaskSet};

use super::plan::NodeId;

/// Per-run knobs for task execution.
#[derive(Debug, Clone)]
pub struct TaskRunOptions {
    pub custom_function: Option<String>,
    pub dry_run: bool,
    pub interactive: bool,
    /// More than one task may run at once; output goes through the aggregator.
    pub concurrent: bool,
    pub flush_interval: Duration,
    pub background_grace: Duration,
    pub control_drain: Duration,
    pub line_channel_capacity: usize,
}

impl TaskRunOptions {
    pub fn from_config(cfg: &ExecutorConfig, concurrency: usize) -> Self {
        Self {
            custom_function: None,
            dry_run: false,
            interactive: false,
            concurrent: concurrency > 1,
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            background_grace: Duration::from_millis(cfg.background_grace_ms),
            control_drain: Duration::from_millis(cfg.control_drain_ms),
            line_channel_capacity: cfg.line_channel_capacity,
        }
    }

    fn stdio(&self) -> StdioMode {
        if self.concurrent {
            StdioMode::Piped
        } else {
            StdioMode::Inherit {
                interactive: self.interactive,
            }
        }
    }
}

/// Executes one plan node: resolve, spawn, collect output, clean up.
pub struct TaskExecutor {
    working: TaskSet,
    universe: TaskSet,
    definitions: Arc<dyn TaskDefinitions>,
    environment: Arc<dyn RunEnvironment>,
    console: Console,
    opts: TaskRunOptions,
    evaluator: Option<EvaluatorHandle>,
}

impl TaskExecutor {
    pub fn new(
        working: TaskSet,
        universe: TaskSet,
        definitions: Arc<dyn TaskDefinitions>,
        environment: Arc<dyn RunEnvironment>,
        console: Console,
        opts: TaskRunOptions,
    ) -> Self {
        Self {
            working,
            universe,
            definitions,
            environment,
            console,
            opts,
            evaluator: None,
        }
    }

    /// Serves each task a control socket backed by this evaluator.
    pub fn with_evaluator(mut self, evaluator: EvaluatorHandle) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    #[tracing::instrument(name = "task.execute", skip_all, fields(node = %node))]
    pub async fn execute(&self, node: NodeId) -> Result<(), ExecutorError> {
        let task = self
            .working
            .get(node.task_id())
            .or_else(|| self.universe.get(node.task_id()))
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownNode(node.to_string()))?;

        let selection = ScriptSelection::new(
            node.is_output_only(),
            self.opts.custom_function.as_deref(),
        );
        let header = if node.is_output_only() {
            HeaderKind::FetchOutput
        } else {
            HeaderKind::Run
        };
        self.console
            .task_header(&task.id, &task.pretty_ref, header, self.opts.dry_run);

        let mut prepared = self
            .environment
            .prepare(
                &task,
                PrepareContext {
                    dry_run: self.opts.dry_run,
                    universe: &self.universe,
                },
            )
            .await
            .map_err(|e| ExecutorError::task_failed(&task.pretty_ref, e.into()))?;

        let result = self.run_prepared(&task, &selection, &prepared).await;
        prepared.release();

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    target: "nixtask.flow",
                    stage = "task.failed",
                    task_id = %task.id,
                    error.kind = "task",
                    error.message = %e,
                    "task failed"
                );
                Err(ExecutorError::task_failed(&task.pretty_ref, e))
            }
        }
    }

    async fn run_prepared(
        &self,
        task: &Task,
        selection: &ScriptSelection,
        prepared: &PreparedEnvironment,
    ) -> Result<(), ExecutorError> {
        let Some(body) = self.resolve_body(task, selection, prepared).await? else {
            self.console.note(&missing_script_note(selection));
            return Ok(());
        };

        let captured = self.spawn_and_supervise(task, &body, prepared).await?;

        if !selection.produces_output() {
            return Ok(());
        }

        let mut output = captured;
        if task.has_get_output {
            if let Some(computed) = self
                .definitions
                .compute_output(task, output.as_ref())
                .await?
            {
                output = Some(computed);
            }
        }

        match output {
            Some(value) => persist_output(&prepared.output_file, &value).await,
            None => Ok(()),
        }
    }

    /// The script body to run, evaluating lazy tasks once. `None` when nothing is defined.
    async fn resolve_body(
        &self,
        task: &Task,
        selection: &ScriptSelection,
        prepared: &PreparedEnvironment,
    ) -> Result<Option<String>, ExecutorError> {
        match task.script(selection) {
            None => Ok(None),
            Some(Script::Body(body)) => Ok(Some(body.clone())),
            Some(Script::Lazy) => {
                tracing::debug!(task_id = %task.id, "resolving lazy task");
                let concrete = self
                    .definitions
                    .resolve_lazy_task(task, &prepared.lazy_context)
                    .await?;
                self.definitions
                    .realise(&[Arc::new(concrete.clone())])
                    .await?;
                match concrete.script(selection) {
                    None => Ok(None),
                    Some(Script::Body(body)) => Ok(Some(body.clone())),
                    Some(Script::Lazy) => Err(EvaluationError::Decode(format!(
                        "lazy task {} resolved to another lazy task",
                        task.pretty_ref
                    ))
                    .into()),
                }
            }
        }
    }

    /// Runs the task process to completion and returns the output it set, if any.
    async fn spawn_and_supervise(
        &self,
        task: &Task,
        body: &str,
        prepared: &PreparedEnvironment,
    ) -> Result<Option<Value>, ExecutorError> {
        let script = format!("{}\n{}", prepared.preamble, body);
        let mut args = prepared.spawn_args.clone();
        args.extend(["--norc", "--noprofile", "-c"].map(String::from));
        args.push(script);

        let mut env = prepared.env.clone();
        env.insert(
            "HOME".to_string(),
            prepared.home_dir.to_string_lossy().into_owned(),
        );

        // Lives until the finally commands are done; they may evaluate too.
        let control_socket = match (&self.evaluator, prepared.temp_path()) {
            (Some(evaluator), Some(dir)) => {
                let socket = ControlSocket::bind(dir, evaluator.clone(), task)?;
                env.insert(
                    CONTROL_SOCKET_ENV.to_string(),
                    socket.path().to_string_lossy().into_owned(),
                );
                Some(socket)
            }
            _ => None,
        };

        let spawned = spawn_task(&TaskSpawn {
            program: &prepared.spawn_program,
            args: &args,
            cwd: &prepared.working_dir,
            env: &env,
            stdio: self.opts.stdio(),
        })?;
        let mut child = spawned.child;
        tracing::debug!(
            target: "nixtask.flow",
            stage = "task.spawned",
            task_id = %task.id,
            pid = child.id().unwrap_or_default()
        );

        let aggregator = self.opts.concurrent.then(|| self.attach_aggregator(task, &mut child));

        let shell_ctx = ShellContext {
            shell: prepared.shell.clone(),
            cwd: prepared.working_dir.clone(),
            env,
            console: self.console.clone(),
        };
        let background = BackgroundSupervisor::new(shell_ctx.clone(), self.opts.background_grace);
        let mut dispatcher = ControlDispatcher::new(task.id.clone(), background);
        let (mut control_rx, reader) = spawn_control_reader(
            spawned.control,
            task.id.clone(),
            self.opts.line_channel_capacity,
        );

        let status = wait_dispatching(&mut child, &mut control_rx, &mut dispatcher).await;

        // Grandchildren may still hold the control pipe open; give late lines a bounded window.
        let _ = tokio::time::timeout(self.opts.control_drain, async {
            while let Some(cmd) = control_rx.recv().await {
                dispatcher.apply(cmd);
            }
        })
        .await;
        reader.abort();

        let (output, finally, mut background) = dispatcher.finish();
        if !background.is_empty() {
            tracing::debug!(task_id = %task.id, count = background.len(), "terminating background commands");
        }
        background.terminate_all().await;
        run_finally(&finally, &shell_ctx, self.opts.background_grace).await;
        drop(control_socket);

        if let Some(handle) = aggregator {
            let mut handle = handle;
            let settle = self.opts.flush_interval + self.opts.control_drain;
            if tokio::time::timeout(settle, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let status = status?;
        if !status.success() {
            return Err(RunnerError::ExitStatus {
                code: status.code(),
            }
            .into());
        }
        Ok(output)
    }

    fn attach_aggregator(&self, task: &Task, child: &mut Child) -> tokio::task::JoinHandle<()> {
        let label = SectionLabel {
            task_id: task.id.clone(),
            pretty_ref: task.pretty_ref.clone(),
        };
        let opts = AggregatorOptions {
            flush_interval: self.opts.flush_interval,
            channel_capacity: self.opts.line_channel_capacity,
        };
        match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => spawn_aggregator(out, err, label, self.console.clone(), opts),
            (Some(out), None) => {
                spawn_aggregator(out, tokio::io::empty(), label, self.console.clone(), opts)
            }
            (None, Some(err)) => {
                spawn_aggregator(tokio::io::empty(), err, label, self.console.clone(), opts)
            }
            (None, None) => tokio::spawn(async {}),
        }
    }
}

/// Waits for the task process, applying control commands as they arrive.
async fn wait_dispatching(
    child: &mut Child,
    control_rx: &mut mpsc::Receiver<ControlCommand>,
    dispatcher: &mut ControlDispatcher,
) -> Result<std::process::ExitStatus, RunnerError> {
    let mut control_open = true;
    loop {
        tokio::select! {
            cmd = control_rx.recv(), if control_open => match cmd {
                Some(cmd) => dispatcher.apply(cmd),
                None => control_open = false,
            },
            status = child.wait() => {
                return status.map_err(|e| RunnerError::Spawn(format!("wait for task process: {e}")));
            }
        }
    }
}

async fn persist_output(path: &std::path::Path, value: &Value) -> Result<(), ExecutorError> {
    let persist_err = |source: std::io::Error| ExecutorError::OutputPersist {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| persist_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    tokio::fs::write(path, json).await.map_err(persist_err)?;
    tracing::debug!(path = %path.display(), "output persisted");
    Ok(())
}

fn missing_script_note(selection: &ScriptSelection) -> String {
    match selection {
        ScriptSelection::FetchOutput => "No fetchOutput defined for task, continuing".to_string(),
        ScriptSelection::Custom(name) => {
            format!("No \"{name}\" script defined for task, continuing")
        }
        ScriptSelection::Run => "No run script defined for task, continuing".to_string(),
    }
}

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::definitions::TaskDefinitions;
use crate::environment::RunEnvironment;
use crate::error::{EvaluationError, ExecutorError, SelectionError};
use crate::evaluator::EvaluatorHandle;
use crate::runner::Console;
use crate::task::{filter_by_tags, find_only_task, reverse_dependencies, Task, TaskSet};

use super::graph::plan_run;
use super::output::{emit_execution_plan, render_plan};
use super::plan::ExecutionPlan;
use super::scheduler::ExecutionQueue;
use super::task_exec::{TaskExecutor, TaskRunOptions};
use super::types::{RunOptions, RunOutcome, RunReport};

/// Plans and executes a run over a loaded task universe.
pub struct ExecutionEngine {
    definitions: Arc<dyn TaskDefinitions>,
    environment: Arc<dyn RunEnvironment>,
    config: ExecutorConfig,
    console: Console,
    evaluator: Option<EvaluatorHandle>,
}

impl ExecutionEngine {
    pub fn new(
        definitions: Arc<dyn TaskDefinitions>,
        environment: Arc<dyn RunEnvironment>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            definitions,
            environment,
            config,
            console: Console::new(),
            evaluator: None,
        }
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Abort the run if this evaluator goes away, even while no request is pending.
    /// Tasks also reach it through their control sockets.
    pub fn with_evaluator(mut self, evaluator: EvaluatorHandle) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Selects, plans and executes `tasks` according to `opts`.
    ///
    /// Selection and graph errors abort before anything runs. The first task
    /// failure aborts the rest of the run and is returned.
    #[tracing::instrument(name = "run", skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, tasks: Vec<Task>, opts: &RunOptions) -> Result<RunReport, ExecutorError> {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let concurrency = opts.effective_concurrency(self.config.concurrency);
        if opts.interactive && concurrency > 1 {
            return Err(SelectionError::IncompatibleFlags(
                "cannot use --concurrency and --interactive at the same time".into(),
            )
            .into());
        }

        let universe: TaskSet = tasks.into_iter().map(Arc::new).collect();
        let working = if opts.reverse {
            reverse_dependencies(&universe)
        } else {
            universe.clone()
        };

        let plan = self.plan(&working, &universe, opts)?;
        emit_execution_plan(&run_id, &plan);

        if opts.graph {
            return Ok(RunReport {
                run_id,
                outcome: RunOutcome::Graph(render_plan(&plan, &working)),
            });
        }

        tracing::info!(
            target: "nixtask.flow",
            stage = "run.start",
            tasks = working.len(),
            nodes = plan.len(),
            concurrency = concurrency,
            "run starting"
        );

        self.definitions.realise(&working.to_vec()).await?;

        let started = Instant::now();
        self.environment.prepare_global().await?;

        if opts.dry_run {
            self.console
                .warning("Instructing tasks to run in dry run mode");
        }

        let mut task_opts = TaskRunOptions::from_config(&self.config, concurrency);
        task_opts.custom_function = opts.custom_function.clone();
        task_opts.dry_run = opts.dry_run;
        task_opts.interactive = opts.interactive;

        let mut executor = TaskExecutor::new(
            working,
            universe,
            self.definitions.clone(),
            self.environment.clone(),
            self.console.clone(),
            task_opts,
        );
        if let Some(evaluator) = &self.evaluator {
            executor = executor.with_evaluator(evaluator.clone());
        }

        let result = self.execute_plan(&plan, &executor, concurrency).await;

        match result {
            Ok(completed) if plan.is_empty() => {
                debug_assert_eq!(completed, 0);
                self.console.summary_no_tasks();
                tracing::info!(target: "nixtask.flow", stage = "run.end", outcome = "no_tasks");
                Ok(RunReport {
                    run_id,
                    outcome: RunOutcome::NoTasks,
                })
            }
            Ok(nodes) => {
                let elapsed = started.elapsed();
                self.console.summary_success(elapsed.as_secs_f64());
                tracing::info!(
                    target: "nixtask.flow",
                    stage = "run.end",
                    outcome = "success",
                    nodes = nodes,
                    elapsed_ms = elapsed.as_millis() as u64
                );
                Ok(RunReport {
                    run_id,
                    outcome: RunOutcome::Completed { nodes, elapsed },
                })
            }
            Err(e) => {
                let kind = if e.is_evaluator_fatal() { "evaluator" } else { "task" };
                self.console.failure(&e.to_string());
                self.console.summary_failed();
                tracing::error!(
                    target: "nixtask.flow",
                    stage = "run.end",
                    outcome = "failed",
                    error.kind = kind,
                    error.message = %e,
                    "run failed"
                );
                Err(e)
            }
        }
    }

    fn plan(
        &self,
        working: &TaskSet,
        universe: &TaskSet,
        opts: &RunOptions,
    ) -> Result<ExecutionPlan, ExecutorError> {
        if opts.only {
            let task = find_only_task(working)?;
            return Ok(ExecutionPlan::single(task.id.clone()));
        }

        let plan = if opts.only_tags.is_empty() {
            plan_run(working, universe)?
        } else {
            plan_run(&filter_by_tags(working, &opts.only_tags), universe)?
        };
        Ok(plan)
    }

    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        executor: &TaskExecutor,
        concurrency: usize,
    ) -> Result<usize, ExecutorError> {
        let queue = ExecutionQueue::new(concurrency);
        let run = queue.run(plan, move |node| executor.execute(node));

        let evaluator_gone = async {
            match &self.evaluator {
                Some(handle) => handle.closed().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = run => result,
            _ = evaluator_gone => Err(EvaluationError::ProcessExited.into()),
        }
    }
}

//! Wires configuration, the evaluator and the collaborators together for one `run`.
use std::sync::Arc;

use nixtask_core::config::AppConfig;
use nixtask_core::definitions::NixTaskDefinitions;
use nixtask_core::environment::LocalRunEnvironment;
use nixtask_core::error::{CliError, ExecutorError};
use nixtask_core::evaluator::EvaluatorDriver;
use nixtask_core::executor::{ExecutionEngine, RunOutcome};

use crate::commands::cli::RunArgs;

#[tracing::instrument(name = "cli.run", skip_all, fields(paths = run_args.task_paths.len()))]
pub async fn run_tasks(cfg: AppConfig, run_args: RunArgs) -> Result<i32, CliError> {
    let root_dir = std::env::current_dir()?;

    let driver = EvaluatorDriver::spawn(&cfg.evaluator)
        .await
        .map_err(ExecutorError::from)?;

    let definitions = Arc::new(NixTaskDefinitions::new(
        driver.handle(),
        cfg.evaluator.lib_path.clone(),
        cfg.realise.program.clone(),
        &root_dir,
    ));
    let environment = Arc::new(LocalRunEnvironment::new(&root_dir, cfg.environment.clone()));

    let result = async {
        let tasks = definitions.load_tasks(&run_args.task_paths).await?;
        tracing::debug!(count = tasks.len(), "tasks loaded");

        ExecutionEngine::new(definitions.clone(), environment, cfg.executor.clone())
            .with_evaluator(driver.handle())
            .run(tasks, &run_args.run_options())
            .await
    }
    .await;

    driver.shutdown().await;

    let report = result?;
    if let RunOutcome::Graph(plan) = &report.outcome {
        let rendered = serde_json::to_string_pretty(plan)
            .map_err(|e| CliError::Command(format!("render graph: {e}")))?;
        println!("{rendered}");
    }
    Ok(report.exit_code())
}

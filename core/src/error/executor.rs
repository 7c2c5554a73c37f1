use thiserror::Error;

use super::{DependencyGraphError, EvaluationError, RunnerError, SelectionError};

/// Run-level error: anything that aborts the whole run.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    DependencyGraph(#[from] DependencyGraphError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<ExecutorError>,
    },

    #[error("Unknown node in execution plan: {0}")]
    UnknownNode(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("failed to persist output to {path}: {source}")]
    OutputPersist {
        path: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn task_failed(task: impl Into<String>, source: ExecutorError) -> Self {
        Self::TaskFailed {
            task: task.into(),
            source: Box::new(source),
        }
    }

    /// True when the evaluator process itself is gone.
    pub fn is_evaluator_fatal(&self) -> bool {
        match self {
            Self::Evaluation(e) => e.is_fatal(),
            Self::TaskFailed { source, .. } => source.is_evaluator_fatal(),
            _ => false,
        }
    }
}

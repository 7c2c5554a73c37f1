use thiserror::Error;

/// Raised while building or batching the dependency graph. Fatal before any execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyGraphError {
    #[error("Dependency not found: task '{task_id}' depends on '{missing_dep}'")]
    MissingDependency { task_id: String, missing_dep: String },

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),
}

/// Raised when the requested task selection or mode flags cannot be honoured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Must pass an exact path to a single task when using --only (no exact match)")]
    NoExactMatch,

    #[error("Must pass an exact path to a single task when using --only ({0} exact matches)")]
    AmbiguousExactMatch(usize),

    #[error("Incompatible options: {0}")]
    IncompatibleFlags(String),

    #[error("Invalid task path '{0}': all tasks must be part of the tasks attribute")]
    InvalidTaskPath(String),
}

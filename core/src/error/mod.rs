#[allow(clippy::module_inception)]
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod graph;

pub use error::{CliError, ControlDecodeError, RunnerError};
pub use evaluator::EvaluationError;
pub use executor::ExecutorError;
pub use graph::{DependencyGraphError, SelectionError};

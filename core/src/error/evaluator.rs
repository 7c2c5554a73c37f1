use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluationError {
    /// The evaluator reported an error on its diagnostic stream and produced no value.
    #[error("evaluation error: {0}")]
    Diagnostic(String),

    #[error("evaluator process exited")]
    ProcessExited,

    #[error("evaluator failed to start: {0}")]
    Startup(String),

    #[error("evaluator io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("evaluator request queue closed")]
    QueueClosed,

    #[error("unexpected evaluator response: {0}")]
    Decode(String),
}

impl EvaluationError {
    /// Process death is unconditionally fatal to the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProcessExited | Self::QueueClosed | Self::Startup(_))
    }
}

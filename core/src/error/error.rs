use thiserror::Error;

use super::ExecutorError;

/// Top-level error of the `nix-task` binary.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Failures of a task subprocess (spawn, I/O plumbing, non-zero exit).
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("process exited with status {code:?}")]
    ExitStatus { code: Option<i32> },
    #[error("stream io error: {stream} {source}")]
    StreamIo {
        stream: &'static str,
        source: std::io::Error,
    },
    #[error("environment setup failed: {0}")]
    Environment(String),
}

/// A control-channel line that could not be decoded. Logged and dropped, never propagated.
#[derive(Error, Debug)]
pub enum ControlDecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("field '{field}' is not valid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

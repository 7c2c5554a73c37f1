//! The per-task control channel: one JSON object per line on a dedicated pipe.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ControlDecodeError, RunnerError};

use super::background::BackgroundSupervisor;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// `None` clears the captured output.
    SetOutput(Option<Value>),
    RunInBackground(ShellCommand),
    RunFinally(ShellCommand),
}

/// A shell command issued by a task. Missing `cwd`/`env` fall back to the task's own.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShellCommand {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
enum WireCommand {
    SetOutput {
        #[serde(default)]
        output: Value,
    },
    RunInBackground(WireShell),
    RunFinally(WireShell),
}

#[derive(Debug, Deserialize)]
struct WireShell {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Value,
}

impl ControlCommand {
    pub fn decode(line: &str) -> Result<Self, ControlDecodeError> {
        let wire: WireCommand = serde_json::from_str(line)?;
        Ok(match wire {
            WireCommand::SetOutput { output } => ControlCommand::SetOutput(decode_output(output)),
            WireCommand::RunInBackground(s) => ControlCommand::RunInBackground(s.try_into()?),
            WireCommand::RunFinally(s) => ControlCommand::RunFinally(s.try_into()?),
        })
    }
}

/// `taskSetOutput` sends its argument as a string; JSON inside it is decoded. `null` is no output.
fn decode_output(output: Value) -> Option<Value> {
    let value = match output {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        v => v,
    };
    (!value.is_null()).then_some(value)
}

impl TryFrom<WireShell> for ShellCommand {
    type Error = ControlDecodeError;

    fn try_from(w: WireShell) -> Result<Self, Self::Error> {
        let env = match w.env {
            Value::Null => None,
            Value::String(s) => Some(env_map(serde_json::from_str(&s).map_err(|e| {
                ControlDecodeError::InvalidField {
                    field: "env",
                    reason: e.to_string(),
                }
            })?)?),
            v => Some(env_map(v)?),
        };
        Ok(ShellCommand {
            command: w.command,
            cwd: w.cwd.filter(|c| !c.is_empty()).map(PathBuf::from),
            env,
        })
    }
}

fn env_map(v: Value) -> Result<BTreeMap<String, String>, ControlDecodeError> {
    let Value::Object(obj) = v else {
        return Err(ControlDecodeError::InvalidField {
            field: "env",
            reason: "expected an object".into(),
        });
    };
    Ok(obj
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Null => None,
            other => Some((k, other.to_string())),
        })
        .collect())
}

/// Reads the control pipe until EOF, forwarding decoded commands. Bad lines are dropped.
pub fn spawn_control_reader<R>(
    reader: R,
    task_id: String,
    capacity: usize,
) -> (mpsc::Receiver<ControlCommand>, JoinHandle<Result<(), RunnerError>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| RunnerError::StreamIo {
            stream: "control",
            source: e,
        })? {
            if line.trim().is_empty() {
                continue;
            }
            match ControlCommand::decode(&line) {
                Ok(cmd) => {
                    if tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task_id,
                        error.kind = "control.decode",
                        error.message = %e,
                        line = %line,
                        "failed to decode control command"
                    );
                }
            }
        }
        Ok(())
    });
    (rx, handle)
}

/// Applies control commands for one task execution.
pub struct ControlDispatcher {
    task_id: String,
    output: Option<Value>,
    finally: Vec<ShellCommand>,
    background: BackgroundSupervisor,
}

impl ControlDispatcher {
    pub fn new(task_id: impl Into<String>, background: BackgroundSupervisor) -> Self {
        Self {
            task_id: task_id.into(),
            output: None,
            finally: Vec::new(),
            background,
        }
    }

    pub fn apply(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::SetOutput(v) => {
                tracing::debug!(task_id = %self.task_id, cleared = v.is_none(), "output captured");
                self.output = v;
            }
            ControlCommand::RunInBackground(shell) => {
                if let Err(e) = self.background.spawn(&shell) {
                    tracing::warn!(task_id = %self.task_id, command = %shell.command, error = %e, "background command failed to start");
                }
            }
            ControlCommand::RunFinally(shell) => self.finally.push(shell),
        }
    }

    /// Ends dispatch: hands back captured output, registered finally commands and the supervisor.
    pub fn finish(self) -> (Option<Value>, Vec<ShellCommand>, BackgroundSupervisor) {
        (self.output, self.finally, self.background)
    }
}

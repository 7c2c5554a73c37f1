use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::EvaluatorConfig;
use crate::error::EvaluationError;

use super::response::{classify_response, parse_response};

type Reply = Result<Option<Value>, EvaluationError>;

struct EvaluatorRequest {
    command: String,
    environment: Option<Value>,
    respond: oneshot::Sender<Reply>,
}

/// Cloneable submission side of the evaluator queue.
#[derive(Clone, Debug)]
pub struct EvaluatorHandle {
    tx: mpsc::Sender<EvaluatorRequest>,
}

impl EvaluatorHandle {
    pub async fn eval(&self, command: impl Into<String>) -> Reply {
        self.eval_with_environment(command, None).await
    }

    /// Evaluates `command` with `environment` bound as `__environment` for this request only.
    pub async fn eval_with_environment(
        &self,
        command: impl Into<String>,
        environment: Option<Value>,
    ) -> Reply {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(EvaluatorRequest {
                command: command.into(),
                environment,
                respond,
            })
            .await
            .map_err(|_| EvaluationError::QueueClosed)?;
        rx.await.map_err(|_| EvaluationError::QueueClosed)?
    }

    /// Resolves once the driver has stopped serving requests.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Owns the evaluator process (when spawned) and the consumer loop.
pub struct EvaluatorDriver {
    handle: EvaluatorHandle,
    consumer: JoinHandle<()>,
    child: Option<Child>,
}

impl EvaluatorDriver {
    /// Spawns the configured evaluator and waits until it is ready for commands.
    #[tracing::instrument(name = "evaluator.spawn", skip(cfg), fields(program = %cfg.program))]
    pub async fn spawn(cfg: &EvaluatorConfig) -> Result<Self, EvaluationError> {
        let mut child = Command::new(&cfg.program)
            .args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EvaluationError::Startup(format!("{}: {e}", cfg.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EvaluationError::Startup("no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvaluationError::Startup("no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EvaluationError::Startup("no stderr".into()))?;

        let mut driver = Self::start(stdin, stdout, stderr, cfg).await?;
        driver.child = Some(child);
        Ok(driver)
    }

    /// Drives an evaluator over arbitrary streams.
    pub async fn start<W, R, E>(
        stdin: W,
        stdout: R,
        stderr: E,
        cfg: &EvaluatorConfig,
    ) -> Result<Self, EvaluationError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let mut diagnostics = spawn_diagnostics_reader(stderr);

        if !cfg.startup_marker.is_empty() {
            let wait = wait_for_marker(&mut diagnostics, &cfg.startup_marker);
            tokio::time::timeout(Duration::from_millis(cfg.startup_timeout_ms), wait)
                .await
                .map_err(|_| {
                    EvaluationError::Startup(format!(
                        "no '{}' within {}ms",
                        cfg.startup_marker, cfg.startup_timeout_ms
                    ))
                })??;
        }
        tracing::debug!(target: "nixtask.flow", stage = "evaluator.ready");

        let (tx, rx) = mpsc::channel(cfg.request_queue_capacity.max(1));
        let session = Session {
            stdin,
            stdout,
            diagnostics,
        };
        let consumer = tokio::spawn(session.serve(rx));

        Ok(Self {
            handle: EvaluatorHandle { tx },
            consumer,
            child: None,
        })
    }

    pub fn handle(&self) -> EvaluatorHandle {
        self.handle.clone()
    }

    /// Stops the consumer loop and terminates the process.
    pub async fn shutdown(mut self) {
        self.consumer.abort();
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

impl Drop for EvaluatorDriver {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

fn spawn_diagnostics_reader<E>(mut stderr: E) -> mpsc::UnboundedReceiver<String>
where
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

async fn wait_for_marker(
    diagnostics: &mut mpsc::UnboundedReceiver<String>,
    marker: &str,
) -> Result<(), EvaluationError> {
    let mut seen = String::new();
    while let Some(chunk) = diagnostics.recv().await {
        seen.push_str(&chunk);
        if seen.contains(marker) {
            return Ok(());
        }
    }
    Err(EvaluationError::Startup(format!(
        "evaluator exited before becoming ready: {}",
        seen.trim()
    )))
}

struct Session<W, R> {
    stdin: W,
    stdout: R,
    diagnostics: mpsc::UnboundedReceiver<String>,
}

impl<W, R> Session<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn serve(mut self, mut rx: mpsc::Receiver<EvaluatorRequest>) {
        let mut idle = vec![0u8; 4 * 1024];
        loop {
            tokio::select! {
                req = rx.recv() => {
                    let Some(req) = req else { break };
                    let reply = self.handle(&req.command, req.environment.as_ref()).await;
                    let dead = matches!(reply, Err(EvaluationError::ProcessExited));
                    let _ = req.respond.send(reply);
                    if dead {
                        break;
                    }
                }
                read = self.stdout.read(&mut idle) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => tracing::trace!(
                            target: "nixtask.flow",
                            stage = "evaluator.unsolicited",
                            bytes = n
                        ),
                    }
                }
            }
        }

        tracing::error!(error.kind = "evaluator.exited", "evaluator process is gone");
        rx.close();
        while let Ok(req) = rx.try_recv() {
            let _ = req.respond.send(Err(EvaluationError::ProcessExited));
        }
    }

    async fn handle(&mut self, command: &str, environment: Option<&Value>) -> Reply {
        while self.diagnostics.try_recv().is_ok() {}

        let line = format!("{}\n", scope_command(command, environment).replace('\n', " "));
        tracing::debug!(target: "nixtask.flow", stage = "evaluator.request", command = %audit_preview(command));

        if self.stdin.write_all(line.as_bytes()).await.is_err() || self.stdin.flush().await.is_err()
        {
            return Err(EvaluationError::ProcessExited);
        }

        let mut response = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match self.stdout.read(&mut buf).await {
                Ok(0) => return Err(EvaluationError::ProcessExited),
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error.kind = "evaluator.read", error.message = %e);
                    return Err(EvaluationError::ProcessExited);
                }
            };
            response.extend_from_slice(&buf[..n]);
            if buf[n - 1] == b'\n' {
                break;
            }
        }

        tokio::task::yield_now().await;
        let mut diagnostics = String::new();
        while let Ok(chunk) = self.diagnostics.try_recv() {
            diagnostics.push_str(&chunk);
        }

        classify_response(parse_response(&String::from_utf8_lossy(&response)), &diagnostics)
    }
}

/// Binds the per-request environment for expressions. Evaluator directives (`:l`, `:lf`) pass through.
fn scope_command(command: &str, environment: Option<&Value>) -> String {
    match environment {
        Some(env) if !command.trim_start().starts_with(':') => format!(
            "let __environment = builtins.fromJSON {}; in ({command})",
            nix_string(&env.to_string())
        ),
        _ => command.to_string(),
    }
}

/// Quotes `s` as a Nix string literal.
pub(crate) fn nix_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn audit_preview(s: &str) -> String {
    const MAX: usize = 160;
    if s.len() <= MAX {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < MAX)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let mut out = s[..end].to_string();
    out.push('…');
    out
}

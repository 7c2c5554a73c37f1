use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RunnerError;

use super::console::Console;
use super::control::ShellCommand;
use super::io_pump::{pump_lines, LineStream, LineTap};
use super::process;

/// Where and how commands issued over the control channel are run.
#[derive(Debug, Clone)]
pub struct ShellContext {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub console: Console,
}

impl ShellContext {
    fn command(&self, shell: &ShellCommand) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["--noprofile", "--norc", "-c", &shell.command])
            .env_clear()
            .envs(shell.env.as_ref().unwrap_or(&self.env))
            .current_dir(shell.cwd.as_ref().unwrap_or(&self.cwd))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Relays a child's output to the console, prefixed.
    fn relay(&self, child: &mut Child) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<LineTap>(256);
        let pumps: Vec<_> = [
            child
                .stdout
                .take()
                .map(|s| pump_lines(s, LineStream::Stdout, tx.clone())),
            child
                .stderr
                .take()
                .map(|s| pump_lines(s, LineStream::Stderr, tx.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(tx);

        let console = self.console.clone();
        tokio::spawn(async move {
            while let Some(tap) = rx.recv().await {
                console.relay(&tap);
            }
            for pump in pumps {
                let _ = pump.await;
            }
        })
    }
}

struct BackgroundChild {
    command: String,
    child: Child,
    pgid: Option<u32>,
    relay: JoinHandle<()>,
}

/// Owns every background command a task started. Nothing outlives it.
pub struct BackgroundSupervisor {
    ctx: ShellContext,
    grace: Duration,
    children: Vec<BackgroundChild>,
}

impl BackgroundSupervisor {
    pub fn new(ctx: ShellContext, grace: Duration) -> Self {
        Self {
            ctx,
            grace,
            children: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn spawn(&mut self, shell: &ShellCommand) -> Result<(), RunnerError> {
        self.ctx.console.command(&shell.command);

        let mut cmd = self.ctx.command(shell);
        process::new_process_group(&mut cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", shell.command)))?;
        let pgid = child.id();
        let relay = self.ctx.relay(&mut child);

        tracing::debug!(command = %shell.command, pid = ?pgid, "background command started");
        self.children.push(BackgroundChild {
            command: shell.command.clone(),
            child,
            pgid,
            relay,
        });
        Ok(())
    }

    /// SIGTERM to every process group, SIGKILL to whatever is left after the grace period.
    pub async fn terminate_all(&mut self) {
        if self.children.is_empty() {
            return;
        }
        for bg in &self.children {
            if let Some(pgid) = bg.pgid {
                process::signal_group(pgid, process::GroupSignal::Term);
            }
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        for mut bg in self.children.drain(..) {
            match tokio::time::timeout_at(deadline, bg.child.wait()).await {
                Ok(status) => {
                    tracing::debug!(command = %bg.command, status = ?status.ok(), "background command stopped")
                }
                Err(_) => {
                    tracing::warn!(command = %bg.command, "background command ignored SIGTERM, killing");
                    if let Some(pgid) = bg.pgid {
                        process::signal_group(pgid, process::GroupSignal::Kill);
                    }
                    let _ = bg.child.kill().await;
                }
            }
            // Descendants may keep the pipes open; the relay does not block teardown.
            bg.relay.abort();
        }
    }
}

impl Drop for BackgroundSupervisor {
    fn drop(&mut self) {
        for bg in &mut self.children {
            if let Some(pgid) = bg.pgid {
                process::signal_group(pgid, process::GroupSignal::Kill);
            }
            let _ = bg.child.start_kill();
            bg.relay.abort();
        }
    }
}

/// Runs registered finally commands one after another, each to completion.
///
/// Output still open `grace` after a command exits (a leftover descendant) is abandoned.
pub async fn run_finally(commands: &[ShellCommand], ctx: &ShellContext, grace: Duration) {
    for shell in commands {
        ctx.console.command(&shell.command);
        let mut child = match ctx.command(shell).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command = %shell.command, error = %e, "finally command failed to start");
                continue;
            }
        };
        let mut relay = ctx.relay(&mut child);
        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!(command = %shell.command, code = ?status.code(), "finally command failed")
            }
            Err(e) => tracing::warn!(command = %shell.command, error = %e, "finally command wait failed"),
        }
        if tokio::time::timeout(grace, &mut relay).await.is_err() {
            tracing::debug!(command = %shell.command, "finally command output still open, detaching");
            relay.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn ctx(dir: &std::path::Path) -> ShellContext {
        ShellContext {
            shell: "bash".into(),
            cwd: dir.to_path_buf(),
            env: BTreeMap::from([("MARK".to_string(), "from-task".to_string())]),
            console: Console::new(),
        }
    }

    #[tokio::test]
    async fn terminates_long_running_commands_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = BackgroundSupervisor::new(ctx(dir.path()), Duration::from_millis(500));
        sup.spawn(&ShellCommand {
            command: "trap '' TERM; sleep 30".into(),
            ..Default::default()
        })
        .unwrap();
        sup.spawn(&ShellCommand {
            command: "sleep 30".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(sup.len(), 2);

        let started = Instant::now();
        sup.terminate_all().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sup.is_empty());
    }

    #[tokio::test]
    async fn finally_commands_run_in_order_with_fallback_env() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let cmds = vec![
            ShellCommand {
                command: format!("echo first-$MARK >> {}", log.display()),
                ..Default::default()
            },
            ShellCommand {
                command: format!("sleep 0.1; echo second-$OTHER >> {}", log.display()),
                env: Some(BTreeMap::from([("OTHER".to_string(), "x".to_string())])),
                ..Default::default()
            },
        ];

        run_finally(&cmds, &ctx(dir.path()), Duration::from_secs(2)).await;

        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written, "first-from-task\nsecond-x\n");
    }

    #[tokio::test]
    async fn finally_does_not_wait_on_descendants_holding_output_open() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let cmds = vec![
            ShellCommand {
                command: "sleep 5 & echo started".into(),
                ..Default::default()
            },
            ShellCommand {
                command: format!("echo next >> {}", log.display()),
                ..Default::default()
            },
        ];

        let started = Instant::now();
        run_finally(&cmds, &ctx(dir.path()), Duration::from_millis(200)).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "next\n");
    }
}

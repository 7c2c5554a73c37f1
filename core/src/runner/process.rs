//! OS-level process plumbing: the control pipe on fd 4 and process-group signalling.
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::RunnerError;

/// Descriptor number the task sees its control channel on.
pub const CONTROL_FD: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Term,
    Kill,
}

/// How the task's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// stdout/stderr piped to the aggregator, stdin closed.
    Piped,
    /// stdout/stderr inherited; stdin inherited only when interactive.
    Inherit { interactive: bool },
}

#[derive(Debug)]
pub struct TaskSpawn<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub stdio: StdioMode,
}

pub struct SpawnedTask {
    pub child: Child,
    pub control: tokio::net::unix::pipe::Receiver,
}

/// Starts the task process with a fresh environment and its control pipe on [`CONTROL_FD`].
pub fn spawn_task(spec: &TaskSpawn<'_>) -> Result<SpawnedTask, RunnerError> {
    let (read_fd, write_fd) =
        pipe::cloexec_pipe().map_err(|e| RunnerError::Spawn(format!("control pipe: {e}")))?;

    let mut cmd = Command::new(spec.program);
    cmd.args(spec.args)
        .env_clear()
        .envs(spec.env)
        .current_dir(spec.cwd)
        .kill_on_drop(true);

    match spec.stdio {
        StdioMode::Piped => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        StdioMode::Inherit { interactive } => {
            cmd.stdin(if interactive {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        }
    }

    pipe::install_control_fd(&mut cmd, &write_fd);

    let child = cmd
        .spawn()
        .map_err(|e| RunnerError::Spawn(format!("{}: {e}", spec.program)))?;
    // Only the child may hold the write end, so EOF follows its exit.
    drop(write_fd);

    let control = tokio::net::unix::pipe::Receiver::from_file(std::fs::File::from(read_fd))
        .map_err(|e| RunnerError::Spawn(format!("control pipe: {e}")))?;

    Ok(SpawnedTask { child, control })
}

/// Puts the command in its own process group so the whole tree can be signalled.
pub fn new_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub fn signal_group(pgid: u32, signal: GroupSignal) {
    let sig = match signal {
        GroupSignal::Term => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions; a stale group only yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, sig) };
    if rc != 0 {
        tracing::trace!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

mod pipe {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use tokio::process::Command;

    use super::CONTROL_FD;

    pub(super) fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        // SAFETY: `fds` is a valid two-element buffer.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        // SAFETY: `fds` is a valid two-element buffer; flags are set right after creation.
        let rc = unsafe {
            let rc = libc::pipe(fds.as_mut_ptr());
            if rc == 0 {
                libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
                libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
            }
            rc
        };

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    /// Duplicates the write end onto the control descriptor in the child.
    pub(super) fn install_control_fd(cmd: &mut Command, write_fd: &OwnedFd) {
        let raw = write_fd.as_raw_fd();
        // SAFETY: only async-signal-safe calls (dup2, fcntl) run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if raw == CONTROL_FD {
                    let flags = libc::fcntl(raw, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(raw, CONTROL_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn child_writes_to_control_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);
        let args = vec!["-c".to_string(), "echo \"$GREETING\" >&4".to_string()];
        let mut spawned = spawn_task(&TaskSpawn {
            program: "bash",
            args: &args,
            cwd: dir.path(),
            env: &env,
            stdio: StdioMode::Inherit { interactive: false },
        })
        .unwrap();

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());

        let mut received = String::new();
        spawned.control.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "hi\n");
    }
}

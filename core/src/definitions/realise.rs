use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::RunnerError;
use crate::runner::{pump_lines, LineStream, LineTap};

fn store_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/nix/store/[a-z0-9]{32}-[\w.-]+$").expect("valid store path regex")
    })
}

const GC_WARNING_SUFFIX: &str = "the result might be removed by the garbage collector";

/// `nix-store` echoes every realised path; those lines are noise.
pub fn is_store_path_line(line: &str) -> bool {
    store_path_re().is_match(line)
}

pub fn is_gc_warning(line: &str) -> bool {
    line.ends_with(GC_WARNING_SUFFIX)
}

/// Materialises `paths` with `<program> --realise`. Nothing to do for an empty list.
#[tracing::instrument(name = "definitions.realise", skip(paths), fields(count = paths.len()))]
pub async fn realise_store_paths(program: &str, paths: &[String]) -> Result<(), RunnerError> {
    if paths.is_empty() {
        return Ok(());
    }
    let started = std::time::Instant::now();

    let mut child = Command::new(program)
        .arg("--realise")
        .args(paths)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RunnerError::Spawn(format!("{program}: {e}")))?;

    let (tx, mut rx) = mpsc::channel::<LineTap>(256);
    let mut pumps = Vec::new();
    if let Some(out) = child.stdout.take() {
        pumps.push(pump_lines(out, LineStream::Stdout, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(pump_lines(err, LineStream::Stderr, tx.clone()));
    }
    drop(tx);

    while let Some(tap) = rx.recv().await {
        match tap.stream {
            LineStream::Stdout if !is_store_path_line(&tap.line) => println!("{}", tap.line),
            LineStream::Stderr if !is_gc_warning(&tap.line) => eprintln!("{}", tap.line),
            _ => {}
        }
    }
    for pump in pumps {
        if let Ok(Err(e)) = pump.await {
            tracing::warn!(error = %e, "realise output stream failed");
        }
    }

    let status = child.wait().await.map_err(|e| RunnerError::StreamIo {
        stream: "realise",
        source: e,
    })?;
    tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "store paths realised");
    if !status.success() {
        return Err(RunnerError::ExitStatus {
            code: status.code(),
        });
    }
    Ok(())
}

//! Human-facing console output: task headers, aggregated sections and relayed lines.
//!
//! This is not logging. Output goes to stdout/stderr unless other writers are supplied.
use std::io::Write;
use std::sync::{Arc, Mutex};

use crossterm::style::{Color, Stylize};

use super::io_pump::{LineStream, LineTap};

/// Which header to print when a node starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Run,
    FetchOutput,
}

type Writer = Box<dyn Write + Send>;

struct ConsoleState {
    /// Task that printed last; repeated sections from it skip the header.
    last_logged: Option<String>,
    out: Writer,
    err: Writer,
}

/// Shared console. Clones write to the same streams under one lock.
#[derive(Clone)]
pub struct Console {
    state: Arc<Mutex<ConsoleState>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("last_logged", &self.lock().last_logged)
            .finish_non_exhaustive()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::with_writers(std::io::stdout(), std::io::stderr())
    }
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// A console printing to the given streams instead of stdout/stderr.
    pub fn with_writers(
        out: impl Write + Send + 'static,
        err: impl Write + Send + 'static,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsoleState {
                last_logged: None,
                out: Box::new(out),
                err: Box::new(err),
            })),
        }
    }

    pub fn task_header(&self, task_id: &str, pretty_ref: &str, kind: HeaderKind, dry_run: bool) {
        let mut state = self.lock();
        let (label, color) = match kind {
            HeaderKind::Run => ("Running", Color::Yellow),
            HeaderKind::FetchOutput => ("Get output", Color::Grey),
        };
        let mut prefix = format!(" {label} {pretty_ref} ");
        let mut styled = prefix.clone();
        if dry_run && kind == HeaderKind::Run {
            prefix.push_str("(dry run) ");
            styled.push_str(&format!("{} ", "(dry run)".yellow().bold()));
        }

        let out = &mut state.out;
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", rule(&prefix, &styled, color));
        let _ = writeln!(out);
        let _ = out.flush();
        state.last_logged = Some(task_id.to_string());
    }

    /// Prints one aggregated batch of lines from a task.
    pub fn flush_section(&self, task_id: &str, pretty_ref: &str, lines: &[LineTap]) {
        if lines.is_empty() {
            return;
        }
        let mut state = self.lock();
        let state = &mut *state;

        if state.last_logged.as_deref() != Some(task_id) {
            let prefix = format!(" {pretty_ref} ");
            let _ = writeln!(state.out);
            let _ = writeln!(state.out, "{}", rule(&prefix, &prefix, Color::Grey));
            let _ = writeln!(state.out);
            state.last_logged = Some(task_id.to_string());
        }

        for tap in lines {
            let _ = match tap.stream {
                LineStream::Stdout => writeln!(state.out, "{}", tap.line),
                LineStream::Stderr => writeln!(state.err, "{}", tap.line),
            };
        }
        let _ = state.out.flush();
        let _ = state.err.flush();
    }

    /// A line from a background or finally command.
    pub fn relay(&self, tap: &LineTap) {
        match tap.stream {
            LineStream::Stdout => self.print(format!("& {}", tap.line).grey()),
            LineStream::Stderr => self.eprint(format!("& {}", tap.line).red()),
        }
    }

    /// Echo of a command about to run on the task's behalf.
    pub fn command(&self, command: &str) {
        self.print(format!("& {command}").grey());
    }

    pub fn note(&self, message: &str) {
        self.print(message.grey());
    }

    pub fn warning(&self, message: &str) {
        self.print(message.yellow().bold());
    }

    pub fn failure(&self, message: &str) {
        self.eprint(message.red());
    }

    pub fn summary_success(&self, elapsed_secs: f64) {
        self.print(format!(
            "\n{} {}\n   Done in {elapsed_secs:.2}s\n",
            "──".green(),
            "Success".green().bold()
        ));
    }

    pub fn summary_failed(&self) {
        self.print(format!("\n{} {}\n", "──".red(), "Failed".red().bold()));
    }

    pub fn summary_no_tasks(&self) {
        self.print(format!("{} {}\n", "──".grey(), "No tasks to run".grey().bold()));
    }

    fn print(&self, text: impl std::fmt::Display) {
        let mut state = self.lock();
        let _ = writeln!(state.out, "{text}");
        let _ = state.out.flush();
    }

    fn eprint(&self, text: impl std::fmt::Display) {
        let mut state = self.lock();
        let _ = writeln!(state.err, "{text}");
        let _ = state.err.flush();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn last_logged(&self) -> Option<String> {
        self.lock().last_logged.clone()
    }
}

/// `── <prefix> ────…` filling the terminal width.
fn rule(plain_prefix: &str, styled_prefix: &str, color: Color) -> String {
    let width = crossterm::terminal::size()
        .map(|(w, _)| w as usize)
        .unwrap_or(80);
    let fill = width.saturating_sub(2 + plain_prefix.chars().count());
    format!(
        "{}{}{}",
        "──".with(color),
        styled_prefix,
        "─".repeat(fill).with(color)
    )
}

/// In-memory writer for inspecting console output.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct Captured(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Captured {
    pub(crate) fn console() -> (Console, Captured) {
        let captured = Captured::default();
        (Console::with_writers(captured.clone(), captured.clone()), captured)
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

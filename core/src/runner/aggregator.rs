use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::console::Console;
use super::io_pump::{pump_lines, LineStream, LineTap};

/// Identity printed in section headers.
#[derive(Debug, Clone)]
pub struct SectionLabel {
    pub task_id: String,
    pub pretty_ref: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorOptions {
    pub flush_interval: Duration,
    pub channel_capacity: usize,
}

/// Buffers a concurrently running task's stdout/stderr and prints it in sections.
///
/// Two reader tasks feed one channel; a single consumer decides when to flush.
/// The first line of a new batch is printed right away unless a flush happened
/// within the last window, otherwise the buffer waits for the next tick.
pub fn spawn_aggregator<O, E>(
    stdout: O,
    stderr: E,
    label: SectionLabel,
    console: Console,
    opts: AggregatorOptions,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::channel::<LineTap>(opts.channel_capacity.max(1));
    let out_task = pump_lines(stdout, LineStream::Stdout, line_tx.clone());
    let err_task = pump_lines(stderr, LineStream::Stderr, line_tx);

    tokio::spawn(async move {
        aggregate(line_rx, &label, &console, opts.flush_interval).await;

        for (name, task) in [("stdout", out_task), ("stderr", err_task)] {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(task_id = %label.task_id, stream = name, error = %e, "output stream failed"),
                Err(e) => tracing::warn!(task_id = %label.task_id, stream = name, error = %e, "output pump panicked"),
            }
        }
    })
}

async fn aggregate(
    mut line_rx: mpsc::Receiver<LineTap>,
    label: &SectionLabel,
    console: &Console,
    window: Duration,
) {
    let mut buffer: Vec<LineTap> = Vec::new();
    let mut last_flush: Option<Instant> = None;
    let mut tick = tokio::time::interval(window);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let flush = |buffer: &mut Vec<LineTap>, last_flush: &mut Option<Instant>| {
        console.flush_section(&label.task_id, &label.pretty_ref, buffer);
        buffer.clear();
        *last_flush = Some(Instant::now());
    };

    loop {
        tokio::select! {
            tap = line_rx.recv() => {
                let Some(tap) = tap else { break };
                let new_batch = buffer.is_empty();
                buffer.push(tap);
                if new_batch && last_flush.map_or(true, |t| t.elapsed() >= window) {
                    flush(&mut buffer, &mut last_flush);
                }
            }
            _ = tick.tick() => {
                if !buffer.is_empty() {
                    flush(&mut buffer, &mut last_flush);
                }
            }
        }
    }

    flush(&mut buffer, &mut last_flush);
}

use std::time::Duration;

use serde_json::Value;

/// How a run ended, short of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every planned node completed.
    Completed {
        /// Number of nodes executed
        nodes: usize,
        elapsed: Duration,
    },

    /// The selection planned zero nodes.
    NoTasks,

    /// `--graph`: the rendered plan, nothing executed.
    Graph(Value),
}

impl RunOutcome {
    /// Process exit code for this outcome. Failures exit with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed { .. } | RunOutcome::Graph(_) => 0,
            RunOutcome::NoTasks => 127,
        }
    }
}

/// Result of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

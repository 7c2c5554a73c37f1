use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{watch, Semaphore};

use crate::error::ExecutorError;

use super::plan::{ExecutionPlan, NodeId};

/// Runs an [`ExecutionPlan`] with at most `concurrency` nodes in flight.
///
/// A node starts once every one of its planned predecessors has finished; nodes
/// in later batches may start before an earlier batch fully drains. The first
/// failure is returned and everything still pending is dropped.
pub struct ExecutionQueue {
    concurrency: usize,
}

impl ExecutionQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Execute all nodes of `plan`, calling `execute` once per node.
    ///
    /// # Returns
    ///
    /// Number of nodes completed.
    pub async fn run<F, Fut>(&self, plan: &ExecutionPlan, execute: F) -> Result<usize, ExecutorError>
    where
        F: Fn(NodeId) -> Fut,
        Fut: Future<Output = Result<(), ExecutorError>>,
    {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let (done_tx, done_rx) = watch::channel(HashSet::<NodeId>::new());
        let planned: HashSet<&NodeId> = plan.nodes().collect();

        let mut futs = FuturesUnordered::new();

        for node in plan.nodes() {
            let waits_for: Vec<NodeId> = plan
                .predecessors(node)
                .iter()
                .filter(|p| planned.contains(p))
                .cloned()
                .collect();
            let sem = sem.clone();
            let mut done_rx = done_rx.clone();
            let done_tx = &done_tx;
            let execute = &execute;
            let node = node.clone();

            futs.push(async move {
                if !waits_for.is_empty() {
                    done_rx
                        .wait_for(|done| waits_for.iter().all(|p| done.contains(p)))
                        .await
                        .map_err(|_| ExecutorError::Scheduler("completion channel closed".into()))?;
                }

                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutorError::Scheduler("semaphore closed unexpectedly".into()))?;

                tracing::debug!(target: "nixtask.flow", stage = "node.start", node = %node);
                execute(node.clone()).await?;
                tracing::debug!(target: "nixtask.flow", stage = "node.end", node = %node);

                done_tx.send_modify(|done| {
                    done.insert(node);
                });
                Ok::<(), ExecutorError>(())
            });
        }

        let mut completed = 0;
        while let Some(res) = futs.next().await {
            res?;
            completed += 1;
        }

        Ok(completed)
    }
}

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ExecConfig;
use crate::exec::shell::{CommandStatus, ShellExecutor};
use crate::store::JobStore;

/// One unit of work: a rendered command and the row it came from.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub rowid: i64,
    pub command: String,
}

/// Aggregate result of one [`ExecutionEngine::execute`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub succeeded: u32,
    pub failed: u32,
}

/// Bounded-parallelism subprocess supervisor.
///
/// Runs dispatched commands with at most `parallelism` children alive at
/// once and records every terminal outcome through the store. Shared
/// state (store handle, semaphore, counters) lives on the instance; no
/// process-wide globals.
pub struct ExecutionEngine {
    store: Arc<JobStore>,
    executor: ShellExecutor,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<JobStore>, config: &ExecConfig) -> Self {
        Self {
            store,
            executor: ShellExecutor::new(config),
            semaphore: Arc::new(Semaphore::new(config.parallelism.max(1))),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Execute every dispatch, then return the tally.
    ///
    /// Commands still queued when `cancel` fires are never started and
    /// keep their stored state untouched; in-flight commands are
    /// interrupted and recorded as failed attempts. The call returns
    /// only after every started command has reached a terminal state and
    /// been persisted.
    pub async fn execute(&self, batch: Vec<Dispatch>, cancel: CancellationToken) -> Tally {
        let started = Instant::now();
        let total = batch.len() as u32;
        let succeeded = Arc::new(AtomicU32::new(0));
        let failed = Arc::new(AtomicU32::new(0));

        let mut workers = JoinSet::new();
        for dispatch in batch {
            let store = Arc::clone(&self.store);
            let executor = self.executor.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let running = Arc::clone(&self.running);
            let peak = Arc::clone(&self.peak);
            let succeeded = Arc::clone(&succeeded);
            let failed = Arc::clone(&failed);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        // The semaphore is never closed.
                        Err(_) => return,
                    },
                };
                // The signal may have fired while we waited for a slot;
                // a command that never started stays implicitly pending.
                if cancel.is_cancelled() {
                    return;
                }

                let active = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(active, Ordering::SeqCst);
                let result = executor.run(&dispatch.command, &cancel).await;
                running.fetch_sub(1, Ordering::SeqCst);

                let ok = result.status == CommandStatus::Succeeded;
                if let Err(err) = store.update_outcome(
                    dispatch.rowid,
                    ok,
                    &result.stdout,
                    &result.stderr,
                    Utc::now(),
                ) {
                    tracing::warn!(
                        rowid = dispatch.rowid,
                        error = %err,
                        "Failed to persist command outcome"
                    );
                }
                if ok {
                    succeeded.fetch_add(1, Ordering::SeqCst);
                } else {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        while workers.join_next().await.is_some() {}

        let tally = Tally {
            succeeded: succeeded.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
        };
        tracing::info!(
            total,
            succeeded = tally.succeeded,
            failed = tally.failed,
            skipped = total - tally.succeeded - tally.failed,
            elapsed = ?started.elapsed(),
            "Batch finished"
        );
        tally
    }

    /// High-water mark of simultaneously running subprocesses.
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

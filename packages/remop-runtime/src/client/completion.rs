//! Completion loop for callback-style invocations.
//!
//! Outcomes of callback-style invocations are queued to a
//! [`BackgroundWorker`](crate::service::BackgroundWorker) running a
//! [`CompletionRunner`], so user callbacks never run on the session's read
//! path. Each tick the runner also expires invocations past their deadline.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use remop_core::InvokeId;
use tokio::sync::mpsc;

use super::error::InvokeError;
use super::outstanding::{OutstandingInvocations, RawCallback, RawOutcome, Waiter};
use crate::service::BackgroundRunnable;

/// A finished callback-style invocation waiting for its callback to run.
pub struct Completion {
    pub invoke_id: InvokeId,
    pub callback: RawCallback,
    pub outcome: RawOutcome,
}

/// Hands `outcome` to whoever is waiting on `waiter`.
///
/// Blocking callers are answered directly. Callbacks go through the
/// completion queue when there is one, and run inline otherwise.
pub fn resolve(
    invoke_id: InvokeId,
    waiter: Waiter,
    outcome: RawOutcome,
    completions: Option<&mpsc::Sender<Completion>>,
) {
    match waiter {
        Waiter::Blocking(tx) => {
            // The caller may have given up (timeout or cancellation).
            let _ = tx.send(outcome);
        }
        Waiter::Callback(callback) => {
            let task = Completion {
                invoke_id,
                callback,
                outcome,
            };
            let Some(queue) = completions else {
                run_callback(task);
                return;
            };
            match queue.try_send(task) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(task)) => {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        if let Err(mpsc::error::SendError(task)) = queue.send(task).await {
                            run_callback(task);
                        }
                    });
                }
                Err(mpsc::error::TrySendError::Closed(task)) => run_callback(task),
            }
        }
    }
}

fn run_callback(task: Completion) {
    let Completion {
        invoke_id,
        callback,
        outcome,
    } = task;
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        tracing::error!(invoke_id = %invoke_id, "completion callback panicked");
    }
}

/// Runs callbacks and sweeps expired invocations.
pub struct CompletionRunner {
    outstanding: Arc<OutstandingInvocations>,
}

impl CompletionRunner {
    #[must_use]
    pub fn new(outstanding: Arc<OutstandingInvocations>) -> Self {
        Self { outstanding }
    }
}

#[async_trait]
impl BackgroundRunnable for CompletionRunner {
    type Task = Completion;

    fn label(&self) -> &'static str {
        "completions"
    }

    async fn run(&mut self, task: Completion) {
        run_callback(task);
    }

    async fn on_tick(&mut self) {
        for (invoke_id, pending) in self.outstanding.expire(Instant::now()) {
            let after = pending
                .deadline
                .map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(pending.issued_at));
            tracing::debug!(invoke_id = %invoke_id, operation = pending.name, ?after, "invocation expired");
            metrics::counter!("remop_invocation_timeouts_total", "operation" => pending.name)
                .increment(1);
            resolve(
                invoke_id,
                pending.waiter,
                Err(InvokeError::Timeout { invoke_id, after }),
                None,
            );
        }
    }

    async fn shutdown(&mut self) {
        if !self.outstanding.is_empty() {
            tracing::debug!(
                outstanding = self.outstanding.len(),
                "completion worker stopped with invocations outstanding"
            );
        }
    }
}

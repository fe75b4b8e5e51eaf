//! Queue-plus-timer background task.
//!
//! A [`BackgroundWorker`] owns one spawned task fed by a bounded queue and
//! woken by a periodic tick. The invoker's completion loop is built on it:
//! queued tasks are finished invocations whose callbacks must run, and each
//! tick expires invocations past their deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument as _;

/// Work executed on a [`BackgroundWorker`] task.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Label used in the worker's tracing span.
    fn label(&self) -> &'static str;

    async fn run(&mut self, task: Self::Task);

    /// Runs once per tick.
    async fn on_tick(&mut self) {}

    /// Runs once after the queue has been drained on stop.
    async fn shutdown(&mut self) {}
}

/// Default queue depth.
const QUEUE_CAPACITY: usize = 256;

pub struct BackgroundWorker<R: BackgroundRunnable> {
    queue: Option<mpsc::Sender<R::Task>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker; `on_tick` fires every `tick`.
    pub fn start(runnable: R, tick: Duration) -> Self {
        Self::with_capacity(runnable, tick, QUEUE_CAPACITY)
    }

    pub fn with_capacity(runnable: R, tick: Duration, capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stopped) = watch::channel(false);
        let span = tracing::debug_span!("worker", label = runnable.label());
        let task = tokio::spawn(
            drive(runnable, rx, tick.max(Duration::from_millis(1)), stopped).instrument(span),
        );
        Self {
            queue: Some(queue),
            stop_tx,
            task: Some(task),
        }
    }

    /// A queue handle usable from other tasks. `None` once stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.queue.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the worker after it has run every task already queued.
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        self.queue = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background worker ended abnormally");
            }
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut rx: mpsc::Receiver<R::Task>,
    tick: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            task = rx.recv() => match task {
                Some(task) => runnable.run(task).await,
                None => break,
            },
            _ = ticker.tick() => runnable.on_tick().await,
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Ok(task) = rx.try_recv() {
        runnable.run(task).await;
        drained += 1;
    }
    runnable.shutdown().await;
    tracing::debug!(drained, "background worker stopped");
}

//! Performer release: stop taking invocations, let the running ones finish.
//!
//! The state lives in an `ArcSwap` so every dispatcher reads it without
//! locking. Each performed invocation holds an [`InFlightGuard`] counted per
//! operation; the last guard to drop wakes whoever waits for the drain.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use remop_core::OperationCode;
use tokio::sync::Notify;

/// Starting -> Ready -> Releasing -> Released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformerState {
    Starting,
    /// Invocations are performed.
    Ready,
    /// New invocations are refused while running ones finish.
    Releasing,
    /// Nothing left in flight.
    Released,
}

#[derive(Debug, Default)]
struct InFlight {
    by_operation: DashMap<OperationCode, u64>,
    idle: Notify,
}

impl InFlight {
    fn total(&self) -> u64 {
        self.by_operation.iter().map(|e| *e.value()).sum()
    }
}

/// Shared release state of one performer.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<PerformerState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(PerformerState::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(PerformerState::Ready));
    }

    #[must_use]
    pub fn state(&self) -> PerformerState {
        **self.state.load()
    }

    #[must_use]
    pub fn accepts_invocations(&self) -> bool {
        self.state() == PerformerState::Ready
    }

    /// Moves to `Releasing`; dispatchers refuse new invocations from here on.
    pub fn begin_release(&self) {
        let previous = self.state.swap(Arc::new(PerformerState::Releasing));
        tracing::info!(from = ?*previous, in_flight = self.in_flight_count(), "performer releasing");
    }

    /// Counts one invocation of `operation` until the guard drops.
    #[must_use]
    pub fn track(&self, operation: OperationCode) -> InFlightGuard {
        *self.in_flight.by_operation.entry(operation).or_insert(0) += 1;
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            operation,
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.total()
    }

    /// Operations with invocations still running, and how many of each.
    #[must_use]
    pub fn in_flight_by_operation(&self) -> Vec<(OperationCode, u64)> {
        let mut running: Vec<_> = self
            .in_flight
            .by_operation
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        running.sort_unstable();
        running
    }

    /// Waits up to `timeout` for every tracked invocation to finish.
    ///
    /// On success the state becomes `Released` and `true` is returned;
    /// otherwise the state stays as it was.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        // No deadline when `timeout` runs past the end of the clock.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            // Registered before the check so a guard dropping in between
            // still wakes us.
            let idle = self.in_flight.idle.notified();
            if self.in_flight_count() == 0 {
                self.state.store(Arc::new(PerformerState::Released));
                return true;
            }
            let expired = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, idle).await.is_err(),
                None => {
                    idle.await;
                    false
                }
            };
            if expired && self.in_flight_count() != 0 {
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one running invocation. Dropping it, including during unwinding,
/// ends the count.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
    operation: OperationCode,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .by_operation
            .remove_if_mut(&self.operation, |_, count| {
                *count -= 1;
                *count == 0
            });
        if self.in_flight.by_operation.is_empty() {
            self.in_flight.idle.notify_waiters();
        }
    }
}

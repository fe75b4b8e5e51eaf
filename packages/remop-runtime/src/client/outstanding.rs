//! Outstanding invocations of one invoker session.
//!
//! Every invoke PDU sent gets an entry keyed by its invocation id until the
//! matching response arrives, the deadline passes, or the session ends. The
//! entry says how the outcome reaches the caller: a oneshot for blocking
//! calls, a boxed callback for callback-style calls.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use remop_core::{ErrorCode, InvokeId, OperationClass, OperationCode};
use tokio::sync::oneshot;

use super::error::InvokeError;

/// Undecoded outcome of an invocation.
pub type RawOutcome = Result<Vec<u8>, InvokeError>;

/// Callback receiving the outcome of a callback-style invocation.
pub type RawCallback = Box<dyn FnOnce(RawOutcome) + Send + Sync>;

/// How an outcome reaches the caller.
pub enum Waiter {
    Blocking(oneshot::Sender<RawOutcome>),
    Callback(RawCallback),
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Waiter::Blocking(_) => f.write_str("Blocking"),
            Waiter::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl Waiter {
    /// Blocking waiters are synchronous-class invocations, callbacks asynchronous.
    #[must_use]
    pub fn class(&self) -> OperationClass {
        match self {
            Waiter::Blocking(_) => OperationClass::Synchronous,
            Waiter::Callback(_) => OperationClass::Asynchronous,
        }
    }
}

/// One invocation awaiting its outcome.
#[derive(Debug)]
pub struct Pending {
    pub operation: OperationCode,
    pub name: &'static str,
    /// Errors the operation declares; anything else is unexpected.
    pub errors: &'static [ErrorCode],
    pub issued_at: Instant,
    /// `None` when the timeout is too large to represent.
    pub deadline: Option<Instant>,
    pub waiter: Waiter,
}

/// Concurrent map of outstanding invocations with id allocation.
#[derive(Debug)]
pub struct OutstandingInvocations {
    entries: DashMap<InvokeId, Pending>,
    next_id: AtomicU32,
    reserved: AtomicUsize,
    max_outstanding: usize,
}

impl OutstandingInvocations {
    /// Ids are allocated from 1 upwards, wrapping, skipping ids in use.
    #[must_use]
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU32::new(1),
            reserved: AtomicUsize::new(0),
            max_outstanding: max_outstanding.max(1),
        }
    }

    /// Records `pending` under `requested`, or under a freshly allocated id.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::Congested` when the session is at its limit and
    /// `InvokeError::DuplicateInvokeId` if `requested` is already outstanding.
    pub fn register(
        &self,
        requested: Option<InvokeId>,
        pending: Pending,
    ) -> Result<InvokeId, InvokeError> {
        if self.reserved.fetch_add(1, Ordering::AcqRel) >= self.max_outstanding {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            return Err(InvokeError::Congested {
                limit: self.max_outstanding,
            });
        }

        let result = match requested {
            Some(id) => self.insert_at(id, pending).map_err(|_| InvokeError::DuplicateInvokeId(id)),
            None => Ok(self.insert_next(pending)),
        };
        if result.is_err() {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    fn insert_at(&self, id: InvokeId, pending: Pending) -> Result<InvokeId, Pending> {
        match self.entries.entry(id) {
            dashmap::Entry::Occupied(_) => Err(pending),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(pending);
                Ok(id)
            }
        }
    }

    fn insert_next(&self, mut pending: Pending) -> InvokeId {
        // At most `max_outstanding` ids are taken, so a free one turns up
        // within that many steps.
        loop {
            let id = InvokeId(self.next_id.fetch_add(1, Ordering::Relaxed));
            match self.insert_at(id, pending) {
                Ok(id) => return id,
                Err(back) => pending = back,
            }
        }
    }

    /// Removes and returns the entry for `id`.
    pub fn take(&self, id: InvokeId) -> Option<Pending> {
        let (_, pending) = self.entries.remove(&id)?;
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Some(pending)
    }

    /// Removes the entry if it is the only one outstanding.
    pub fn take_sole(&self) -> Option<(InvokeId, Pending)> {
        if self.entries.len() != 1 {
            return None;
        }
        let id = self.entries.iter().next().map(|e| *e.key())?;
        self.take(id).map(|p| (id, p))
    }

    #[must_use]
    pub fn contains(&self, id: InvokeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Removes every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<(InvokeId, Pending)> {
        let overdue: Vec<InvokeId> = self
            .entries
            .iter()
            .filter(|e| e.value().deadline.is_some_and(|deadline| deadline <= now))
            .map(|e| *e.key())
            .collect();
        overdue
            .into_iter()
            .filter_map(|id| self.take(id).map(|p| (id, p)))
            .collect()
    }

    /// Removes every entry.
    pub fn drain(&self) -> Vec<(InvokeId, Pending)> {
        let ids: Vec<InvokeId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.take(id).map(|p| (id, p)))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.max_outstanding
    }
}

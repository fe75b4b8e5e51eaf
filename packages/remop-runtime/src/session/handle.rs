//! Session handles and the registry of live sessions.
//!
//! Each session owns a bounded outbound PDU channel drained by its driver
//! task. Performer sessions also track which invocation ids are currently
//! being performed, so duplicates can be rejected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use remop_core::{InvokeId, OperationCode, Pdu};
use tokio::sync::{mpsc, Notify};

use super::config::SessionConfig;

/// Unique identifier for a session, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the protocol this end of the session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Accepts invocations and performs them.
    Performer,
    /// Issues invocations and waits for outcomes.
    Invoker,
}

/// Item queued for the session's write side.
#[derive(Debug)]
pub enum Outbound {
    Pdu(Pdu),
    /// Flush what is queued before this, then end the session.
    Close(Option<String>),
}

/// Error returned when queueing on a session fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send timed out: session outbound queue stayed full")]
    Timeout,
    #[error("session closed")]
    Disconnected,
    #[error("session outbound queue full")]
    Full,
}

/// Handle to a single session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub role: SessionRole,
    /// Sender end of the bounded outbound channel.
    pub tx: mpsc::Sender<Outbound>,
    /// Remote address for TCP sessions.
    pub peer: Option<SocketAddr>,
    pub connected_at: Instant,
    in_progress: DashMap<InvokeId, OperationCode>,
    abort: Notify,
}

impl SessionHandle {
    /// Creates a handle and the receiver its driver drains.
    #[must_use]
    pub fn new(
        id: SessionId,
        role: SessionRole,
        peer: Option<SocketAddr>,
        config: &SessionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        let handle = Arc::new(Self {
            id,
            role,
            tx,
            peer,
            connected_at: Instant::now(),
            in_progress: DashMap::new(),
            abort: Notify::new(),
        });
        (handle, rx)
    }

    /// Queues a PDU without waiting.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Full` when the queue is full and
    /// `SendError::Disconnected` once the driver has exited.
    pub fn try_send(&self, msg: Outbound) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Queues a PDU, waiting up to `timeout` for space.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the queue stays full for the whole
    /// timeout and `SendError::Disconnected` once the driver has exited.
    pub async fn send_timeout(&self, msg: Outbound, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Whether the driver is still draining the outbound queue.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Ends the session at once, discarding queued PDUs and interrupting a
    /// blocked write.
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    /// Resolves once [`abort`](Self::abort) has been called.
    pub(crate) async fn aborted(&self) {
        self.abort.notified().await;
    }

    /// Resolves once the driver has stopped taking outbound items.
    pub async fn disconnected(&self) {
        self.tx.closed().await;
    }

    /// Marks `invoke_id` as being performed. Returns `false` if it already is.
    pub fn begin_invocation(&self, invoke_id: InvokeId, operation: OperationCode) -> bool {
        match self.in_progress.entry(invoke_id) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(slot) => {
                slot.insert(operation);
                true
            }
        }
    }

    pub fn end_invocation(&self, invoke_id: InvokeId) {
        self.in_progress.remove(&invoke_id);
    }

    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }
}

/// Thread-safe registry of all live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Creates a new empty registry.
    ///
    /// Session IDs start at 1 (0 is reserved as "no session").
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new session, returning its handle and the outbound receiver.
    pub fn register(
        &self,
        role: SessionRole,
        peer: Option<SocketAddr>,
        config: &SessionConfig,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<Outbound>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (handle, rx) = SessionHandle::new(id, role, peer, config);
        self.sessions.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Removes a session from the registry, returning its handle if found.
    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Removes and returns all sessions. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<SessionHandle>> {
        let keys: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.sessions.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

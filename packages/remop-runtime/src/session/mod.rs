//! Sessions: configuration, handles, framing, and shutdown control.
//!
//! A session is one byte stream (a TCP connection or an in-memory duplex)
//! carrying PDUs in both directions. The same driver serves performers and
//! invokers; what happens to inbound PDUs is decided by a [`PduSink`].

pub mod config;
pub mod driver;
pub mod handle;
pub mod shutdown;

pub use config::{NetworkConfig, SessionConfig};
pub use driver::{framed, run_session, PduSink, SessionEnd};
pub use handle::{Outbound, SendError, SessionHandle, SessionId, SessionRegistry, SessionRole};
pub use shutdown::{InFlightGuard, PerformerState, ShutdownController};

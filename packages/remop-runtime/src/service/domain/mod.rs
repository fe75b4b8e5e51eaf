//! Domain services: performer-side implementations of protocol modules.
//!
//! Each service implements `ManagedService` for its lifecycle and wires its
//! handlers into an `OperationRouter` for the module's table.

pub mod imisc;

pub use imisc::{ImiscConfig, ImiscService};

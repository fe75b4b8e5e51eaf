//! Performer-side operation dispatch.
//!
//! This module implements the invocation pipeline:
//!
//! 1. **Handlers** (`handler`): typed async functions adapted to `tower::Service<Invocation>`
//! 2. **Routing** (`router`): dispatch by operation code against an `OperationTable`
//! 3. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 4. **Domain services** (`domain`): module implementations, e.g. IMISC
//! 5. **Background workers** (`worker`): queued tasks plus periodic ticks

pub mod config;
pub mod domain;
pub mod handler;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod router;
pub mod worker;

// Re-export key types for convenient access.
pub use config::ServerConfig;
pub use domain::{ImiscConfig, ImiscService};
pub use handler::{IntoRemoteError, OperationHandler};
pub use middleware::build_operation_pipeline;
pub use operation::{
    Invocation, InvocationContext, OperationError, OperationResponse, UNKNOWN_OPERATION,
};
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use router::{BoxedFuture, BoxedService, OperationRouter, RegistrationError};
pub use worker::{BackgroundRunnable, BackgroundWorker};

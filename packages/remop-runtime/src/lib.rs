//! `remop` runtime: invoker sessions, the performer pipeline and server, and
//! the IMISC service.

pub mod client;
pub mod logging;
pub mod server;
pub mod service;
pub mod session;

pub use client::{
    ClientConfig, CompletionHandlers, ErrorKind, ImiscClient, InvocationOptions, InvokeError,
    RosClient,
};
pub use server::{Performer, RosServer};
pub use service::{ImiscConfig, ImiscService, OperationRouter, ServerConfig};
pub use session::{NetworkConfig, SessionConfig};

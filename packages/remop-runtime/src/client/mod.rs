//! Invoker side: issues invocations over a session and correlates outcomes.
//!
//! Two calling styles share one session:
//!
//! - **Blocking** ([`RosClient::invoke`]): the calling task waits for the
//!   result, error, reject, or timeout.
//! - **Callback** ([`RosClient::invoke_with`]): returns the invocation id as
//!   soon as the invoke PDU is queued; a completion worker later calls the
//!   result or error handler.
//!
//! Typed calls go through [`RemoteOperation`] markers checked against the
//! session's table, so an operation the table does not define is refused
//! before anything is sent.

pub mod completion;
pub mod error;
pub mod imisc;
pub mod outstanding;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use remop_core::{
    decode_payload, encode_payload, InvokeId, InvokePdu, InvokeProblem, OperationCode,
    OperationDescriptor, OperationTable, Pdu, Priority, RejectProblem, RemoteError,
    RemoteOperation, ReturnErrorProblem, ReturnResultProblem,
};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::service::BackgroundWorker;
use crate::session::{
    run_session, Outbound, PduSink, SendError, SessionConfig, SessionEnd, SessionHandle,
    SessionId, SessionRole,
};
use completion::{resolve, Completion, CompletionRunner};
pub use error::{ErrorKind, InvokeError};
pub use imisc::ImiscClient;
use outstanding::{OutstandingInvocations, Pending, RawOutcome, Waiter};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Invoker configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,
    /// Timeout for invocations that do not set their own.
    pub default_timeout: Duration,
    /// Outstanding invocations allowed at once on the session.
    pub max_outstanding: usize,
    /// How often overdue callback-style invocations are expired.
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            default_timeout: Duration::from_secs(30),
            max_outstanding: 1024,
            sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Per-invocation settings.
#[derive(Debug, Clone, Default)]
pub struct InvocationOptions {
    /// Use this invocation id instead of allocating one.
    pub invoke_id: Option<InvokeId>,
    pub priority: Priority,
    /// Overrides `ClientConfig::default_timeout`.
    pub timeout: Option<Duration>,
}

impl InvocationOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_invoke_id(mut self, invoke_id: InvokeId) -> Self {
        self.invoke_id = Some(invoke_id);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// ---------------------------------------------------------------------------
// CompletionHandlers
// ---------------------------------------------------------------------------

/// Result and error handlers for a callback-style invocation. Exactly one of
/// them runs, once.
pub struct CompletionHandlers<R> {
    on_result: Box<dyn FnOnce(R) + Send + Sync>,
    on_error: Box<dyn FnOnce(InvokeError) + Send + Sync>,
}

impl<R: DeserializeOwned + Send + 'static> CompletionHandlers<R> {
    pub fn new(
        on_result: impl FnOnce(R) + Send + Sync + 'static,
        on_error: impl FnOnce(InvokeError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_result: Box::new(on_result),
            on_error: Box::new(on_error),
        }
    }

    /// Handlers that forward the decoded outcome into a oneshot channel.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Result<R, InvokeError>>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
        let on_err_tx = Arc::clone(&tx);
        let handlers = Self::new(
            move |result| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(result));
                }
            },
            move |err| {
                if let Some(tx) = on_err_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        (handlers, rx)
    }

    fn into_waiter(self) -> Waiter {
        let Self {
            on_result,
            on_error,
        } = self;
        Waiter::Callback(Box::new(move |outcome: RawOutcome| {
            match outcome.and_then(|bytes| decode_payload::<R>(&bytes).map_err(InvokeError::DecodeResult)) {
                Ok(result) => on_result(result),
                Err(err) => on_error(err),
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// RosClient
// ---------------------------------------------------------------------------

/// An invoker session bound to one operation table.
pub struct RosClient {
    table: Arc<OperationTable>,
    config: ClientConfig,
    session: Arc<SessionHandle>,
    outstanding: Arc<OutstandingInvocations>,
    driver: parking_lot::Mutex<Option<JoinHandle<SessionEnd>>>,
    worker: tokio::sync::Mutex<BackgroundWorker<CompletionRunner>>,
}

impl RosClient {
    /// Starts an invoker session over an established byte stream.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect<T>(io: T, table: Arc<OperationTable>, config: ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, None, table, config)
    }

    /// Connects to a performer over TCP.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::Connect` if the connection cannot be made.
    pub async fn connect_tcp(
        addr: impl ToSocketAddrs,
        table: Arc<OperationTable>,
        config: ClientConfig,
    ) -> Result<Self, InvokeError> {
        let stream = TcpStream::connect(addr).await.map_err(InvokeError::Connect)?;
        stream.set_nodelay(true).map_err(InvokeError::Connect)?;
        let peer = stream.peer_addr().ok();
        tracing::info!(peer = ?peer, module = table.module(), "connected to performer");
        Ok(Self::start(stream, peer, table, config))
    }

    fn start<T>(
        io: T,
        peer: Option<SocketAddr>,
        table: Arc<OperationTable>,
        config: ClientConfig,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let (session, rx) = SessionHandle::new(id, SessionRole::Invoker, peer, &config.session);
        let outstanding = Arc::new(OutstandingInvocations::new(config.max_outstanding));

        let worker = BackgroundWorker::start(
            CompletionRunner::new(Arc::clone(&outstanding)),
            config.sweep_interval,
        );

        let sink = Arc::new(InvokerSink {
            table: Arc::clone(&table),
            outstanding: Arc::clone(&outstanding),
            completions: worker.sender(),
        });
        let driver = tokio::spawn(run_session(
            io,
            Arc::clone(&session),
            rx,
            sink,
            config.session.clone(),
        ));

        Self {
            table,
            config,
            session,
            outstanding,
            driver: parking_lot::Mutex::new(Some(driver)),
            worker: tokio::sync::Mutex::new(worker),
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<OperationTable> {
        &self.table
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    /// Invocations sent and not yet completed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Invokes `Op` and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Configuration errors if `Op` does not match the table or the argument
    /// cannot be encoded; transport errors if the session cannot carry the
    /// call; remote errors for a `ReturnError`, a reject, or an undecodable
    /// result.
    pub async fn invoke<Op: RemoteOperation>(
        &self,
        argument: &Op::Argument,
    ) -> Result<Op::Result, InvokeError> {
        self.invoke_opts::<Op>(argument, InvocationOptions::default())
            .await
    }

    /// [`invoke`](Self::invoke) with per-call options.
    ///
    /// # Errors
    ///
    /// As for [`invoke`](Self::invoke), plus `DuplicateInvokeId` when
    /// `options.invoke_id` is already outstanding.
    pub async fn invoke_opts<Op: RemoteOperation>(
        &self,
        argument: &Op::Argument,
        options: InvocationOptions,
    ) -> Result<Op::Result, InvokeError> {
        let descriptor = self.table.verify::<Op>()?;
        let argument = encode_payload(argument).map_err(InvokeError::EncodeArgument)?;
        let result = self.call(descriptor, argument, &options).await?;
        decode_payload(&result).map_err(InvokeError::DecodeResult)
    }

    /// Invokes `Op` and returns once the invoke PDU is queued. `handlers`
    /// receive the outcome later.
    ///
    /// # Errors
    ///
    /// Errors detected before the PDU is queued are returned here and the
    /// handlers are not called.
    pub async fn invoke_with<Op: RemoteOperation>(
        &self,
        argument: &Op::Argument,
        handlers: CompletionHandlers<Op::Result>,
    ) -> Result<InvokeId, InvokeError> {
        self.invoke_with_opts::<Op>(argument, InvocationOptions::default(), handlers)
            .await
    }

    /// [`invoke_with`](Self::invoke_with) with per-call options.
    ///
    /// # Errors
    ///
    /// As for [`invoke_with`](Self::invoke_with).
    pub async fn invoke_with_opts<Op: RemoteOperation>(
        &self,
        argument: &Op::Argument,
        options: InvocationOptions,
        handlers: CompletionHandlers<Op::Result>,
    ) -> Result<InvokeId, InvokeError> {
        let descriptor = self.table.verify::<Op>()?;
        let argument = encode_payload(argument).map_err(InvokeError::EncodeArgument)?;
        let (invoke_id, ..) = self
            .submit(descriptor, argument, &options, handlers.into_waiter())
            .await?;
        Ok(invoke_id)
    }

    /// Invokes by operation code with an already encoded argument.
    ///
    /// # Errors
    ///
    /// `InvokeError::Table` if `code` is not in the table; otherwise as for
    /// [`invoke`](Self::invoke).
    pub async fn invoke_raw(
        &self,
        code: OperationCode,
        argument: Vec<u8>,
        options: InvocationOptions,
    ) -> Result<Vec<u8>, InvokeError> {
        let descriptor = self.table.require(code)?;
        self.call(descriptor, argument, &options).await
    }

    /// Ends the session. Outstanding invocations fail with `SessionClosed`
    /// and queued callbacks run before this returns.
    pub async fn close(&self) {
        let _ = self
            .session
            .send_timeout(Outbound::Close(None), self.config.session.send_timeout)
            .await;
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Ok(end) = driver.await {
                tracing::debug!(session = %self.session.id, end = ?end, "invoker session closed");
            }
        }
        self.worker.lock().await.stop().await;
    }

    async fn call(
        &self,
        descriptor: &OperationDescriptor,
        argument: Vec<u8>,
        options: &InvocationOptions,
    ) -> RawOutcome {
        let (tx, rx) = oneshot::channel();
        let (invoke_id, timeout, deadline) = self
            .submit(descriptor, argument, options, Waiter::Blocking(tx))
            .await?;

        let Some(deadline) = deadline else {
            return rx.await.unwrap_or(Err(InvokeError::SessionClosed));
        };
        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(InvokeError::SessionClosed),
            Err(_) => {
                self.outstanding.take(invoke_id);
                Err(InvokeError::Timeout {
                    invoke_id,
                    after: timeout,
                })
            }
        }
    }

    /// Registers the invocation and queues its invoke PDU.
    ///
    /// Returns the id, the effective timeout, and the deadline; a timeout
    /// past the end of the clock leaves the invocation without one.
    async fn submit(
        &self,
        descriptor: &OperationDescriptor,
        argument: Vec<u8>,
        options: &InvocationOptions,
        waiter: Waiter,
    ) -> Result<(InvokeId, Duration, Option<Instant>), InvokeError> {
        if !self.session.is_connected() {
            return Err(InvokeError::SessionClosed);
        }

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let class = waiter.class();
        let issued_at = Instant::now();
        let deadline = issued_at.checked_add(timeout);
        let invoke_id = self.outstanding.register(
            options.invoke_id,
            Pending {
                operation: descriptor.code,
                name: descriptor.name,
                errors: descriptor.errors,
                issued_at,
                deadline,
                waiter,
            },
        )?;

        let pdu = Pdu::Invoke(InvokePdu {
            invoke_id,
            linked_id: None,
            operation: descriptor.code,
            priority: options.priority,
            argument,
        });
        let sent = self
            .session
            .send_timeout(Outbound::Pdu(pdu), self.config.session.send_timeout)
            .await;

        if let Err(e) = sent {
            // If the entry is already gone the session-close path has
            // reported the outcome to the waiter.
            if self.outstanding.take(invoke_id).is_some() {
                return Err(match e {
                    SendError::Disconnected => InvokeError::SessionClosed,
                    other => InvokeError::Send(other),
                });
            }
        }

        tracing::debug!(
            session = %self.session.id,
            invoke_id = %invoke_id,
            operation = descriptor.name,
            ?class,
            "invoke sent"
        );
        Ok((invoke_id, timeout, deadline))
    }
}

impl Drop for RosClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// InvokerSink
// ---------------------------------------------------------------------------

/// Correlates inbound PDUs with outstanding invocations.
struct InvokerSink {
    table: Arc<OperationTable>,
    outstanding: Arc<OutstandingInvocations>,
    completions: Option<mpsc::Sender<Completion>>,
}

impl InvokerSink {
    fn finish(&self, invoke_id: InvokeId, pending: Pending, outcome: RawOutcome) {
        metrics::histogram!("remop_client_invocation_duration_seconds", "operation" => pending.name)
            .record(pending.issued_at.elapsed().as_secs_f64());
        resolve(invoke_id, pending.waiter, outcome, self.completions.as_ref());
    }

    /// Rejects a PDU from the performer.
    fn refuse(session: &SessionHandle, invoke_id: Option<InvokeId>, problem: RejectProblem) {
        tracing::warn!(session = %session.id, invoke_id = ?invoke_id, %problem, "rejecting performer pdu");
        if let Err(e) = session.try_send(Outbound::Pdu(Pdu::reject(invoke_id, problem))) {
            tracing::warn!(session = %session.id, error = %e, "failed to queue reject");
        }
    }
}

impl PduSink for InvokerSink {
    fn deliver(&self, session: &Arc<SessionHandle>, pdu: Pdu) {
        match pdu {
            Pdu::ReturnResult(r) => {
                let Some(pending) = self.outstanding.take(r.invoke_id) else {
                    return Self::refuse(
                        session,
                        Some(r.invoke_id),
                        RejectProblem::ReturnResult(ReturnResultProblem::UnrecognisedInvocation),
                    );
                };
                if r.operation.is_some_and(|op| op != pending.operation) {
                    let problem = RejectProblem::ReturnResult(ReturnResultProblem::MistypedResult);
                    Self::refuse(session, Some(r.invoke_id), problem);
                    self.finish(r.invoke_id, pending, Err(InvokeError::Protocol(problem)));
                } else {
                    self.finish(r.invoke_id, pending, Ok(r.result));
                }
            }
            Pdu::ReturnError(e) => {
                let Some(pending) = self.outstanding.take(e.invoke_id) else {
                    return Self::refuse(
                        session,
                        Some(e.invoke_id),
                        RejectProblem::ReturnError(ReturnErrorProblem::UnrecognisedInvocation),
                    );
                };
                let problem = match self.table.error(e.error) {
                    None => Some(ReturnErrorProblem::UnrecognisedError),
                    Some(_) if !pending.errors.contains(&e.error) => {
                        Some(ReturnErrorProblem::UnexpectedError)
                    }
                    Some(declared) if !declared.accepts_parameter(e.parameter.as_deref()) => {
                        Some(ReturnErrorProblem::MistypedParameter)
                    }
                    Some(_) => None,
                };
                let outcome = match problem {
                    Some(problem) => {
                        let problem = RejectProblem::ReturnError(problem);
                        Self::refuse(session, Some(e.invoke_id), problem);
                        Err(InvokeError::Protocol(problem))
                    }
                    None => Err(InvokeError::Remote(RemoteError {
                        code: e.error,
                        parameter: e.parameter,
                    })),
                };
                self.finish(e.invoke_id, pending, outcome);
            }
            Pdu::Reject(r) => {
                let rejected = match r.invoke_id {
                    Some(id) => self.outstanding.take(id).map(|p| (id, p)),
                    // Unattributed: it can only concern a lone outstanding invocation.
                    None => self.outstanding.take_sole(),
                };
                match rejected {
                    Some((invoke_id, pending)) => {
                        self.finish(invoke_id, pending, Err(InvokeError::Rejected(r.problem)));
                    }
                    None => {
                        tracing::warn!(session = %session.id, invoke_id = ?r.invoke_id, problem = %r.problem, "reject for no outstanding invocation");
                    }
                }
            }
            Pdu::Invoke(inv) => {
                // Only a child linked to one of our own invocations could be
                // addressed to this end, and this end performs nothing.
                let problem = match inv.linked_id {
                    Some(parent) if !self.outstanding.contains(parent) => {
                        InvokeProblem::UnrecognisedLinkedId
                    }
                    _ => InvokeProblem::UnrecognisedOperation,
                };
                Self::refuse(session, Some(inv.invoke_id), RejectProblem::Invoke(problem));
            }
        }
    }

    fn closed(&self, session: &Arc<SessionHandle>, end: &SessionEnd) {
        let failed = self.outstanding.drain();
        if !failed.is_empty() {
            tracing::info!(session = %session.id, ?end, count = failed.len(), "failing outstanding invocations");
        }
        for (invoke_id, pending) in failed {
            self.finish(invoke_id, pending, Err(InvokeError::SessionClosed));
        }
    }
}

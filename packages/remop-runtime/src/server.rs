//! Performer server with deferred startup lifecycle.
//!
//! `new()` wires the operation pipeline, `start()` binds the TCP listener,
//! and `serve()` accepts sessions until the shutdown future resolves. Each
//! accepted connection is one session; its invoke PDUs are dispatched
//! through the shared pipeline and answered on the same session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use remop_core::{
    InvokePdu, InvokeProblem, OperationTable, Pdu, RejectProblem, ReturnErrorProblem,
    ReturnResultProblem,
};
use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::{Service, ServiceExt};
use tracing::{info, warn};

use crate::service::{
    build_operation_pipeline, BoxedService, Invocation, InvocationContext, OperationError,
    OperationRouter, ServerConfig, UNKNOWN_OPERATION,
};
use crate::session::{
    run_session, NetworkConfig, Outbound, PduSink, SessionConfig, SessionEnd, SessionHandle,
    SessionRegistry, SessionRole, ShutdownController,
};

// ---------------------------------------------------------------------------
// Performer
// ---------------------------------------------------------------------------

/// Performs invocations arriving on any number of sessions.
///
/// Cloning is cheap; all clones share the pipeline, session registry, and
/// shutdown controller.
#[derive(Clone)]
pub struct Performer {
    dispatcher: Arc<Dispatcher>,
    session_config: SessionConfig,
}

impl Performer {
    /// Wraps `router` in the middleware pipeline configured by `config`.
    #[must_use]
    pub fn new(router: OperationRouter, config: ServerConfig, session_config: SessionConfig) -> Self {
        let table = Arc::clone(router.table());
        let pipeline = build_operation_pipeline(router, &config);
        Self {
            dispatcher: Arc::new(Dispatcher {
                table,
                pipeline: Arc::new(Mutex::new(pipeline)),
                config: Arc::new(config),
                sessions: Arc::new(SessionRegistry::new()),
                shutdown: Arc::new(ShutdownController::new()),
                send_timeout: session_config.send_timeout,
            }),
            session_config,
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<OperationTable> {
        &self.dispatcher.table
    }

    /// Live sessions.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.dispatcher.sessions)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.dispatcher.shutdown)
    }

    /// Runs a performer session over `io` on a new task.
    ///
    /// Invocations are only performed once the shutdown controller is ready.
    pub fn attach<T>(&self, io: T, peer: Option<SocketAddr>) -> JoinHandle<SessionEnd>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (session, rx) = self
            .dispatcher
            .sessions
            .register(SessionRole::Performer, peer, &self.session_config);
        metrics::gauge!("remop_sessions_active").increment(1.0);
        info!(session = %session.id, peer = ?peer, "session opened");

        tokio::spawn(run_session(
            io,
            session,
            rx,
            Arc::clone(&self.dispatcher) as Arc<dyn PduSink>,
            self.session_config.clone(),
        ))
    }

    /// Stops accepting invocations, waits for in-flight ones up to
    /// `timeout`, then closes every session.
    ///
    /// Each session gets a close after its queued responses, and the send
    /// timeout to flush them; sessions that cannot take the close or do not
    /// finish in time are aborted. Every session driver has stopped by the
    /// time this returns.
    ///
    /// Returns `true` if everything in flight finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let shutdown = &self.dispatcher.shutdown;
        shutdown.begin_release();
        let drained = shutdown.wait_for_drain(timeout).await;
        if drained {
            info!("all in-flight invocations completed");
        } else {
            let table = self.table();
            let running: Vec<String> = shutdown
                .in_flight_by_operation()
                .into_iter()
                .map(|(code, n)| {
                    let name = table.get(code).map_or(UNKNOWN_OPERATION, |d| d.name);
                    format!("{name}={n}")
                })
                .collect();
            warn!(running = %running.join(","), "drain timeout expired with invocations in flight");
        }

        let handles = self.dispatcher.sessions.drain_all();
        if !handles.is_empty() {
            info!(sessions = handles.len(), "closing sessions");
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!("remop_sessions_active").decrement(handles.len() as f64);
        }
        let grace = self.session_config.send_timeout;
        join_all(handles.iter().map(|handle| close_session(handle, grace))).await;
        drained
    }
}

async fn close_session(handle: &SessionHandle, grace: Duration) {
    let close = Outbound::Close(Some("performer shutting down".to_string()));
    if let Err(e) = handle.try_send(close) {
        warn!(session = %handle.id, error = %e, "close not queued, aborting session");
        handle.abort();
    } else if tokio::time::timeout(grace, handle.disconnected()).await.is_err() {
        warn!(session = %handle.id, ?grace, "session did not flush in time, aborting");
        handle.abort();
    }
    if tokio::time::timeout(grace, handle.disconnected()).await.is_err() {
        warn!(session = %handle.id, "session driver did not stop after abort");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Turns inbound PDUs into pipeline invocations and answers them.
struct Dispatcher {
    table: Arc<OperationTable>,
    pipeline: Arc<Mutex<BoxedService>>,
    config: Arc<ServerConfig>,
    sessions: Arc<SessionRegistry>,
    shutdown: Arc<ShutdownController>,
    send_timeout: Duration,
}

impl Dispatcher {
    fn reject(session: &SessionHandle, pdu: Pdu) {
        if let Err(e) = session.try_send(Outbound::Pdu(pdu)) {
            warn!(session = %session.id, error = %e, "failed to queue reject");
        }
    }

    fn perform(&self, session: &Arc<SessionHandle>, inv: InvokePdu) {
        let name = self
            .table
            .get(inv.operation)
            .map_or(UNKNOWN_OPERATION, |d| d.name);
        let ctx = InvocationContext {
            linked_id: inv.linked_id,
            priority: inv.priority,
            ..InvocationContext::new(
                session.id,
                inv.invoke_id,
                inv.operation,
                name,
                self.config.default_operation_timeout_ms,
            )
        };

        if !self.shutdown.accepts_invocations() {
            return Self::reject(session, OperationError::Releasing.into_pdu(&ctx));
        }
        // A linked id names an invocation of the receiver's own, and a
        // performer invokes nothing.
        if let Some(linked) = inv.linked_id {
            warn!(session = %session.id, invoke_id = %inv.invoke_id, %linked, "unrecognised linked id");
            return Self::reject(
                session,
                Pdu::reject(
                    Some(inv.invoke_id),
                    RejectProblem::Invoke(InvokeProblem::UnrecognisedLinkedId),
                ),
            );
        }
        if !session.begin_invocation(inv.invoke_id, inv.operation) {
            warn!(session = %session.id, invoke_id = %inv.invoke_id, "duplicate invocation");
            return Self::reject(
                session,
                Pdu::reject(
                    Some(inv.invoke_id),
                    RejectProblem::Invoke(InvokeProblem::DuplicateInvocation),
                ),
            );
        }

        let guard = self.shutdown.track(inv.operation);
        let pipeline = Arc::clone(&self.pipeline);
        let session = Arc::clone(session);
        let send_timeout = self.send_timeout;
        let invocation = Invocation::new(ctx.clone(), inv.argument);

        tokio::spawn(async move {
            let call = {
                let mut svc = pipeline.lock().await;
                match ServiceExt::<Invocation>::ready(&mut *svc).await {
                    Ok(ready) => Ok(ready.call(invocation)),
                    Err(e) => Err(e),
                }
            };
            let outcome = match call {
                Ok(fut) => fut.await,
                Err(e) => Err(e),
            };

            let pdu = match outcome {
                Ok(response) => response.into_pdu(&ctx),
                Err(e) => {
                    warn!(
                        session = %ctx.session_id,
                        invoke_id = %ctx.invoke_id,
                        operation = ctx.operation_name,
                        error = %e,
                        "invocation rejected"
                    );
                    e.into_pdu(&ctx)
                }
            };

            // Free the id before answering so the invoker may reuse it at once.
            session.end_invocation(ctx.invoke_id);
            if let Err(e) = session.send_timeout(Outbound::Pdu(pdu), send_timeout).await {
                warn!(session = %ctx.session_id, invoke_id = %ctx.invoke_id, error = %e, "failed to send response");
            }
            drop(guard);
        });
    }
}

impl PduSink for Dispatcher {
    fn deliver(&self, session: &Arc<SessionHandle>, pdu: Pdu) {
        match pdu {
            Pdu::Invoke(inv) => self.perform(session, inv),
            // A performer never invokes, so no response can match.
            Pdu::ReturnResult(r) => Self::reject(
                session,
                Pdu::reject(
                    Some(r.invoke_id),
                    RejectProblem::ReturnResult(ReturnResultProblem::UnrecognisedInvocation),
                ),
            ),
            Pdu::ReturnError(e) => Self::reject(
                session,
                Pdu::reject(
                    Some(e.invoke_id),
                    RejectProblem::ReturnError(ReturnErrorProblem::UnrecognisedInvocation),
                ),
            ),
            Pdu::Reject(r) => {
                warn!(session = %session.id, invoke_id = ?r.invoke_id, problem = %r.problem, "invoker rejected a pdu");
            }
        }
    }

    fn closed(&self, session: &Arc<SessionHandle>, end: &SessionEnd) {
        if self.sessions.remove(session.id).is_some() {
            metrics::gauge!("remop_sessions_active").decrement(1.0);
        }
        info!(
            session = %session.id,
            end = ?end,
            in_progress = session.in_progress_count(),
            "session closed"
        );
    }
}

// ---------------------------------------------------------------------------
// RosServer
// ---------------------------------------------------------------------------

/// TCP performer.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- builds the pipeline and shared state
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- accepts sessions until shutdown is signalled, then drains
pub struct RosServer {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    performer: Performer,
}

impl RosServer {
    #[must_use]
    pub fn new(config: NetworkConfig, server_config: ServerConfig, router: OperationRouter) -> Self {
        let performer = Performer::new(router, server_config, config.session.clone());
        Self {
            config,
            listener: None,
            performer,
        }
    }

    /// Shared handle to the performer, for attaching in-process sessions.
    #[must_use]
    pub fn performer(&self) -> Performer {
        self.performer.clone()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        self.performer.shutdown_controller()
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the bound port, which differs from the configured one when
    /// port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(
            application = %self.performer.dispatcher.config.application,
            host = %self.config.host,
            port,
            module = self.performer.table().module(),
            "performer listening"
        );
        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts sessions until `shutdown` resolves, then drains.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let performer = self.performer;
        performer.shutdown_controller().set_ready();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        performer.attach(stream, Some(peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        drop(listener);
        performer.drain(self.config.drain_timeout).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

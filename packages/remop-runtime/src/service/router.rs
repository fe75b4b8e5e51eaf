//! Operation routing: dispatches `Invocation` to handlers by operation code.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use remop_core::{OperationCode, OperationTable, RemoteOperation, TableError};
use tower::Service;

use super::handler::{IntoRemoteError, OperationHandler};
use super::operation::{Invocation, InvocationContext, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// Boxed service aliases
// ---------------------------------------------------------------------------

/// Future returned by every service in the pipeline.
pub type BoxedFuture =
    Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

/// A type-erased Tower service handling invocations.
pub type BoxedService = Box<
    dyn Service<Invocation, Response = OperationResponse, Error = OperationError, Future = BoxedFuture>
        + Send,
>;

// ---------------------------------------------------------------------------
// RegistrationError
// ---------------------------------------------------------------------------

/// Configuration errors raised while wiring handlers to a table.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("operation {code} already has a handler")]
    AlreadyRegistered { code: OperationCode },
}

// ---------------------------------------------------------------------------
// OperationRouter
// ---------------------------------------------------------------------------

/// Routes `Invocation` values to the handler registered for their operation code.
///
/// Handlers can only be registered for codes present in the router's table,
/// and at most once per code. Invocations with an unregistered code return
/// `OperationError::UnknownOperation`.
pub struct OperationRouter {
    table: Arc<OperationTable>,
    services: HashMap<OperationCode, BoxedService>,
}

impl OperationRouter {
    /// Create a router with no handlers for the given table.
    #[must_use]
    pub fn new(table: Arc<OperationTable>) -> Self {
        Self {
            table,
            services: HashMap::new(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<OperationTable> {
        &self.table
    }

    /// Register an untyped service for an operation code.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::Table` if the code is not in the table, or
    /// `RegistrationError::AlreadyRegistered` if it already has a handler.
    pub fn register<S>(&mut self, code: OperationCode, service: S) -> Result<(), RegistrationError>
    where
        S: Service<Invocation, Response = OperationResponse, Error = OperationError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.table.require(code)?;
        if self.services.contains_key(&code) {
            return Err(RegistrationError::AlreadyRegistered { code });
        }
        self.services.insert(code, Box::new(ServiceWrapper(service)));
        Ok(())
    }

    /// Register a typed async handler for operation `Op`.
    ///
    /// The marker is checked against the table entry, so a handler whose
    /// argument or result type disagrees with the table is refused here
    /// rather than failing at dispatch.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::Table` on unknown code or type mismatch,
    /// `RegistrationError::AlreadyRegistered` on a second registration.
    pub fn handle<Op, F, Fut, E>(&mut self, handler: F) -> Result<&mut Self, RegistrationError>
    where
        Op: RemoteOperation,
        F: Fn(InvocationContext, Op::Argument) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Op::Result, E>> + Send + 'static,
        E: IntoRemoteError + Send + 'static,
    {
        self.table.verify::<Op>()?;
        self.register(Op::CODE, OperationHandler::<Op, F>::new(handler))?;
        Ok(self)
    }

    /// Table operations that have no handler.
    #[must_use]
    pub fn unhandled(&self) -> Vec<OperationCode> {
        self.table
            .operations()
            .map(|d| d.code)
            .filter(|code| !self.services.contains_key(code))
            .collect()
    }
}

impl Service<Invocation> for OperationRouter {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // All registered handlers must be ready. If any is not ready, return pending.
        for svc in self.services.values_mut() {
            match svc.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let code = inv.ctx().operation;
        match self.services.get_mut(&code) {
            Some(svc) => svc.call(inv),
            None => Box::pin(async move { Err(OperationError::UnknownOperation { code }) }),
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceWrapper (type-erased adapter)
// ---------------------------------------------------------------------------

/// Wrapper to type-erase a concrete `Service<Invocation>` into a `BoxedService`.
struct ServiceWrapper<S>(S);

impl<S> Service<Invocation> for ServiceWrapper<S>
where
    S: Service<Invocation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        Box::pin(self.0.call(inv))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use remop_core::imisc::{self, Data, Echo, Empty, Ping, UtcResult, UtcTime};
    use remop_core::{decode_payload, encode_payload, InvokeId, RemoteError};
    use tower::ServiceExt;

    use super::*;
    use crate::session::SessionId;

    /// A stub service that acknowledges any invocation with an empty result.
    struct StubService;

    impl Service<Invocation> for StubService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future = BoxedFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _inv: Invocation) -> Self::Future {
            Box::pin(async move { Ok(OperationResponse::Result(Vec::new())) })
        }
    }

    fn table() -> Arc<OperationTable> {
        Arc::new(imisc::table().clone())
    }

    fn make_inv(code: OperationCode, argument: Vec<u8>) -> Invocation {
        let ctx = InvocationContext::new(SessionId(1), InvokeId(1), code, "test", 5000);
        Invocation::new(ctx, argument)
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let mut router = OperationRouter::new(table());
        router
            .handle::<Echo, _, _, RemoteError>(|_ctx, data: Data| async move { Ok(data) })
            .unwrap();

        let arg = encode_payload(&Data(rmpv::Value::from("hello"))).unwrap();
        let resp = router.oneshot(make_inv(Echo::CODE, arg)).await.unwrap();
        let OperationResponse::Result(bytes) = resp else {
            panic!("expected result");
        };
        let echoed: Data = decode_payload(&bytes).unwrap();
        assert_eq!(echoed, Data(rmpv::Value::from("hello")));
    }

    #[tokio::test]
    async fn unregistered_code_returns_unknown_operation() {
        let mut router = OperationRouter::new(table());
        router.register(Ping::CODE, StubService).unwrap();

        let err = router
            .oneshot(make_inv(OperationCode(42), Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperationError::UnknownOperation { code } if code == OperationCode(42)
        ));
    }

    #[tokio::test]
    async fn handler_runs_exactly_once_per_invocation() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut router = OperationRouter::new(table());
        let counter = Arc::clone(&calls);
        router
            .handle::<Ping, _, _, RemoteError>(move |_ctx, _: Empty| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Empty) }
            })
            .unwrap();

        for _ in 0..3 {
            let arg = encode_payload(&Empty).unwrap();
            ServiceExt::ready(&mut router)
                .await
                .unwrap()
                .call(make_inv(Ping::CODE, arg))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn register_code_outside_table_fails() {
        let mut router = OperationRouter::new(table());
        let err = router.register(OperationCode(500), StubService).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Table(TableError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn double_registration_fails() {
        let mut router = OperationRouter::new(table());
        router.register(Ping::CODE, StubService).unwrap();
        let err = router.register(Ping::CODE, StubService).unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyRegistered { code } if code == Ping::CODE));
    }

    #[test]
    fn mismatched_marker_is_refused_at_registration() {
        /// Claims code 0 (utcTime) with the wrong result type.
        struct BadUtcTime;
        impl RemoteOperation for BadUtcTime {
            const CODE: OperationCode = UtcTime::CODE;
            const NAME: &'static str = "utcTime";
            type Argument = Empty;
            type Result = u64;
        }

        let mut router = OperationRouter::new(table());
        let err = router
            .handle::<BadUtcTime, _, _, RemoteError>(|_ctx, _| async move { Ok(0u64) })
            .err()
            .expect("registration should fail");
        assert!(matches!(
            err,
            RegistrationError::Table(TableError::TypeMismatch { .. })
        ));

        // The correct marker is still accepted.
        router
            .handle::<UtcTime, _, _, RemoteError>(|_ctx, _| async move {
                Ok(UtcResult("700101000000Z".into()))
            })
            .unwrap();
    }

    #[test]
    fn unhandled_lists_missing_operations() {
        let mut router = OperationRouter::new(table());
        assert_eq!(router.unhandled().len(), 12);
        router.register(Ping::CODE, StubService).unwrap();
        let missing = router.unhandled();
        assert_eq!(missing.len(), 11);
        assert!(!missing.contains(&Ping::CODE));
    }
}

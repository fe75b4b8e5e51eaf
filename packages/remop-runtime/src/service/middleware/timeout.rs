//! Per-invocation deadline.
//!
//! The deadline comes from each invocation's `call_timeout_ms`; zero means
//! the invocation may run for as long as it needs. An expired invocation is
//! dropped and fails with `OperationError::Timeout`.

use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::service::operation::{Invocation, OperationError, OperationResponse};
use crate::service::router::BoxedFuture;

#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let timeout_ms = inv.ctx.call_timeout_ms;
        let operation = inv.ctx.operation_name;
        let invoke_id = inv.ctx.invoke_id;
        let fut = self.inner.call(inv);
        if timeout_ms == 0 {
            return Box::pin(fut);
        }
        Box::pin(async move {
            if let Ok(outcome) = tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                outcome
            } else {
                tracing::warn!(%invoke_id, operation, timeout_ms, "invocation abandoned");
                Err(OperationError::Timeout { timeout_ms })
            }
        })
    }
}

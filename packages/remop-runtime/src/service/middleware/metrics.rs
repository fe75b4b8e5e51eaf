//! Metrics middleware for invocations.
//!
//! Wraps each invocation in a `tracing` span and records duration and outcome
//! through the `metrics` facade. Exporting is left to the binary.

use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{Invocation, OperationError, OperationResponse};
use crate::service::router::BoxedFuture;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments invocations with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records invocation duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
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
        let operation = inv.ctx().operation_name;
        let invoke_id = inv.ctx().invoke_id.0;
        let session_id = inv.ctx().session_id.0;

        let span = info_span!(
            "invocation",
            operation = operation,
            invoke_id = invoke_id,
            session_id = session_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(inv);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(OperationResponse::Result(_)) => "result",
                    Ok(OperationResponse::Error(_)) => "error",
                    Err(_) => "reject",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "remop_invocations_total",
                    "operation" => operation,
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!("remop_invocation_duration_seconds", "operation" => operation)
                    .record(elapsed.as_secs_f64());

                tracing::info!(
                    operation = operation,
                    invoke_id = invoke_id,
                    duration_ms = duration_ms,
                    outcome = outcome,
                    "invocation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::ServerConfig;
use crate::service::router::{BoxedService, OperationRouter};

/// Build the performer pipeline by wrapping the `OperationRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-invocation timeouts
/// 3. `MetricsLayer` -- record timing and outcome (closest to the actual handler)
#[must_use]
pub fn build_operation_pipeline(router: OperationRouter, config: &ServerConfig) -> BoxedService {
    Box::new(
        ServiceBuilder::new()
            .layer(LoadShedLayer::new(
                config.max_concurrent_operations,
                config.priority_reserve,
            ))
            .layer(TimeoutLayer)
            .layer(MetricsLayer)
            .service(router),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use remop_core::imisc::{self, Empty, Ping};
    use remop_core::{encode_payload, InvokeId, RemoteError, RemoteOperation};
    use tower::ServiceExt;

    use super::*;
    use crate::service::operation::{Invocation, InvocationContext, OperationError, OperationResponse};
    use crate::session::SessionId;

    fn make_inv(timeout_ms: u64) -> Invocation {
        let ctx = InvocationContext::new(SessionId(1), InvokeId(42), Ping::CODE, "ping", timeout_ms);
        Invocation::new(ctx, encode_payload(&Empty).unwrap())
    }

    fn router(delay: Duration) -> OperationRouter {
        let mut router = OperationRouter::new(Arc::new(imisc::table().clone()));
        router
            .handle::<Ping, _, _, RemoteError>(move |_ctx, _: Empty| async move {
                tokio::time::sleep(delay).await;
                Ok(Empty)
            })
            .unwrap();
        router
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let config = ServerConfig {
            max_concurrent_operations: 100,
            ..ServerConfig::default()
        };

        let svc = build_operation_pipeline(router(Duration::ZERO), &config);
        let resp = svc.oneshot(make_inv(5000)).await.unwrap();
        assert_eq!(resp, OperationResponse::Result(encode_payload(&Empty).unwrap()));
    }

    #[tokio::test]
    async fn pipeline_enforces_invocation_timeout() {
        let svc = build_operation_pipeline(router(Duration::from_millis(200)), &ServerConfig::default());
        let err = svc.oneshot(make_inv(20)).await.unwrap_err();
        assert!(matches!(err, OperationError::Timeout { timeout_ms: 20 }));
    }
}

//! Concurrency limit with a reserve for urgent invocations.
//!
//! Invocations take a permit from the general pool. When it is exhausted,
//! invocations whose priority is above [`Priority::NORMAL`] may take one of
//! the reserved permits; everything else fails at once with
//! `OperationError::Overloaded`, which the dispatcher rejects as a resource
//! limitation.

use std::sync::Arc;
use std::task::{Context, Poll};

use remop_core::Priority;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::service::operation::{Invocation, OperationError, OperationResponse};
use crate::service::router::BoxedFuture;

#[derive(Debug)]
struct Permits {
    general: Arc<Semaphore>,
    reserved: Arc<Semaphore>,
}

impl Permits {
    fn acquire(&self, priority: Priority) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.general).try_acquire_owned() {
            return Some(permit);
        }
        if priority > Priority::NORMAL {
            return Arc::clone(&self.reserved).try_acquire_owned().ok();
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Permits>,
}

impl LoadShedLayer {
    /// At most `max_concurrent` invocations at once, `reserved` of which
    /// only priority invocations may use.
    #[must_use]
    pub fn new(max_concurrent: u32, reserved: u32) -> Self {
        let reserved = reserved.min(max_concurrent);
        Self {
            permits: Arc::new(Permits {
                general: Arc::new(Semaphore::new((max_concurrent - reserved) as usize)),
                reserved: Arc::new(Semaphore::new(reserved as usize)),
            }),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Permits>,
}

impl<S> Service<Invocation> for LoadShedService<S>
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
        let Some(permit) = self.permits.acquire(inv.ctx.priority) else {
            metrics::counter!("remop_invocations_shed_total", "operation" => inv.ctx.operation_name)
                .increment(1);
            tracing::debug!(
                invoke_id = %inv.ctx.invoke_id,
                operation = inv.ctx.operation_name,
                priority = inv.ctx.priority.0,
                "invocation shed"
            );
            return Box::pin(async { Err(OperationError::Overloaded) });
        };

        let fut = self.inner.call(inv);
        Box::pin(async move {
            let _permit = permit;
            fut.await
        })
    }
}

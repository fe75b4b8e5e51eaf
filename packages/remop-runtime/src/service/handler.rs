//! Typed handler adapter: turns an async function over a `RemoteOperation`'s
//! argument and result types into a `tower::Service<Invocation>`.

use std::future::Future;
use std::marker::PhantomData;
use std::task::{Context, Poll};

use remop_core::imisc::ImiscError;
use remop_core::{decode_payload, encode_payload, CodecError, RemoteError, RemoteOperation};
use tower::Service;

use super::operation::{Invocation, InvocationContext, OperationError, OperationResponse};
use super::router::BoxedFuture;

/// Application errors a handler may return in place of a result.
pub trait IntoRemoteError {
    /// Encode into the wire form.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if an error parameter cannot be encoded.
    fn into_remote_error(self) -> Result<RemoteError, CodecError>;
}

impl IntoRemoteError for RemoteError {
    fn into_remote_error(self) -> Result<RemoteError, CodecError> {
        Ok(self)
    }
}

impl IntoRemoteError for ImiscError {
    fn into_remote_error(self) -> Result<RemoteError, CodecError> {
        self.into_remote()
    }
}

/// Service that decodes the argument, runs the handler, and encodes the outcome.
pub struct OperationHandler<Op, F> {
    handler: F,
    _op: PhantomData<fn() -> Op>,
}

impl<Op, F> OperationHandler<Op, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _op: PhantomData,
        }
    }
}

impl<Op, F, Fut, E> Service<Invocation> for OperationHandler<Op, F>
where
    Op: RemoteOperation,
    F: Fn(InvocationContext, Op::Argument) -> Fut,
    Fut: Future<Output = Result<Op::Result, E>> + Send + 'static,
    E: IntoRemoteError + Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let argument = match decode_payload::<Op::Argument>(&inv.argument) {
            Ok(arg) => arg,
            Err(source) => {
                return Box::pin(async move {
                    Err(OperationError::MistypedArgument {
                        operation: Op::NAME,
                        source,
                    })
                })
            }
        };

        let fut = (self.handler)(inv.ctx, argument);
        Box::pin(async move {
            match fut.await {
                Ok(result) => encode_payload(&result)
                    .map(OperationResponse::Result)
                    .map_err(|e| OperationError::Internal(e.into())),
                Err(err) => {
                    let remote = err
                        .into_remote_error()
                        .map_err(|e| OperationError::Internal(e.into()))?;
                    if !Op::ERRORS.contains(&remote.code) {
                        tracing::warn!(
                            operation = Op::NAME,
                            error = remote.code.0,
                            "handler returned an error the operation does not declare"
                        );
                    }
                    Ok(OperationResponse::Error(remote))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use remop_core::imisc::{Finger, Ia5List};
    use remop_core::{InvokeId, OperationCode};
    use tower::ServiceExt;

    use super::*;
    use crate::session::SessionId;

    fn finger_inv(argument: Vec<u8>) -> Invocation {
        let ctx = InvocationContext::new(SessionId(1), InvokeId(3), Finger::CODE, "finger", 5000);
        Invocation::new(ctx, argument)
    }

    #[tokio::test]
    async fn mistyped_argument_is_reported_without_calling_handler() {
        let svc = OperationHandler::<Finger, _>::new(|_ctx, _names: Ia5List| async move {
            Err::<Ia5List, _>(RemoteError::new(remop_core::ErrorCode(0)))
        });
        // An integer is not a list of strings.
        let arg = encode_payload(&17u32).unwrap();
        let err = svc.oneshot(finger_inv(arg)).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::MistypedArgument { operation: "finger", .. }
        ));
    }

    #[tokio::test]
    async fn typed_error_is_encoded_as_remote_error() {
        let svc = OperationHandler::<Finger, _>::new(|_ctx, names: Ia5List| async move {
            Err::<Ia5List, _>(ImiscError::UserNotLoggedIn(names))
        });
        let arg = encode_payload(&Ia5List::new(["nobody"]).unwrap()).unwrap();
        let resp = svc.oneshot(finger_inv(arg)).await.unwrap();
        let OperationResponse::Error(remote) = resp else {
            panic!("expected error response");
        };
        assert_eq!(remote.code, remop_core::imisc::errors::USER_NOT_LOGGED_IN);
        let decoded = ImiscError::from_remote(&remote).unwrap();
        assert_eq!(
            decoded,
            Some(ImiscError::UserNotLoggedIn(Ia5List::new(["nobody"]).unwrap()))
        );
    }

    #[tokio::test]
    async fn handler_sees_invocation_context() {
        let svc = OperationHandler::<Finger, _>::new(|ctx: InvocationContext, _names: Ia5List| async move {
            Ok::<_, RemoteError>(Ia5List::lossy([format!("invoke {}", ctx.invoke_id)]))
        });
        let arg = encode_payload(&Ia5List::default()).unwrap();
        let resp = svc.oneshot(finger_inv(arg)).await.unwrap();
        let OperationResponse::Result(bytes) = resp else {
            panic!("expected result");
        };
        let lines: Ia5List = decode_payload(&bytes).unwrap();
        assert_eq!(lines.as_slice(), ["invoke 3".to_string()]);
        assert_eq!(Finger::CODE, OperationCode(5));
    }
}

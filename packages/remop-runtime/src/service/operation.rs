//! Invocation types carried through the performer pipeline.

use remop_core::{
    CodecError, ErrorPdu, InvokeId, InvokeProblem, OperationCode, Pdu, Priority, RejectProblem,
    RemoteError, ResultPdu,
};

use crate::session::SessionId;

/// Name recorded for invocations whose operation code is not in the table.
pub const UNKNOWN_OPERATION: &str = "<unknown>";

/// Context carried with every invocation through the pipeline.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub session_id: SessionId,
    pub invoke_id: InvokeId,
    pub linked_id: Option<InvokeId>,
    pub operation: OperationCode,
    pub operation_name: &'static str,
    pub priority: Priority,
    pub call_timeout_ms: u64,
}

impl InvocationContext {
    /// Context with no link and normal priority.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        invoke_id: InvokeId,
        operation: OperationCode,
        operation_name: &'static str,
        call_timeout_ms: u64,
    ) -> Self {
        Self {
            session_id,
            invoke_id,
            linked_id: None,
            operation,
            operation_name,
            priority: Priority::NORMAL,
            call_timeout_ms,
        }
    }
}

/// One decoded invoke PDU travelling to its handler.
#[derive(Debug)]
pub struct Invocation {
    pub ctx: InvocationContext,
    /// Encoded argument; decoded by the typed handler.
    pub argument: Vec<u8>,
}

impl Invocation {
    #[must_use]
    pub fn new(ctx: InvocationContext, argument: Vec<u8>) -> Self {
        Self { ctx, argument }
    }

    #[must_use]
    pub fn ctx(&self) -> &InvocationContext {
        &self.ctx
    }
}

/// Outcome produced by a handler that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResponse {
    /// Encoded result value.
    Result(Vec<u8>),
    /// Application error declared by the operation.
    Error(RemoteError),
}

impl OperationResponse {
    /// Wraps the outcome in the PDU answering `ctx`.
    #[must_use]
    pub fn into_pdu(self, ctx: &InvocationContext) -> Pdu {
        match self {
            OperationResponse::Result(result) => Pdu::ReturnResult(ResultPdu {
                invoke_id: ctx.invoke_id,
                operation: Some(ctx.operation),
                result,
            }),
            OperationResponse::Error(err) => Pdu::ReturnError(ErrorPdu {
                invoke_id: ctx.invoke_id,
                error: err.code,
                parameter: err.parameter,
            }),
        }
    }
}

/// Failures that prevent a handler from producing an outcome.
///
/// Each maps onto a reject problem sent back to the invoker.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown operation: {code}")]
    UnknownOperation { code: OperationCode },
    #[error("mistyped argument for {operation}: {source}")]
    MistypedArgument {
        operation: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("performer overloaded, try again later")]
    Overloaded,
    #[error("performer is shutting down")]
    Releasing,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Reject problem reported to the invoker for this failure.
    #[must_use]
    pub fn reject_problem(&self) -> RejectProblem {
        let problem = match self {
            OperationError::UnknownOperation { .. } => InvokeProblem::UnrecognisedOperation,
            OperationError::MistypedArgument { .. } => InvokeProblem::MistypedArgument,
            OperationError::Timeout { .. }
            | OperationError::Overloaded
            | OperationError::Releasing
            | OperationError::Internal(_) => InvokeProblem::ResourceLimitation,
        };
        RejectProblem::Invoke(problem)
    }

    /// Reject PDU answering `ctx`.
    #[must_use]
    pub fn into_pdu(self, ctx: &InvocationContext) -> Pdu {
        Pdu::reject(Some(ctx.invoke_id), self.reject_problem())
    }
}

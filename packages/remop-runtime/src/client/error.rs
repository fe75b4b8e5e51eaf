//! Invoker-side errors.

use std::time::Duration;

use remop_core::imisc::ImiscError;
use remop_core::{CodecError, InvokeId, RejectProblem, RemoteError, TableError};

use crate::session::SendError;

/// Broad class of an [`InvokeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The call was malformed and never sent (or could never have been).
    Configuration,
    /// The session could not carry the call to completion. Retrying may help.
    Transport,
    /// The performer answered with an error or refused the invocation.
    Remote,
}

/// Failure of a single invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    // --- configuration ---
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("invoke id {0} is already outstanding on this session")]
    DuplicateInvokeId(InvokeId),
    #[error("failed to encode argument: {0}")]
    EncodeArgument(#[source] CodecError),

    // --- transport ---
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),
    #[error("session closed")]
    SessionClosed,
    #[error("failed to send invoke: {0}")]
    Send(#[from] SendError),
    #[error("invocation {invoke_id} timed out after {after:?}")]
    Timeout { invoke_id: InvokeId, after: Duration },
    #[error("too many outstanding invocations (limit {limit})")]
    Congested { limit: usize },

    // --- remote ---
    #[error("remote error {0}")]
    Remote(RemoteError),
    #[error("invocation rejected: {0}")]
    Rejected(RejectProblem),
    #[error("performer response refused: {0}")]
    Protocol(RejectProblem),
    #[error("failed to decode result: {0}")]
    DecodeResult(#[source] CodecError),
}

impl InvokeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::Table(_)
            | InvokeError::DuplicateInvokeId(_)
            | InvokeError::EncodeArgument(_) => ErrorKind::Configuration,
            InvokeError::Connect(_)
            | InvokeError::SessionClosed
            | InvokeError::Send(_)
            | InvokeError::Timeout { .. }
            | InvokeError::Congested { .. } => ErrorKind::Transport,
            InvokeError::Remote(_)
            | InvokeError::Rejected(_)
            | InvokeError::Protocol(_)
            | InvokeError::DecodeResult(_) => ErrorKind::Remote,
        }
    }

    /// Whether the same call may succeed if retried.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// The application error returned by the performer, if that is what this is.
    #[must_use]
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            InvokeError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// The application error decoded as an IMISC error.
    ///
    /// Returns `None` for anything but an IMISC `ReturnError` with a
    /// well-formed parameter.
    #[must_use]
    pub fn imisc(&self) -> Option<ImiscError> {
        self.remote_error()
            .and_then(|err| ImiscError::from_remote(err).ok().flatten())
    }
}

#[cfg(test)]
mod tests {
    use remop_core::{ErrorCode, InvokeProblem, OperationCode};

    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let unknown = InvokeError::Table(TableError::UnknownOperation {
            module: "IMISC",
            code: OperationCode(99),
        });
        assert_eq!(unknown.kind(), ErrorKind::Configuration);
        assert!(!unknown.is_recoverable());

        assert_eq!(InvokeError::SessionClosed.kind(), ErrorKind::Transport);
        assert!(InvokeError::Congested { limit: 4 }.is_recoverable());
        assert!(InvokeError::Send(SendError::Full).is_recoverable());

        let rejected = InvokeError::Rejected(RejectProblem::Invoke(InvokeProblem::UnrecognisedOperation));
        assert_eq!(rejected.kind(), ErrorKind::Remote);
        assert!(!rejected.is_recoverable());
    }

    #[test]
    fn imisc_error_is_recovered_from_remote() {
        let remote = ImiscError::Congested.into_remote().unwrap();
        let err = InvokeError::Remote(remote);
        assert_eq!(err.imisc(), Some(ImiscError::Congested));

        let foreign = InvokeError::Remote(RemoteError::new(ErrorCode(500)));
        assert_eq!(foreign.imisc(), None);
        assert!(InvokeError::SessionClosed.imisc().is_none());
    }
}

//! Remote Operations protocol data units.
//!
//! Four PDUs travel on a session: `Invoke` from invoker to performer, and
//! one of `ReturnResult`, `ReturnError`, or `Reject` back. PDUs serialize as
//! named `MsgPack` maps with a `type` discriminator; operation payloads are
//! nested as byte strings produced by [`crate::codec`].

use serde::{Deserialize, Serialize};

use crate::codec::{decode_payload, encode_payload, CodecError};
use crate::types::{ErrorCode, InvokeId, OperationCode, Priority};

// ---------------------------------------------------------------------------
// Reject problems
// ---------------------------------------------------------------------------

/// Problems with a PDU as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum GeneralProblem {
    #[error("unrecognised PDU")]
    UnrecognisedPdu,
    #[error("mistyped PDU")]
    MistypedPdu,
    #[error("badly structured PDU")]
    BadlyStructuredPdu,
}

/// Problems with an `Invoke` PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum InvokeProblem {
    #[error("duplicate invocation")]
    DuplicateInvocation,
    #[error("unrecognised operation")]
    UnrecognisedOperation,
    #[error("mistyped argument")]
    MistypedArgument,
    #[error("resource limitation")]
    ResourceLimitation,
    #[error("initiator releasing")]
    InitiatorReleasing,
    #[error("unrecognised linked invocation")]
    UnrecognisedLinkedId,
}

/// Problems with a `ReturnResult` PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ReturnResultProblem {
    #[error("unrecognised invocation")]
    UnrecognisedInvocation,
    #[error("result response unexpected")]
    ResultResponseUnexpected,
    #[error("mistyped result")]
    MistypedResult,
}

/// Problems with a `ReturnError` PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ReturnErrorProblem {
    #[error("unrecognised invocation")]
    UnrecognisedInvocation,
    #[error("error response unexpected")]
    ErrorResponseUnexpected,
    #[error("unrecognised error")]
    UnrecognisedError,
    #[error("unexpected error")]
    UnexpectedError,
    #[error("mistyped parameter")]
    MistypedParameter,
}

/// Why a peer refused a PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum RejectProblem {
    #[error("general problem: {0}")]
    General(GeneralProblem),
    #[error("invoke problem: {0}")]
    Invoke(InvokeProblem),
    #[error("return-result problem: {0}")]
    ReturnResult(ReturnResultProblem),
    #[error("return-error problem: {0}")]
    ReturnError(ReturnErrorProblem),
}

// ---------------------------------------------------------------------------
// PDU bodies
// ---------------------------------------------------------------------------

/// Request to perform an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokePdu {
    pub invoke_id: InvokeId,
    /// Parent invocation when this is a linked (child) operation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub linked_id: Option<InvokeId>,
    pub operation: OperationCode,
    #[serde(default)]
    pub priority: Priority,
    #[serde(with = "serde_bytes")]
    pub argument: Vec<u8>,
}

/// Successful outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPdu {
    pub invoke_id: InvokeId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation: Option<OperationCode>,
    #[serde(with = "serde_bytes")]
    pub result: Vec<u8>,
}

/// Application error outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPdu {
    pub invoke_id: InvokeId,
    pub error: ErrorCode,
    #[serde(with = "serde_bytes", skip_serializing_if = "Option::is_none", default)]
    pub parameter: Option<Vec<u8>>,
}

/// Refusal of a PDU. `invoke_id` is absent when the offending PDU could not
/// be decoded far enough to identify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectPdu {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub invoke_id: Option<InvokeId>,
    pub problem: RejectProblem,
}

// ---------------------------------------------------------------------------
// Pdu
// ---------------------------------------------------------------------------

/// Any PDU exchanged on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Pdu {
    #[serde(rename = "INVOKE")]
    Invoke(InvokePdu),
    #[serde(rename = "RETURN_RESULT")]
    ReturnResult(ResultPdu),
    #[serde(rename = "RETURN_ERROR")]
    ReturnError(ErrorPdu),
    #[serde(rename = "REJECT")]
    Reject(RejectPdu),
}

impl Pdu {
    /// Shorthand for a reject PDU.
    #[must_use]
    pub fn reject(invoke_id: Option<InvokeId>, problem: RejectProblem) -> Self {
        Pdu::Reject(RejectPdu { invoke_id, problem })
    }

    /// The invocation this PDU belongs to, if known.
    #[must_use]
    pub fn invoke_id(&self) -> Option<InvokeId> {
        match self {
            Pdu::Invoke(p) => Some(p.invoke_id),
            Pdu::ReturnResult(p) => Some(p.invoke_id),
            Pdu::ReturnError(p) => Some(p.invoke_id),
            Pdu::Reject(p) => p.invoke_id,
        }
    }

    /// Discriminator string, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::Invoke(_) => "INVOKE",
            Pdu::ReturnResult(_) => "RETURN_RESULT",
            Pdu::ReturnError(_) => "RETURN_ERROR",
            Pdu::Reject(_) => "REJECT",
        }
    }

    /// Serializes the PDU into a frame body.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_payload(self)
    }

    /// Parses a frame body.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid PDU.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_payload(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_roundtrip_preserves_payload_bytes() {
        let pdu = Pdu::Invoke(InvokePdu {
            invoke_id: InvokeId(7),
            linked_id: None,
            operation: OperationCode(11),
            priority: Priority::NORMAL,
            argument: vec![0xDE, 0xAD, 0xBE, 0xEF],
        });

        let bytes = pdu.to_bytes().unwrap();
        assert_eq!(Pdu::from_bytes(&bytes).unwrap(), pdu);
    }

    #[test]
    fn error_without_parameter_roundtrip() {
        let pdu = Pdu::ReturnError(ErrorPdu {
            invoke_id: InvokeId(3),
            error: ErrorCode(4),
            parameter: None,
        });
        let bytes = pdu.to_bytes().unwrap();
        assert_eq!(Pdu::from_bytes(&bytes).unwrap(), pdu);
    }

    #[test]
    fn reject_without_invoke_id_roundtrip() {
        let pdu = Pdu::reject(None, RejectProblem::General(GeneralProblem::MistypedPdu));
        let bytes = pdu.to_bytes().unwrap();
        let decoded = Pdu::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.invoke_id(), None);
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn serialized_pdu_carries_type_discriminator() {
        let pdu = Pdu::ReturnResult(ResultPdu {
            invoke_id: InvokeId(1),
            operation: Some(OperationCode(9)),
            result: Vec::new(),
        });
        let bytes = pdu.to_bytes().unwrap();
        let value: rmpv::Value = rmp_serde::from_slice(&bytes).unwrap();
        let map = value.as_map().expect("PDU should be a map");
        let tag = map
            .iter()
            .find(|(k, _)| k.as_str() == Some("type"))
            .map(|(_, v)| v.as_str());
        assert_eq!(tag, Some(Some("RETURN_RESULT")));
    }

    #[test]
    fn garbage_is_not_a_pdu() {
        assert!(Pdu::from_bytes(&[0xC1, 0x00, 0x13]).is_err());
    }

    #[test]
    fn reject_problem_display() {
        let problem = RejectProblem::Invoke(InvokeProblem::UnrecognisedOperation);
        assert_eq!(problem.to_string(), "invoke problem: unrecognised operation");
    }
}

//! Typed operation markers and application error values.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_payload, encode_payload, CodecError};
use crate::table::OperationDescriptor;
use crate::types::{ErrorCode, OperationCode};

/// Compile-time description of one remote operation.
///
/// Each operation of a module is a zero-sized marker type implementing this
/// trait. Invokers and performers are generic over the marker, so an
/// operation that does not exist cannot be named, and argument/result types
/// are checked by the compiler. `descriptor()` must agree with the entry the
/// module's `OperationTable` holds for `CODE`; registration verifies this.
pub trait RemoteOperation: Send + Sync + 'static {
    /// Operation code on the wire.
    const CODE: OperationCode;
    /// Symbolic name, as written in the module definition.
    const NAME: &'static str;
    /// Error codes the performer may return for this operation.
    const ERRORS: &'static [ErrorCode] = &[];

    type Argument: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;

    /// Table descriptor derived from the marker's constants and types.
    #[must_use]
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor {
            code: Self::CODE,
            name: Self::NAME,
            argument_type: std::any::type_name::<Self::Argument>(),
            result_type: std::any::type_name::<Self::Result>(),
            errors: Self::ERRORS,
        }
    }
}

/// Application-level error returned by a performer instead of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: ErrorCode,
    /// Encoded error parameter, if the error declares one.
    pub parameter: Option<Vec<u8>>,
}

impl RemoteError {
    /// An error without a parameter.
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            parameter: None,
        }
    }

    /// An error carrying an encoded parameter value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the parameter cannot be encoded.
    pub fn with_parameter<T: Serialize>(code: ErrorCode, parameter: &T) -> Result<Self, CodecError> {
        Ok(Self {
            code,
            parameter: Some(encode_payload(parameter)?),
        })
    }

    /// Decodes the parameter as `T`. Returns `None` when the error has no parameter.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the parameter bytes do not describe a `T`.
    pub fn parameter<T: DeserializeOwned>(&self) -> Result<Option<T>, CodecError> {
        self.parameter
            .as_deref()
            .map(decode_payload::<T>)
            .transpose()
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote error {}", self.code)
    }
}

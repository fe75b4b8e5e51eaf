//! Payload codec for operation arguments, results, and error parameters.
//!
//! Payloads travel inside PDUs as opaque byte strings. Each payload is a
//! named `MsgPack` encoding (`rmp_serde::to_vec_named()`) of the declared
//! Rust type, so peers decode them with the same serde definitions.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors produced while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("failed to decode {type_name}: {source}")]
    Decode {
        type_name: &'static str,
        #[source]
        source: rmp_serde::decode::Error,
    },
}

/// Encodes a payload value into its wire bytes.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the value cannot be serialized.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|source| CodecError::Encode {
        type_name: std::any::type_name::<T>(),
        source,
    })
}

/// Decodes wire bytes into a payload value of the expected type.
///
/// # Errors
///
/// Returns `CodecError::Decode` if the bytes do not describe a `T`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|source| CodecError::Decode {
        type_name: std::any::type_name::<T>(),
        source,
    })
}

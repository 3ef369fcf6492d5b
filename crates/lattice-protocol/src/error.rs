//! Protocol-level errors.

use thiserror::Error;

/// Failures while validating, encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialized message exceeds the size cap.
    #[error("message size {size} exceeds limit of {limit} bytes")]
    Oversized { size: usize, limit: usize },

    /// Method name does not follow `<domain>.<action>[.<type>]`.
    #[error("invalid method name: {0:?}")]
    InvalidMethod(String),

    /// A required field is empty or missing.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Message was produced by an incompatible protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Malformed JSON or wrong message shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

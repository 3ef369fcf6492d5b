//! Hub and transport errors.

use std::time::Duration;

use lattice_protocol::ProtocolError;
use thiserror::Error;

/// Failures surfaced by the hub, router and transports.
#[derive(Debug, Error)]
pub enum HubError {
    /// The caller's local timeout fired before a response arrived.
    ///
    /// Distinct from [`HubError::Remote`]: the peer never answered.
    #[error("call to '{method}' timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },

    /// The peer answered with an ERROR message.
    #[error("peer error ({code}): {message}")]
    Remote { code: String, message: String },

    /// No registered transport is currently ready.
    #[error("no ready transport registered")]
    NoTransport,

    /// The transport exists but is not connected.
    #[error("transport is not ready")]
    NotReady,

    /// The transport or connection was closed.
    #[error("transport closed")]
    Closed,

    /// Connection establishment or write failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Wire-level validation or serialization failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

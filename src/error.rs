// ABOUTME: Error taxonomy for the MessagePack-RPC client and server
// ABOUTME: Mirrors the protocol-level error kinds from the wire spec with stable string names

use std::io;
use thiserror::Error;

/// Comprehensive error type for MessagePack-RPC operations.
///
/// `Display` strings are chosen to match what a caller sees when a
/// handler raises an exception on the server side: `Enhanced`
/// stringifies as `"{kind}: {message}"`. Method-not-found and
/// duplicate-registration aren't variants here: the server reports the
/// former as an `Enhanced{kind: "MethodNotFound", ..}` wire response
/// (so it surfaces to callers through `Enhanced`, not a dedicated
/// variant), and the latter is a registration-time failure with its
/// own type, [`crate::server::RegistrationError`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// Frame was the wrong shape or carried the wrong type tag.
    #[error("Invalid protocol: {0}")]
    Protocol(String),

    /// Generic RPC failure: the legacy single-string error field.
    #[error("{0}")]
    Generic(String),

    /// A response arrived whose `msg_id` didn't match the request it was
    /// read for.
    #[error("Invalid Message ID")]
    InvalidMessageId,

    /// Server handler raised an error; `kind` is the error catalog name,
    /// `message` its text.
    #[error("{kind}: {message}")]
    Enhanced { kind: String, message: String },

    /// I/O deadline exceeded.
    #[error("Operation timeout")]
    Timeout,

    /// Underlying transport failed.
    #[error("Connection error: {0}")]
    Io(#[from] io::Error),

    /// Connection closed cleanly while a response was still expected.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

impl RpcError {
    /// `true` if retrying the same call on a fresh connection is
    /// reasonable (i.e. the failure was transport-level, not a protocol
    /// or application-level rejection).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_) | RpcError::Timeout | RpcError::ConnectionClosed
        )
    }
}

/// Result type alias for MessagePack-RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

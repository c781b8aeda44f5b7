//! Error types for the netplay client.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when using the netplay client.
#[derive(Debug, Error)]
pub enum NetplayError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session is not connected, or the session task has stopped.
    #[error("not connected to server")]
    NotConnected,

    /// The connection did not open within the configured timeout.
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),

    /// Every reconnect attempt failed; the session stays disconnected until
    /// `connect` is called again.
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Number of attempts that were made.
        attempts: u32,
    },

    /// A remote procedure call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure modes of a remote procedure call.
///
/// Every variant reaches the caller of `call*`; none is swallowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The remote side has no handler registered for the method.
    #[error("unknown RPC method: {0}")]
    UnknownMethod(String),

    /// The remote handler returned an error (or panicked).
    #[error("RPC {method} failed: {message}")]
    Remote {
        /// Method that was called.
        method: String,
        /// Error message produced by the remote handler.
        message: String,
    },

    /// No response arrived before the call deadline.
    #[error("RPC {method} timed out after {timeout:?} (call {call_id})")]
    Timeout {
        /// Method that was called.
        method: String,
        /// Correlation id of the call.
        call_id: String,
        /// Configured call timeout.
        timeout: Duration,
    },

    /// The call was rejected by `clear_pending`.
    #[error("RPC {method} cancelled: pending calls cleared")]
    Cancelled {
        /// Method that was called.
        method: String,
    },
}

/// A specialized [`Result`] type for netplay client operations.
pub type Result<T> = std::result::Result<T, NetplayError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_method() {
        let err = RpcError::Timeout {
            method: "foo".into(),
            call_id: "abc-1".into(),
            timeout: Duration::from_millis(250),
        };
        let text = err.to_string();
        assert!(text.contains("foo"), "{text}");
        assert!(text.contains("abc-1"), "{text}");
    }

    #[test]
    fn rpc_error_is_transparent_inside_netplay_error() {
        let err: NetplayError = RpcError::UnknownMethod("spawn".into()).into();
        assert_eq!(err.to_string(), "unknown RPC method: spawn");
    }
}

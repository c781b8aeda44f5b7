//! Transport abstraction for the netplay wire protocol.
//!
//! A [`Transport`] is one open, bidirectional channel of JSON text messages.
//! A [`Connector`] opens transports: the session calls it for the first
//! connect and again for every reconnect attempt, so reconnection works with
//! any transport without the transport knowing about it.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use netplay_client::error::NetplayError;
//! use netplay_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), NetplayError> {
//!         // Send the JSON text message
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, NetplayError>> {
//!         // Receive the next JSON text message; None on clean close
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), NetplayError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(
//!         &self,
//!         session_id: Option<String>,
//!     ) -> Result<Box<dyn Transport>, NetplayError> {
//!         Ok(Box::new(MyTransport { /* ... */ }))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::NetplayError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON message
/// and each call to [`recv`](Transport::recv) returns one.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the session loop
/// polls it inside `tokio::select!`. Channel-based implementations are
/// naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::TransportSend`] if the message could not be
    /// sent. The session treats this as a lost connection and keeps the
    /// message queued.
    async fn send(&mut self, message: String) -> Result<(), NetplayError>;

    /// Receive the next JSON text message.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed
    async fn recv(&mut self) -> Option<Result<String, NetplayError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources.
    async fn close(&mut self) -> Result<(), NetplayError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), NetplayError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, NetplayError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), NetplayError> {
        (**self).close().await
    }
}

/// Opens fresh [`Transport`]s.
///
/// `session_id` is the id passed to `connect`, or the id the server assigned
/// in its `welcome`, so a reconnect can resume the same session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport.
    ///
    /// # Errors
    ///
    /// Any error counts as a failed connection attempt.
    async fn connect(&self, session_id: Option<String>)
        -> Result<Box<dyn Transport>, NetplayError>;
}

//! Transport implementations for the netplay wire protocol.
//!
//! | Feature                | Transport              | Connector              |
//! |------------------------|------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] | [`WebSocketConnector`] |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), netplay_client::NetplayError> {
//! use netplay_client::{NetplayConfig, NetplaySession, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:8080/netplay");
//! let (session, mut events) = NetplaySession::start(connector, NetplayConfig::new());
//! session.connect(None).await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};

//! # Netplay Client
//!
//! Transport-agnostic multiplayer networking layer for game clients: a
//! reconnecting connection with heartbeats, a lobby protocol, entity state
//! replication with delta updates and rollback history, a per-player input
//! buffer with prediction, and request/response RPC.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Connector`] and [`Transport`] for any backend
//! - **One owner**: a single session task owns all state; the handle ships calls to it
//! - **Closed decoding**: unknown or malformed messages are dropped, never guessed at
//! - **WebSocket built-in**: the default `transport-websocket` feature provides [`WebSocketConnector`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netplay_client::{NetplayConfig, NetplayEvent, NetplaySession, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:8080/netplay");
//! let (mut session, mut events) = NetplaySession::start(connector, NetplayConfig::new());
//! session.connect(None).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let NetplayEvent::Welcome { player_id, .. } = event {
//!         session.join_lobby("L1", "Alice", None).await?;
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod input;
pub mod lobby;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod sync;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use config::{NetplayConfig, SyncStrategy};
pub use connection::{ConnectionState, HandlerId};
pub use error::{NetplayError, RpcError};
pub use error_codes::ErrorCode;
pub use event::NetplayEvent;
pub use input::{InputBuffer, InputExtra, InputFrame};
pub use lobby::Lobby;
pub use protocol::{Envelope, InputKeys, Message, MessageKind, RpcTarget};
pub use rpc::RpcRegistration;
pub use session::NetplaySession;
pub use sync::SyncedEntity;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};

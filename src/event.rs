//! Events emitted by a [`NetplaySession`](crate::session::NetplaySession).
//!
//! Events are delivered on the bounded channel returned from
//! [`NetplaySession::start`](crate::session::NetplaySession::start).

use std::time::Duration;

use serde_json::Value;

use crate::error_codes::ErrorCode;
use crate::lobby::Lobby;
use crate::protocol::{LobbyId, Message, PlayerId};

/// High-level events produced by the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayEvent {
    /// The transport opened.
    Connected,
    /// The server assigned this client its identity.
    Welcome {
        player_id: PlayerId,
        session_id: String,
        server_time: u64,
    },
    /// The connection was lost and a retry is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// A retry succeeded; queued messages are being flushed.
    Reconnected,
    /// The connection is down and no retry is scheduled.
    Disconnected { reason: Option<String> },
    /// A `lobby_update` for a new lobby arrived.
    LobbyJoined(Box<Lobby>),
    /// A `lobby_update` for the current lobby arrived.
    LobbyUpdated(Box<Lobby>),
    /// The local player left its lobby.
    LobbyLeft { lobby_id: LobbyId },
    /// The game started for every participant.
    GameStarted {
        lobby_id: LobbyId,
        seed: u64,
        initial_state: Value,
    },
    /// The game ended.
    GameEnded {
        reason: String,
        results: Option<Value>,
    },
    /// Another player joined the session.
    PlayerJoined {
        player_id: PlayerId,
        player_name: Option<String>,
    },
    /// Another player left the session.
    PlayerLeft {
        player_id: PlayerId,
        reason: Option<String>,
    },
    /// A remote player's input was stored in the input buffer.
    InputReceived { player_id: PlayerId, frame: u64 },
    /// A chat line arrived.
    Chat {
        sender_id: PlayerId,
        sender_name: String,
        message: String,
        channel: Option<String>,
    },
    /// The server reported an error.
    ServerError {
        code: ErrorCode,
        message: String,
        details: Option<Value>,
    },
    /// A heartbeat completed its round trip.
    Pong { rtt: Duration },
}

/// Output of a component step: messages to send and events to emit.
///
/// Components write into an `Effects` instead of touching the transport or
/// the event channel, so they stay synchronous and testable on their own.
#[derive(Debug, Default)]
pub struct Effects {
    pub messages: Vec<Message>,
    pub events: Vec<NetplayEvent>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn emit(&mut self, event: NetplayEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty()
    }
}

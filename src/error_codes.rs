//! Error codes carried by the `error` wire message.
//!
//! Codes travel as `SCREAMING_SNAKE_CASE` strings (e.g. `"LOBBY_FULL"`).
//! Codes this client does not know decode to [`ErrorCode::Other`] so a newer
//! server never causes an `error` message to be dropped as malformed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes reported by the session server.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    // Session errors
    Unauthorized,
    SessionNotFound,
    SessionExpired,

    // Validation errors
    InvalidMessage,
    InvalidPlayerName,
    MessageTooLarge,

    // Lobby errors
    LobbyNotFound,
    LobbyFull,
    AlreadyInLobby,
    NotInLobby,
    NotHost,
    GameAlreadyStarted,

    // Simulation errors
    UnknownEntity,
    NotEntityOwner,

    // Rate limiting
    RateLimitExceeded,

    // Server errors
    InternalError,
    ServiceUnavailable,

    /// A code this client version does not recognize.
    Other(String),
}

impl ErrorCode {
    /// Wire representation of this code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidPlayerName => "INVALID_PLAYER_NAME",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::LobbyNotFound => "LOBBY_NOT_FOUND",
            Self::LobbyFull => "LOBBY_FULL",
            Self::AlreadyInLobby => "ALREADY_IN_LOBBY",
            Self::NotInLobby => "NOT_IN_LOBBY",
            Self::NotHost => "NOT_HOST",
            Self::GameAlreadyStarted => "GAME_ALREADY_STARTED",
            Self::UnknownEntity => "UNKNOWN_ENTITY",
            Self::NotEntityOwner => "NOT_ENTITY_OWNER",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Other(code) => code,
        }
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => "The session was rejected. Credentials are missing or invalid.",
            Self::SessionNotFound => {
                "The requested session does not exist. Connect without a session id to start a new one."
            }
            Self::SessionExpired => {
                "The session expired while disconnected. Reconnect without a session id."
            }
            Self::InvalidMessage => "The server could not interpret a message sent by this client.",
            Self::InvalidPlayerName => {
                "The player name is invalid. Player names must be non-empty and meet length requirements."
            }
            Self::MessageTooLarge => {
                "The message size exceeds the maximum allowed limit. Please send a smaller message."
            }
            Self::LobbyNotFound => {
                "The requested lobby could not be found. It may have been closed or the id is incorrect."
            }
            Self::LobbyFull => "The lobby has reached its maximum player capacity.",
            Self::AlreadyInLobby => "You are already in a lobby. Leave it before joining another.",
            Self::NotInLobby => "You are not in a lobby. Join one before performing this action.",
            Self::NotHost => "Only the lobby host may perform this action.",
            Self::GameAlreadyStarted => "The game in this lobby has already started.",
            Self::UnknownEntity => "The referenced entity does not exist on the server.",
            Self::NotEntityOwner => "Only the owner of an entity may update it.",
            Self::RateLimitExceeded => {
                "Too many requests in a short time. Please slow down and try again later."
            }
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the issue persists."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
            Self::Other(_) => "An error code not known to this client version was reported.",
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "UNAUTHORIZED" => Self::Unauthorized,
            "SESSION_NOT_FOUND" => Self::SessionNotFound,
            "SESSION_EXPIRED" => Self::SessionExpired,
            "INVALID_MESSAGE" => Self::InvalidMessage,
            "INVALID_PLAYER_NAME" => Self::InvalidPlayerName,
            "MESSAGE_TOO_LARGE" => Self::MessageTooLarge,
            "LOBBY_NOT_FOUND" => Self::LobbyNotFound,
            "LOBBY_FULL" => Self::LobbyFull,
            "ALREADY_IN_LOBBY" => Self::AlreadyInLobby,
            "NOT_IN_LOBBY" => Self::NotInLobby,
            "NOT_HOST" => Self::NotHost,
            "GAME_ALREADY_STARTED" => Self::GameAlreadyStarted,
            "UNKNOWN_ENTITY" => Self::UnknownEntity,
            "NOT_ENTITY_OWNER" => Self::NotEntityOwner,
            "RATE_LIMIT_EXCEEDED" => Self::RateLimitExceeded,
            "INTERNAL_ERROR" => Self::InternalError,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable,
            _ => Self::Other(code),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Other(raw) => raw,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::LobbyFull).unwrap();
        assert_eq!(json, "\"LOBBY_FULL\"");
        let back: ErrorCode = serde_json::from_str("\"NOT_HOST\"").unwrap();
        assert_eq!(back, ErrorCode::NotHost);
    }

    #[test]
    fn unknown_code_is_preserved() {
        let code: ErrorCode = serde_json::from_str("\"SHARD_MIGRATING\"").unwrap();
        assert_eq!(code, ErrorCode::Other("SHARD_MIGRATING".into()));
        assert_eq!(
            serde_json::to_string(&code).unwrap(),
            "\"SHARD_MIGRATING\""
        );
    }

    #[test]
    fn every_known_code_round_trips_through_its_string() {
        let codes = [
            ErrorCode::Unauthorized,
            ErrorCode::SessionNotFound,
            ErrorCode::SessionExpired,
            ErrorCode::InvalidMessage,
            ErrorCode::InvalidPlayerName,
            ErrorCode::MessageTooLarge,
            ErrorCode::LobbyNotFound,
            ErrorCode::LobbyFull,
            ErrorCode::AlreadyInLobby,
            ErrorCode::NotInLobby,
            ErrorCode::NotHost,
            ErrorCode::GameAlreadyStarted,
            ErrorCode::UnknownEntity,
            ErrorCode::NotEntityOwner,
            ErrorCode::RateLimitExceeded,
            ErrorCode::InternalError,
            ErrorCode::ServiceUnavailable,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from(code.as_str().to_owned()), code);
            assert!(!code.description().is_empty());
        }
    }
}

//! Wire protocol for the netplay session server.
//!
//! Every frame on the wire is one JSON object: an envelope
//! `{ "type", "timestamp", "sequence"? }` flattened together with the
//! type-specific fields of a [`Message`]. Field names are camelCase and the
//! `type` discriminant is snake_case (`"state_delta"`, `"rpc_call"`, ...).
//!
//! Decoding is closed: a payload whose `type` is missing or unknown, or whose
//! fields do not match the variant, fails to decode and is dropped by the
//! session loop.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_codes::ErrorCode;

// ── Type aliases ────────────────────────────────────────────────────

/// Server-assigned player identifier.
pub type PlayerId = String;

/// Identifier of a synchronized entity.
pub type EntityId = String;

/// Identifier of a lobby.
pub type LobbyId = String;

/// Named component values of an entity.
pub type Components = serde_json::Map<String, Value>;

/// Milliseconds since the Unix epoch, as stamped on every outgoing envelope.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Envelope ────────────────────────────────────────────────────────

/// A message together with its envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The typed message body; its `type` tag lives at the top level.
    #[serde(flatten)]
    pub message: Message,
    /// Sender clock in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    /// Per-connection sequence number assigned by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl Envelope {
    /// Wrap a message, stamping the current time.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: now_millis(),
            sequence: None,
        }
    }

    /// Attach a sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

// ── Enums ───────────────────────────────────────────────────────────

/// Lobby lifecycle. Moves forward only: `Waiting → Starting → InGame`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LobbyState {
    #[default]
    Waiting,
    Starting,
    InGame,
}

impl LobbyState {
    fn rank(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Starting => 1,
            Self::InGame => 2,
        }
    }

    /// Returns the later of two states, so a stale update never moves a
    /// lobby backwards.
    pub fn advance(self, next: Self) -> Self {
        if next.rank() >= self.rank() {
            next
        } else {
            self
        }
    }
}

/// Kind of change carried by a [`EntityChange`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// Recipient selector of an RPC call.
///
/// Interpreted by the remote dispatcher only; on the wire it is an opaque
/// string: `"server"`, `"all"`, `"others"`, or a player id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RpcTarget {
    Server,
    All,
    Others,
    Client(PlayerId),
}

impl From<String> for RpcTarget {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "server" => Self::Server,
            "all" => Self::All,
            "others" => Self::Others,
            _ => Self::Client(raw),
        }
    }
}

impl From<RpcTarget> for String {
    fn from(target: RpcTarget) -> Self {
        match target {
            RpcTarget::Server => "server".into(),
            RpcTarget::All => "all".into(),
            RpcTarget::Others => "others".into(),
            RpcTarget::Client(id) => id,
        }
    }
}

impl fmt::Display for RpcTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::All => f.write_str("all"),
            Self::Others => f.write_str("others"),
            Self::Client(id) => f.write_str(id),
        }
    }
}

// ── Input bitmask ───────────────────────────────────────────────────

/// Boolean controls packed into bits 0–7 of an integer.
///
/// Encodes as the plain integer. Bits above 7 are kept as-is so a newer
/// peer's extra controls survive a round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputKeys(u32);

bitflags::bitflags! {
    impl InputKeys: u32 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const JUMP = 1 << 4;
        const ACTION1 = 1 << 5;
        const ACTION2 = 1 << 6;
        const ACTION3 = 1 << 7;
    }
}

impl InputKeys {
    /// Pack the eight standard controls.
    pub fn from_controls(controls: &Controls) -> Self {
        let mut keys = Self::empty();
        keys.set(Self::UP, controls.up);
        keys.set(Self::DOWN, controls.down);
        keys.set(Self::LEFT, controls.left);
        keys.set(Self::RIGHT, controls.right);
        keys.set(Self::JUMP, controls.jump);
        keys.set(Self::ACTION1, controls.action1);
        keys.set(Self::ACTION2, controls.action2);
        keys.set(Self::ACTION3, controls.action3);
        keys
    }

    /// Unpack the eight standard controls. Bits above 7 are ignored.
    pub fn to_controls(self) -> Controls {
        Controls {
            up: self.contains(Self::UP),
            down: self.contains(Self::DOWN),
            left: self.contains(Self::LEFT),
            right: self.contains(Self::RIGHT),
            jump: self.contains(Self::JUMP),
            action1: self.contains(Self::ACTION1),
            action2: self.contains(Self::ACTION2),
            action3: self.contains(Self::ACTION3),
        }
    }
}

/// The eight standard boolean controls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Controls {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
    pub action1: bool,
    pub action2: bool,
    pub action3: bool,
}

// ── Structs ─────────────────────────────────────────────────────────

/// A player entry in a lobby roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    pub id: PlayerId,
    pub name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub is_ready: bool,
}

/// Parameters for creating a lobby, sent inside `join_lobby`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyConfig {
    pub name: String,
    pub max_players: u32,
    #[serde(default)]
    pub settings: Components,
}

impl LobbyConfig {
    /// A lobby named `name` for at most `max_players`.
    pub fn new(name: impl Into<String>, max_players: u32) -> Self {
        Self {
            name: name.into(),
            max_players,
            settings: Components::new(),
        }
    }

    /// Set the initial lobby settings.
    #[must_use]
    pub fn with_settings(mut self, settings: Components) -> Self {
        self.settings = settings;
        self
    }
}

/// Input for one frame as carried by `player_input`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    pub keys: InputKeys,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse_x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse_y: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse_buttons: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// Full state of one entity inside `state_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub owner_id: PlayerId,
    #[serde(default)]
    pub components: Components,
}

/// One entry of a `state_delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_id: EntityId,
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Components>,
    /// Owner of a created entity, when the sender knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<PlayerId>,
}

// ── Payload structs ─────────────────────────────────────────────────

/// Payload of `lobby_update`: the authoritative lobby state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyUpdatePayload {
    pub lobby_id: LobbyId,
    pub players: Vec<LobbyPlayer>,
    pub state: LobbyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Components>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// Payload of `player_input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInputPayload {
    pub player_id: PlayerId,
    pub frame: u64,
    pub inputs: InputPayload,
}

/// Payload of `state_sync`: a full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncPayload {
    pub frame: u64,
    pub entities: Vec<EntitySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
}

/// Payload of `state_delta`: changes since `base_frame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDeltaPayload {
    pub frame: u64,
    pub base_frame: u64,
    pub changes: Vec<EntityChange>,
}

/// Payload of `rpc_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCallPayload {
    pub call_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub target: RpcTarget,
}

/// Payload of `rpc_response`. Exactly one of `result` / `error` is expected;
/// a present `error` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponsePayload {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Every message type of the protocol, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// First message from the server: assigns identity.
    Welcome {
        player_id: PlayerId,
        session_id: String,
        #[serde(default)]
        server_time: u64,
    },
    /// Heartbeat.
    Ping,
    /// Heartbeat reply.
    Pong {
        #[serde(default)]
        server_time: u64,
    },
    /// Join (or, with `create`, create) a lobby.
    JoinLobby {
        lobby_id: LobbyId,
        player_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        create: Option<LobbyConfig>,
    },
    /// Leave a lobby.
    LeaveLobby { lobby_id: LobbyId },
    /// Authoritative lobby state.
    LobbyUpdate(LobbyUpdatePayload),
    /// Toggle the local player's ready flag.
    PlayerReady { lobby_id: LobbyId, ready: bool },
    /// Host request to change lobby settings.
    UpdateSettings {
        lobby_id: LobbyId,
        settings: Components,
    },
    /// Game start, proposed by the host and confirmed by the server.
    GameStart {
        lobby_id: LobbyId,
        seed: u64,
        #[serde(default)]
        initial_state: Value,
    },
    /// Game over.
    GameEnd {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<Value>,
    },
    /// A player joined the session.
    PlayerJoin {
        player_id: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_name: Option<String>,
    },
    /// A player left the session.
    PlayerLeave {
        player_id: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Control input for one frame.
    PlayerInput(PlayerInputPayload),
    /// Full entity snapshot.
    StateSync(StateSyncPayload),
    /// Entity changes since a base frame.
    StateDelta(StateDeltaPayload),
    /// An entity was created.
    EntitySpawn {
        entity_id: EntityId,
        owner_id: PlayerId,
        #[serde(default)]
        components: Components,
    },
    /// An entity was removed.
    EntityDestroy { entity_id: EntityId },
    /// Component changes for one entity.
    EntityUpdate {
        entity_id: EntityId,
        #[serde(default)]
        components: Components,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<PlayerId>,
    },
    /// Remote procedure call request.
    RpcCall(RpcCallPayload),
    /// Remote procedure call response.
    RpcResponse(RpcResponsePayload),
    /// Chat line.
    Chat {
        sender_id: PlayerId,
        sender_name: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    /// Error reported by the server.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

/// Discriminant of a [`Message`], used to register typed handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Welcome,
    Ping,
    Pong,
    JoinLobby,
    LeaveLobby,
    LobbyUpdate,
    PlayerReady,
    UpdateSettings,
    GameStart,
    GameEnd,
    PlayerJoin,
    PlayerLeave,
    PlayerInput,
    StateSync,
    StateDelta,
    EntitySpawn,
    EntityDestroy,
    EntityUpdate,
    RpcCall,
    RpcResponse,
    Chat,
    Error,
}

impl MessageKind {
    /// The wire `type` string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::JoinLobby => "join_lobby",
            Self::LeaveLobby => "leave_lobby",
            Self::LobbyUpdate => "lobby_update",
            Self::PlayerReady => "player_ready",
            Self::UpdateSettings => "update_settings",
            Self::GameStart => "game_start",
            Self::GameEnd => "game_end",
            Self::PlayerJoin => "player_join",
            Self::PlayerLeave => "player_leave",
            Self::PlayerInput => "player_input",
            Self::StateSync => "state_sync",
            Self::StateDelta => "state_delta",
            Self::EntitySpawn => "entity_spawn",
            Self::EntityDestroy => "entity_destroy",
            Self::EntityUpdate => "entity_update",
            Self::RpcCall => "rpc_call",
            Self::RpcResponse => "rpc_response",
            Self::Chat => "chat",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    /// The discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Welcome { .. } => MessageKind::Welcome,
            Self::Ping => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::JoinLobby { .. } => MessageKind::JoinLobby,
            Self::LeaveLobby { .. } => MessageKind::LeaveLobby,
            Self::LobbyUpdate(_) => MessageKind::LobbyUpdate,
            Self::PlayerReady { .. } => MessageKind::PlayerReady,
            Self::UpdateSettings { .. } => MessageKind::UpdateSettings,
            Self::GameStart { .. } => MessageKind::GameStart,
            Self::GameEnd { .. } => MessageKind::GameEnd,
            Self::PlayerJoin { .. } => MessageKind::PlayerJoin,
            Self::PlayerLeave { .. } => MessageKind::PlayerLeave,
            Self::PlayerInput(_) => MessageKind::PlayerInput,
            Self::StateSync(_) => MessageKind::StateSync,
            Self::StateDelta(_) => MessageKind::StateDelta,
            Self::EntitySpawn { .. } => MessageKind::EntitySpawn,
            Self::EntityDestroy { .. } => MessageKind::EntityDestroy,
            Self::EntityUpdate { .. } => MessageKind::EntityUpdate,
            Self::RpcCall(_) => MessageKind::RpcCall,
            Self::RpcResponse(_) => MessageKind::RpcResponse,
            Self::Chat { .. } => MessageKind::Chat,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn welcome_decodes_from_camel_case() {
        let raw = r#"{"type":"welcome","timestamp":5,"playerId":"p1","sessionId":"s1","serverTime":99}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.timestamp, 5);
        assert_eq!(
            env.message,
            Message::Welcome {
                player_id: "p1".into(),
                session_id: "s1".into(),
                server_time: 99,
            }
        );
    }

    #[test]
    fn envelope_flattens_type_and_sequence() {
        let env = Envelope::new(Message::Ping).with_sequence(7);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["sequence"], 7);
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn missing_type_is_rejected() {
        let raw = r#"{"timestamp":1,"playerId":"p1","sessionId":"s1"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"teleport","timestamp":1}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn wrong_field_shape_is_rejected() {
        let raw = r#"{"type":"state_delta","frame":"soon","baseFrame":0,"changes":[]}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn state_delta_wire_shape() {
        let mut components = Components::new();
        components.insert("x".into(), json!(5));
        let env = Envelope::new(Message::StateDelta(StateDeltaPayload {
            frame: 3,
            base_frame: 1,
            changes: vec![EntityChange {
                entity_id: "p1".into(),
                operation: ChangeOperation::Update,
                components: Some(components),
                owner_id: None,
            }],
        }));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "state_delta");
        assert_eq!(value["baseFrame"], 1);
        assert_eq!(
            value["changes"][0],
            json!({"entityId": "p1", "operation": "update", "components": {"x": 5}})
        );
    }

    #[test]
    fn rpc_target_is_an_opaque_string() {
        let payload = RpcCallPayload {
            call_id: "c-1".into(),
            method: "heal".into(),
            args: vec![json!(1)],
            target: RpcTarget::Client("p9".into()),
        };
        let value = serde_json::to_value(Message::RpcCall(payload)).unwrap();
        assert_eq!(value["type"], "rpc_call");
        assert_eq!(value["callId"], "c-1");
        assert_eq!(value["target"], "p9");

        let others: RpcTarget = serde_json::from_value(json!("others")).unwrap();
        assert_eq!(others, RpcTarget::Others);
    }

    #[test]
    fn lobby_state_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(LobbyState::InGame).unwrap(),
            json!("in_game")
        );
    }

    #[test]
    fn lobby_state_never_moves_backwards() {
        assert_eq!(
            LobbyState::InGame.advance(LobbyState::Waiting),
            LobbyState::InGame
        );
        assert_eq!(
            LobbyState::Waiting.advance(LobbyState::Starting),
            LobbyState::Starting
        );
    }

    #[test]
    fn input_keys_pack_controls_into_low_bits() {
        let controls = Controls {
            up: true,
            jump: true,
            action3: true,
            ..Controls::default()
        };
        let keys = InputKeys::from_controls(&controls);
        assert_eq!(keys.bits(), 0b1001_0001);
        assert_eq!(keys.to_controls(), controls);
        assert!(keys.contains(InputKeys::UP | InputKeys::JUMP));
        assert!(!keys.contains(InputKeys::DOWN));
    }

    #[test]
    fn input_keys_encode_as_plain_integer_keeping_unknown_bits() {
        let keys = InputKeys::LEFT | InputKeys::from_bits_retain(1 << 12);
        assert_eq!(serde_json::to_value(keys).unwrap(), serde_json::json!(4100));
        let back: InputKeys = serde_json::from_str("4100").unwrap();
        assert_eq!(back, keys);
        assert!(back.to_controls().left);
    }

    #[test]
    fn kind_matches_wire_type() {
        let msg = Message::LeaveLobby {
            lobby_id: "L1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind().as_str());
    }
}

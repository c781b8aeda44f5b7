//! Lobby protocol: join, leave, readiness and host-gated game start.
//!
//! [`LobbyClient`] tracks the lobby the local player is in. Requests are sent
//! optimistically but the lobby itself is only adopted from the server's
//! `lobby_update`. Leaving is the exception: local state is cleared at once.
//!
//! Only the host (the roster entry flagged `isHost`) may start the game or
//! change settings. A non-host attempt is logged and ignored.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::event::{Effects, NetplayEvent};
use crate::protocol::{
    now_millis, Components, LobbyConfig, LobbyId, LobbyPlayer, LobbyState, LobbyUpdatePayload,
    Message, PlayerId,
};

/// The lobby as last reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Lobby {
    pub id: LobbyId,
    pub name: String,
    pub host_id: PlayerId,
    pub players: Vec<LobbyPlayer>,
    pub max_players: u32,
    pub state: LobbyState,
    pub settings: Components,
    pub created_at: u64,
}

impl Lobby {
    /// The roster entry of `player_id`.
    pub fn player(&self, player_id: &str) -> Option<&LobbyPlayer> {
        self.players.iter().find(|p| p.id == player_id)
    }

    /// `true` if every non-host player is ready. The host is exempt.
    pub fn all_players_ready(&self) -> bool {
        self.players.iter().filter(|p| !p.is_host).all(|p| p.is_ready)
    }
}

/// Client side of the lobby protocol.
#[derive(Debug, Default)]
pub struct LobbyClient {
    local_player: Option<PlayerId>,
    lobby: Option<Lobby>,
}

impl LobbyClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the identity assigned by the server's `welcome`.
    pub fn set_local_player(&mut self, player_id: impl Into<PlayerId>) {
        self.local_player = Some(player_id.into());
    }

    pub fn local_player(&self) -> Option<&str> {
        self.local_player.as_deref()
    }

    pub fn current(&self) -> Option<&Lobby> {
        self.lobby.as_ref()
    }

    /// `true` if the local player is the host of the current lobby.
    pub fn is_host(&self) -> bool {
        match (&self.lobby, &self.local_player) {
            (Some(lobby), Some(me)) => lobby.host_id == *me,
            _ => false,
        }
    }

    /// `true` iff every non-host player of the current lobby is ready.
    pub fn all_players_ready(&self) -> bool {
        self.lobby.as_ref().is_some_and(Lobby::all_players_ready)
    }

    /// Ask the server to create a lobby and join it. Returns the proposed
    /// lobby id.
    pub fn create_lobby(
        &mut self,
        player_name: &str,
        config: LobbyConfig,
        fx: &mut Effects,
    ) -> LobbyId {
        let lobby_id = uuid::Uuid::new_v4().to_string();
        debug!(lobby_id = %lobby_id, name = %config.name, "requesting lobby creation");
        fx.send(Message::JoinLobby {
            lobby_id: lobby_id.clone(),
            player_name: player_name.to_owned(),
            player_data: None,
            create: Some(config),
        });
        lobby_id
    }

    /// Ask the server to join an existing lobby.
    pub fn join_lobby(
        &mut self,
        lobby_id: &str,
        player_name: &str,
        player_data: Option<Value>,
        fx: &mut Effects,
    ) {
        debug!(lobby_id = %lobby_id, "requesting lobby join");
        fx.send(Message::JoinLobby {
            lobby_id: lobby_id.to_owned(),
            player_name: player_name.to_owned(),
            player_data,
            create: None,
        });
    }

    /// Leave the current lobby without waiting for a reply.
    pub fn leave_lobby(&mut self, fx: &mut Effects) {
        let Some(lobby) = self.lobby.take() else {
            debug!("leave_lobby: not in a lobby");
            return;
        };
        info!(lobby_id = %lobby.id, "leaving lobby");
        fx.send(Message::LeaveLobby {
            lobby_id: lobby.id.clone(),
        });
        fx.emit(NetplayEvent::LobbyLeft { lobby_id: lobby.id });
    }

    /// Set the local player's ready flag.
    pub fn set_ready(&mut self, ready: bool, fx: &mut Effects) {
        let Some(lobby) = &self.lobby else {
            warn!("set_ready: not in a lobby");
            return;
        };
        fx.send(Message::PlayerReady {
            lobby_id: lobby.id.clone(),
            ready,
        });
    }

    /// Propose starting the game. Host only; moves the lobby to `Starting`.
    /// Returns the proposed seed.
    pub fn start_game(&mut self, initial_state: Value, fx: &mut Effects) -> Option<u64> {
        if !self.is_host() {
            warn!(
                player = ?self.local_player,
                "start_game ignored: local player is not the lobby host"
            );
            return None;
        }
        let lobby = self.lobby.as_mut()?;
        let seed = rand::random::<u64>();
        lobby.state = lobby.state.advance(LobbyState::Starting);
        info!(lobby_id = %lobby.id, seed, "proposing game start");
        fx.send(Message::GameStart {
            lobby_id: lobby.id.clone(),
            seed,
            initial_state,
        });
        Some(seed)
    }

    /// Ask the server to change lobby settings. Host only; the change is
    /// applied when the server echoes it in a `lobby_update`.
    pub fn update_settings(&mut self, settings: Components, fx: &mut Effects) -> bool {
        if !self.is_host() {
            warn!(
                player = ?self.local_player,
                "update_settings ignored: local player is not the lobby host"
            );
            return false;
        }
        let Some(lobby) = &self.lobby else {
            return false;
        };
        fx.send(Message::UpdateSettings {
            lobby_id: lobby.id.clone(),
            settings,
        });
        true
    }

    /// Apply an authoritative `lobby_update`.
    pub fn handle_lobby_update(&mut self, update: LobbyUpdatePayload, fx: &mut Effects) {
        let host_id = update
            .players
            .iter()
            .find(|p| p.is_host)
            .map(|p| p.id.clone());

        let current = self
            .lobby
            .as_mut()
            .filter(|lobby| lobby.id == update.lobby_id);

        match current {
            Some(lobby) => {
                if let Some(host_id) = host_id {
                    lobby.host_id = host_id;
                }
                lobby.players = update.players;
                lobby.state = lobby.state.advance(update.state);
                if let Some(settings) = update.settings {
                    lobby.settings = settings;
                }
                if let Some(name) = update.name {
                    lobby.name = name;
                }
                if let Some(max_players) = update.max_players {
                    lobby.max_players = max_players;
                }
                debug!(lobby_id = %lobby.id, players = lobby.players.len(), "lobby updated");
                fx.emit(NetplayEvent::LobbyUpdated(Box::new(lobby.clone())));
            }
            None => {
                let max_players = update
                    .max_players
                    .unwrap_or_else(|| update.players.len() as u32);
                let lobby = Lobby {
                    name: update.name.unwrap_or_else(|| update.lobby_id.clone()),
                    id: update.lobby_id,
                    host_id: host_id.unwrap_or_default(),
                    players: update.players,
                    max_players,
                    state: update.state,
                    settings: update.settings.unwrap_or_default(),
                    created_at: update.created_at.unwrap_or_else(now_millis),
                };
                info!(lobby_id = %lobby.id, host = %lobby.host_id, "joined lobby");
                fx.emit(NetplayEvent::LobbyJoined(Box::new(lobby.clone())));
                self.lobby = Some(lobby);
            }
        }
    }

    /// Apply a `game_start`. Every participant moves to `InGame`.
    pub fn handle_game_start(
        &mut self,
        lobby_id: LobbyId,
        seed: u64,
        initial_state: Value,
        fx: &mut Effects,
    ) {
        match self.lobby.as_mut() {
            Some(lobby) if lobby.id == lobby_id => {
                lobby.state = LobbyState::InGame;
                info!(lobby_id = %lobby_id, seed, "game started");
                fx.emit(NetplayEvent::GameStarted {
                    lobby_id,
                    seed,
                    initial_state,
                });
            }
            _ => warn!(lobby_id = %lobby_id, "game_start for a lobby we are not in; ignored"),
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

    fn player(id: &str, is_host: bool, is_ready: bool) -> LobbyPlayer {
        LobbyPlayer {
            id: id.into(),
            name: id.to_uppercase(),
            is_host,
            is_ready,
        }
    }

    fn update(lobby_id: &str, players: Vec<LobbyPlayer>) -> LobbyUpdatePayload {
        LobbyUpdatePayload {
            lobby_id: lobby_id.into(),
            players,
            state: LobbyState::Waiting,
            settings: None,
            name: None,
            max_players: Some(4),
            created_at: Some(1),
        }
    }

    fn joined_as(me: &str, host: &str) -> LobbyClient {
        let mut lobby = LobbyClient::new();
        lobby.set_local_player(me);
        let mut fx = Effects::new();
        lobby.handle_lobby_update(
            update("L1", vec![player(host, true, false), player("b", false, false)]),
            &mut fx,
        );
        lobby
    }

    #[test]
    fn join_request_does_not_apply_lobby_locally() {
        let mut lobby = LobbyClient::new();
        let mut fx = Effects::new();
        lobby.join_lobby("L1", "Alice", None, &mut fx);
        assert!(lobby.current().is_none());
        assert!(matches!(
            fx.messages.as_slice(),
            [Message::JoinLobby { lobby_id, create: None, .. }] if lobby_id == "L1"
        ));
    }

    #[test]
    fn create_request_carries_config() {
        let mut lobby = LobbyClient::new();
        let mut fx = Effects::new();
        let id = lobby.create_lobby("Alice", LobbyConfig::new("Friday night", 8), &mut fx);
        match fx.messages.as_slice() {
            [Message::JoinLobby {
                lobby_id,
                create: Some(config),
                ..
            }] => {
                assert_eq!(*lobby_id, id);
                assert_eq!(config.max_players, 8);
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn first_update_joins_second_updates() {
        let mut lobby = LobbyClient::new();
        let mut fx = Effects::new();
        lobby.handle_lobby_update(
            update("L1", vec![player("a", true, false), player("b", false, false)]),
            &mut fx,
        );
        lobby.handle_lobby_update(
            update(
                "L1",
                vec![
                    player("a", true, false),
                    player("b", false, false),
                    player("c", false, false),
                ],
            ),
            &mut fx,
        );
        assert!(matches!(fx.events[0], NetplayEvent::LobbyJoined(_)));
        assert!(matches!(&fx.events[1], NetplayEvent::LobbyUpdated(l) if l.players.len() == 3));
        assert_eq!(fx.events.len(), 2);
        assert_eq!(lobby.current().unwrap().host_id, "a");
    }

    #[test]
    fn update_for_other_lobby_is_a_join() {
        let mut lobby = joined_as("b", "a");
        let mut fx = Effects::new();
        lobby.handle_lobby_update(update("L2", vec![player("z", true, false)]), &mut fx);
        assert!(matches!(fx.events.as_slice(), [NetplayEvent::LobbyJoined(l)] if l.id == "L2"));
    }

    #[test]
    fn leave_is_optimistic() {
        let mut lobby = joined_as("b", "a");
        let mut fx = Effects::new();
        lobby.leave_lobby(&mut fx);
        assert!(lobby.current().is_none());
        assert!(matches!(fx.messages.as_slice(), [Message::LeaveLobby { .. }]));
        assert!(matches!(
            fx.events.as_slice(),
            [NetplayEvent::LobbyLeft { lobby_id }] if lobby_id == "L1"
        ));
    }

    #[test]
    fn non_host_cannot_start_or_change_settings() {
        let mut lobby = joined_as("b", "a");
        let before = lobby.current().cloned();
        let mut fx = Effects::new();

        assert!(lobby.start_game(json!({}), &mut fx).is_none());
        assert!(!lobby.update_settings(Components::new(), &mut fx));

        assert!(fx.is_empty());
        assert_eq!(lobby.current().cloned(), before);
    }

    #[test]
    fn host_start_proposes_seed_and_moves_to_starting() {
        let mut lobby = joined_as("a", "a");
        let mut fx = Effects::new();
        let seed = lobby.start_game(json!({"map": "arena"}), &mut fx).unwrap();
        assert_eq!(lobby.current().unwrap().state, LobbyState::Starting);
        match fx.messages.as_slice() {
            [Message::GameStart {
                seed: sent,
                initial_state,
                ..
            }] => {
                assert_eq!(*sent, seed);
                assert_eq!(initial_state["map"], "arena");
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn game_start_moves_every_participant_in_game() {
        let mut lobby = joined_as("b", "a");
        let mut fx = Effects::new();
        lobby.handle_game_start("L1".into(), 42, json!(null), &mut fx);
        assert_eq!(lobby.current().unwrap().state, LobbyState::InGame);
        assert!(matches!(
            fx.events.as_slice(),
            [NetplayEvent::GameStarted { seed: 42, .. }]
        ));

        // A later waiting update cannot move the lobby back.
        lobby.handle_lobby_update(update("L1", vec![player("a", true, true)]), &mut fx);
        assert_eq!(lobby.current().unwrap().state, LobbyState::InGame);
    }

    #[test]
    fn game_start_for_unknown_lobby_is_ignored() {
        let mut lobby = joined_as("b", "a");
        let mut fx = Effects::new();
        lobby.handle_game_start("L9".into(), 1, json!(null), &mut fx);
        assert!(fx.is_empty());
        assert_eq!(lobby.current().unwrap().state, LobbyState::Waiting);
    }

    #[test]
    fn host_is_exempt_from_readiness() {
        let mut lobby = LobbyClient::new();
        let mut fx = Effects::new();
        assert!(!lobby.all_players_ready());

        lobby.handle_lobby_update(
            update("L1", vec![player("a", true, false), player("b", false, true)]),
            &mut fx,
        );
        assert!(lobby.all_players_ready());

        lobby.handle_lobby_update(
            update(
                "L1",
                vec![
                    player("a", true, false),
                    player("b", false, true),
                    player("c", false, false),
                ],
            ),
            &mut fx,
        );
        assert!(!lobby.all_players_ready());
    }

    #[test]
    fn host_follows_roster_flag() {
        let mut lobby = joined_as("b", "a");
        let mut fx = Effects::new();
        lobby.handle_lobby_update(
            update("L1", vec![player("a", false, false), player("b", true, false)]),
            &mut fx,
        );
        assert!(lobby.is_host());
        assert!(lobby.update_settings(Components::new(), &mut fx));
    }
}

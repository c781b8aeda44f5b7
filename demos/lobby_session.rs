//! # Lobby Session Example
//!
//! Connects to a netplay server over WebSocket and walks through a lobby:
//!
//! 1. Connect and wait for the server's `welcome`
//! 2. Join (or create) a lobby and mark the local player ready
//! 3. Start the game as host once everyone is ready
//! 4. Send one input per frame while the game runs
//! 5. Shut down on Ctrl+C, game end, or disconnect
//!
//! ## Running
//!
//! ```sh
//! # Start a netplay server on localhost:8080, then:
//! cargo run --example lobby_session
//!
//! # Override the server URL or lobby:
//! NETPLAY_URL=ws://my-server:8080/netplay NETPLAY_LOBBY=friday cargo run --example lobby_session
//! ```

use std::time::Duration;

use netplay_client::{
    InputExtra, InputKeys, NetplayConfig, NetplayEvent, NetplaySession, WebSocketConnector,
};

const DEFAULT_URL: &str = "ws://localhost:8080/netplay";
const DEFAULT_LOBBY: &str = "example-lobby";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for the session loop's own output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("NETPLAY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let lobby_id = std::env::var("NETPLAY_LOBBY").unwrap_or_else(|_| DEFAULT_LOBBY.to_string());
    tracing::info!("Connecting to {url}");

    let config = NetplayConfig::new()
        .with_heartbeat_interval(Duration::from_secs(2))
        .with_max_reconnect_attempts(3);
    let (mut session, mut events) = NetplaySession::start(WebSocketConnector::new(url), config);
    session.connect(None).await?;

    // ── Event loop ──────────────────────────────────────────────────
    let mut frames = tokio::time::interval(Duration::from_millis(50));
    let mut frame: u64 = 0;
    let mut in_game = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };

                match event {
                    NetplayEvent::Welcome { player_id, .. } => {
                        tracing::info!("Welcomed as {player_id}");
                        session.join_lobby(lobby_id.as_str(), "RustPlayer", None).await?;
                    }

                    NetplayEvent::LobbyJoined(lobby) => {
                        tracing::info!(
                            "Joined lobby {} ({} player(s))",
                            lobby.id,
                            lobby.players.len()
                        );
                        session.set_ready(true).await?;
                    }

                    NetplayEvent::LobbyUpdated(lobby) => {
                        tracing::info!("Lobby {} is now {:?}", lobby.id, lobby.state);
                        if session.is_host().await? && session.all_players_ready().await? {
                            if let Some(seed) = session.start_game(serde_json::json!({})).await? {
                                tracing::info!("Proposed game start with seed {seed}");
                            }
                        }
                    }

                    NetplayEvent::GameStarted { seed, .. } => {
                        tracing::info!("Game started (seed {seed})");
                        in_game = true;
                    }

                    NetplayEvent::GameEnded { reason, .. } => {
                        tracing::info!("Game ended: {reason}");
                        break;
                    }

                    NetplayEvent::Reconnecting { attempt, delay } => {
                        tracing::warn!("Connection lost, retry {attempt} in {delay:?}");
                    }

                    NetplayEvent::ServerError { code, message, .. } => {
                        tracing::error!("Server error [{}]: {message}", code.as_str());
                    }

                    NetplayEvent::Disconnected { reason } => {
                        tracing::warn!("Disconnected: {}", reason.as_deref().unwrap_or("unknown"));
                        break;
                    }

                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }
            }

            _ = frames.tick(), if in_game => {
                frame += 1;
                let keys = if frame % 2 == 0 {
                    InputKeys::RIGHT
                } else {
                    InputKeys::RIGHT | InputKeys::JUMP
                };
                session.send_input(frame, keys, InputExtra::default()).await?;
                session.tick().await?;
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    session.shutdown().await;
    tracing::info!("Session shut down after {frame} frame(s)");
    Ok(())
}

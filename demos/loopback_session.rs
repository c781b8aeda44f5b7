//! # Loopback Session Example
//!
//! Implements [`Connector`] and [`Transport`] over in-process channels and
//! plays a tiny scripted server against a [`NetplaySession`]. Useful as a
//! template for:
//!
//! - **Testing** game logic without a real server
//! - **Custom backends** (TCP, QUIC, WebRTC data channels)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use async_trait::async_trait;
use netplay_client::protocol::{LobbyPlayer, LobbyState, LobbyUpdatePayload, RpcResponsePayload};
use netplay_client::{
    Connector, Envelope, InputExtra, InputKeys, Message, NetplayConfig, NetplayError,
    NetplayEvent, NetplaySession, Transport,
};
use serde_json::json;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-backed transport
// ─────────────────────────────────────────────────────────────────────

/// Client half of a loopback connection.
struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), NetplayError> {
        self.tx
            .send(message)
            .map_err(|e| NetplayError::TransportSend(e.to_string()))
    }

    /// `None` once the server task drops its sender. Cancel-safe because
    /// `UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, NetplayError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), NetplayError> {
        self.rx.close();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that spawns a scripted server per connection
// ─────────────────────────────────────────────────────────────────────

struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        session_id: Option<String>,
    ) -> Result<Box<dyn Transport>, NetplayError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_server(server_rx, server_tx, session_id));
        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

fn reply(tx: &mpsc::UnboundedSender<String>, message: Message) {
    if let Ok(text) = serde_json::to_string(&Envelope::new(message)) {
        let _ = tx.send(text);
    }
}

/// Welcomes the client, hosts whatever lobby it joins, confirms game starts
/// and answers the `add` RPC.
async fn run_server(
    mut rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
    session_id: Option<String>,
) {
    let player_id = "P1".to_string();
    reply(
        &tx,
        Message::Welcome {
            player_id: player_id.clone(),
            session_id: session_id.unwrap_or_else(|| "loopback-session".into()),
            server_time: netplay_client::protocol::now_millis(),
        },
    );

    let mut name = String::new();
    while let Some(text) = rx.recv().await {
        let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
            continue;
        };
        match envelope.message {
            Message::Ping => reply(&tx, Message::Pong { server_time: 0 }),
            Message::JoinLobby {
                lobby_id,
                player_name,
                ..
            } => {
                name = player_name;
                reply(&tx, lobby_update(&lobby_id, &player_id, &name, false));
            }
            Message::PlayerReady { lobby_id, ready } => {
                reply(&tx, lobby_update(&lobby_id, &player_id, &name, ready));
            }
            Message::GameStart {
                lobby_id,
                seed,
                initial_state,
            } => reply(
                &tx,
                Message::GameStart {
                    lobby_id,
                    seed,
                    initial_state,
                },
            ),
            Message::RpcCall(call) => {
                let sum: i64 = call.args.iter().filter_map(serde_json::Value::as_i64).sum();
                reply(
                    &tx,
                    Message::RpcResponse(RpcResponsePayload {
                        call_id: call.call_id,
                        result: Some(json!(sum)),
                        error: None,
                    }),
                );
            }
            other => tracing::info!("server got {}", other.kind()),
        }
    }
}

fn lobby_update(lobby_id: &str, player_id: &str, name: &str, ready: bool) -> Message {
    Message::LobbyUpdate(LobbyUpdatePayload {
        lobby_id: lobby_id.into(),
        players: vec![LobbyPlayer {
            id: player_id.into(),
            name: name.into(),
            is_host: true,
            is_ready: ready,
        }],
        state: LobbyState::Waiting,
        settings: None,
        name: Some("Loopback".into()),
        max_players: Some(1),
        created_at: None,
    })
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Drive a session against it
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (mut session, mut events) = NetplaySession::start(LoopbackConnector, NetplayConfig::new());
    session.connect(None).await?;

    while let Some(event) = events.recv().await {
        match event {
            NetplayEvent::Welcome { player_id, .. } => {
                tracing::info!("Welcomed as {player_id}");
                session.join_lobby("loopback", "Alice", None).await?;
            }
            NetplayEvent::LobbyJoined(_) => session.set_ready(true).await?,
            NetplayEvent::LobbyUpdated(lobby) if lobby.all_players_ready() => {
                session.start_game(json!({"level": 1})).await?;
            }
            NetplayEvent::GameStarted { seed, .. } => {
                tracing::info!("Game started with seed {seed}");
                for frame in 1..=3 {
                    session
                        .send_input(frame, InputKeys::RIGHT, InputExtra::default())
                        .await?;
                    session.tick().await?;
                }
                let sum = session.call_server("add", vec![json!(2), json!(40)]).await?;
                tracing::info!("Server says 2 + 40 = {sum}");
                break;
            }
            other => tracing::debug!("Event: {other:?}"),
        }
    }

    session.shutdown().await;
    tracing::info!("Done. Loopback connector works!");
    Ok(())
}

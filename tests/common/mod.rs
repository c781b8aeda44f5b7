#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for netplay client integration tests.
//!
//! [`MockConnector`] hands out scripted connection attempts: each attempt
//! either accepts (yielding a [`ServerEnd`] the test drives), refuses, or
//! hangs forever. Every attempt is recorded with its time and session id so
//! backoff schedules can be checked under paused time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use netplay_client::protocol::{LobbyPlayer, LobbyState, LobbyUpdatePayload};
use netplay_client::{Connector, Envelope, Message, NetplayError, NetplayEvent, Transport};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ── MockTransport ───────────────────────────────────────────────────

/// Client half of an in-memory connection.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Option<String>>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), NetplayError> {
        self.outgoing
            .send(message)
            .map_err(|_| NetplayError::TransportSend("server end dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, NetplayError>> {
        match self.incoming.recv().await {
            Some(Some(text)) => Some(Ok(text)),
            // Explicit close from the server end.
            Some(None) => None,
            // Server end dropped without closing: stay silent.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), NetplayError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Server half of an in-memory connection, driven by the test.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<Option<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl ServerEnd {
    /// Deliver a message to the client.
    pub fn push(&self, message: Message) {
        let text = serde_json::to_string(&Envelope::new(message)).unwrap();
        self.push_raw(&text);
    }

    /// Deliver raw text to the client.
    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(Some(text.to_owned()));
    }

    /// Close the connection from the server side.
    pub fn drop_connection(&self) {
        let _ = self.to_client.send(None);
    }

    /// Next message the client wrote, decoded.
    pub async fn next_message(&mut self) -> Envelope {
        let text = self
            .from_client
            .recv()
            .await
            .expect("client transport dropped");
        serde_json::from_str(&text).expect("client wrote an undecodable message")
    }

    /// Next message that is not a heartbeat.
    pub async fn next_non_ping(&mut self) -> Envelope {
        loop {
            let envelope = self.next_message().await;
            if !matches!(envelope.message, Message::Ping) {
                return envelope;
            }
        }
    }

    /// A message already written, if any.
    pub fn try_next(&mut self) -> Option<Envelope> {
        let text = self.from_client.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Whether the client called `close()`.
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

fn pair() -> (MockTransport, ServerEnd) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let transport = MockTransport {
        incoming,
        outgoing,
        closed: Arc::clone(&closed),
    };
    let server = ServerEnd {
        to_client,
        from_client,
        closed,
    };
    (transport, server)
}

// ── MockConnector ───────────────────────────────────────────────────

enum Attempt {
    Accept(MockTransport),
    Refuse(String),
    Hang,
}

/// Scripted connector. Clones share the script and the attempt log.
#[derive(Clone, Default)]
pub struct MockConnector {
    script: Arc<StdMutex<VecDeque<Attempt>>>,
    attempts: Arc<StdMutex<Vec<(Instant, Option<String>)>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an attempt that opens; returns the server end of it.
    pub fn accept(&self) -> ServerEnd {
        let (transport, server) = pair();
        self.script
            .lock()
            .unwrap()
            .push_back(Attempt::Accept(transport));
        server
    }

    /// Script an attempt that fails at once.
    pub fn refuse(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Attempt::Refuse("connection refused".into()));
    }

    /// Script an attempt that never completes.
    pub fn hang(&self) {
        self.script.lock().unwrap().push_back(Attempt::Hang);
    }

    /// Time and session id of every attempt so far.
    pub fn attempts(&self) -> Vec<(Instant, Option<String>)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        session_id: Option<String>,
    ) -> Result<Box<dyn Transport>, NetplayError> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), session_id));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Attempt::Accept(transport)) => Ok(Box::new(transport)),
            Some(Attempt::Refuse(reason)) => Err(NetplayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                reason,
            ))),
            Some(Attempt::Hang) => std::future::pending().await,
            None => Err(NetplayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no scripted attempt left",
            ))),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Skip events until one matches `pred`.
pub async fn wait_for<F>(events: &mut mpsc::Receiver<NetplayEvent>, mut pred: F) -> NetplayEvent
where
    F: FnMut(&NetplayEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

// ── Message builders ────────────────────────────────────────────────

pub fn welcome(player_id: &str, session_id: &str) -> Message {
    Message::Welcome {
        player_id: player_id.into(),
        session_id: session_id.into(),
        server_time: 1_700_000_000_000,
    }
}

pub fn player(id: &str, is_host: bool, is_ready: bool) -> LobbyPlayer {
    LobbyPlayer {
        id: id.into(),
        name: format!("player-{id}"),
        is_host,
        is_ready,
    }
}

pub fn lobby_update(lobby_id: &str, players: Vec<LobbyPlayer>) -> Message {
    Message::LobbyUpdate(LobbyUpdatePayload {
        lobby_id: lobby_id.into(),
        players,
        state: LobbyState::Waiting,
        settings: None,
        name: None,
        max_players: Some(4),
        created_at: None,
    })
}

pub fn components(value: serde_json::Value) -> netplay_client::protocol::Components {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

//! Connection state machine, outbound queue and typed handler registry.
//!
//! [`Connection`] holds no I/O. The session loop feeds it transport events
//! (`opened`, `lost`, `connect_failed`) and it answers with what to do next:
//! schedule a retry after an exponential backoff, or give up. Outgoing
//! messages always pass through its queue, which the loop drains only while
//! the state is [`ConnectionState::Connected`].
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──opened──▶ Connected
//!     ▲   ▲                      │ connect_failed       │ lost
//!     │   └──────────────────────┘                      ▼
//!     └──── budget exhausted ───── Reconnecting ◀── (auto_reconnect)
//!                                      │ opened ──▶ Connected
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::protocol::{Envelope, Message, MessageKind, PlayerId};

/// Lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// What the session loop must do after the connection went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Open a new transport after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Stay disconnected until `connect` is called again.
    GiveUp { attempts: u32 },
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

/// The logical connection: state, identity, outbound queue, heartbeat RTT.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    state: ConnectionState,
    reconnect_attempts: u32,
    session_id: Option<String>,
    player_id: Option<PlayerId>,
    outbound: VecDeque<Envelope>,
    next_sequence: u64,
    ping_sent_at: Option<Instant>,
    latency: Option<Duration>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            session_id: None,
            player_id: None,
            outbound: VecDeque::new(),
            next_sequence: 0,
            ping_sent_at: None,
            latency: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    /// Last measured heartbeat round-trip time.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Number of messages waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Explicit `connect`. Returns `false` if a connection is already open or
    /// being opened.
    pub fn begin_connect(&mut self, session_id: Option<String>) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connect ignored: connection already active");
            return false;
        }
        if session_id.is_some() {
            self.session_id = session_id;
        }
        self.reconnect_attempts = 0;
        self.state = ConnectionState::Connecting;
        debug!("connection: connecting");
        true
    }

    /// The transport opened. Returns `true` if this completed a reconnect.
    pub fn opened(&mut self) -> bool {
        let was_reconnect = self.state == ConnectionState::Reconnecting;
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.ping_sent_at = None;
        info!(reconnect = was_reconnect, queued = self.outbound.len(), "connection open");
        was_reconnect
    }

    /// An explicit `connect` failed to open. No retry is scheduled.
    pub fn connect_failed(&mut self) {
        self.state = ConnectionState::Disconnected;
        debug!("connection: initial open failed");
    }

    /// The connection dropped unexpectedly, or a retry failed to open.
    pub fn lost(&mut self) -> Recovery {
        self.ping_sent_at = None;
        let retries_left = self.reconnect_attempts < self.config.max_reconnect_attempts;
        if self.config.auto_reconnect && retries_left {
            self.reconnect_attempts += 1;
            let attempt = self.reconnect_attempts;
            let delay = backoff_delay(self.config.reconnect_delay, attempt);
            self.state = ConnectionState::Reconnecting;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "connection lost; scheduling reconnect"
            );
            Recovery::Retry { attempt, delay }
        } else {
            let attempts = self.reconnect_attempts;
            self.state = ConnectionState::Disconnected;
            self.reconnect_attempts = 0;
            warn!(attempts, "connection lost; not reconnecting");
            Recovery::GiveUp { attempts }
        }
    }

    /// Explicit `disconnect`: no retry, counter reset.
    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.reconnect_attempts = 0;
        self.ping_sent_at = None;
        debug!("connection: closed by client");
    }

    // ── Identity and heartbeat ──────────────────────────────────────

    /// Capture the identity from `welcome`. Only the first assignment of a
    /// player id is kept; the session id follows the latest welcome.
    pub fn welcomed(&mut self, player_id: &str, session_id: &str) {
        if self.player_id.is_none() {
            self.player_id = Some(player_id.to_owned());
        }
        self.session_id = Some(session_id.to_owned());
    }

    /// Queue a heartbeat ping and remember when it left.
    pub fn ping(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
        self.enqueue(Message::Ping);
    }

    /// A pong arrived. Returns the measured round trip, if a ping was pending.
    pub fn pong(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.ping_sent_at.take()?;
        let rtt = now.saturating_duration_since(sent);
        self.latency = Some(rtt);
        Some(rtt)
    }

    // ── Outbound queue ──────────────────────────────────────────────

    /// Stamp a message and append it to the outbound queue.
    pub fn enqueue(&mut self, message: Message) {
        self.next_sequence += 1;
        let envelope = Envelope::new(message).with_sequence(self.next_sequence);
        if self.outbound.len() >= self.config.max_queued_messages.max(1) {
            if let Some(dropped) = self.outbound.pop_front() {
                warn!(
                    kind = %dropped.message.kind(),
                    "outbound queue full; dropping oldest message"
                );
            }
        }
        self.outbound.push_back(envelope);
    }

    /// Next message to write, only while connected.
    pub fn next_outgoing(&mut self) -> Option<Envelope> {
        if self.is_connected() {
            self.outbound.pop_front()
        } else {
            None
        }
    }

    /// Put back a message whose write failed so it goes out first after
    /// reconnecting.
    pub fn requeue_front(&mut self, envelope: Envelope) {
        self.outbound.push_front(envelope);
    }
}

// ── Handler registry ────────────────────────────────────────────────

/// Identifier returned by [`HandlerRegistry::on`]; pass it to `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A message callback.
pub type MessageHandler = Box<dyn FnMut(&Envelope) + Send>;

/// Per-type and wildcard message callbacks.
///
/// For one message, handlers registered for its type run first, then the
/// wildcard handlers; within each set in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: u64,
    typed: HashMap<MessageKind, Vec<(HandlerId, MessageHandler)>>,
    wildcard: Vec<(HandlerId, MessageHandler)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    /// Register a handler for one message type.
    pub fn on(&mut self, kind: MessageKind, handler: MessageHandler) -> HandlerId {
        let id = self.allocate();
        self.typed.entry(kind).or_default().push((id, handler));
        id
    }

    /// Register a handler for every message.
    pub fn on_any(&mut self, handler: MessageHandler) -> HandlerId {
        let id = self.allocate();
        self.wildcard.push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if the id was not registered.
    pub fn off(&mut self, id: HandlerId) -> bool {
        let before = self.len();
        for handlers in self.typed.values_mut() {
            handlers.retain(|(h, _)| *h != id);
        }
        self.typed.retain(|_, handlers| !handlers.is_empty());
        self.wildcard.retain(|(h, _)| *h != id);
        self.len() != before
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.typed.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler interested in `envelope`.
    pub fn dispatch(&mut self, envelope: &Envelope) {
        if let Some(handlers) = self.typed.get_mut(&envelope.message.kind()) {
            for (_, handler) in handlers.iter_mut() {
                handler(envelope);
            }
        }
        for (_, handler) in self.wildcard.iter_mut() {
            handler(envelope);
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("typed", &self.typed.values().map(Vec::len).sum::<usize>())
            .field("wildcard", &self.wildcard.len())
            .finish()
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
    use std::sync::{Arc, Mutex};

    fn config(max_attempts: u32, delay_ms: u64) -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts: max_attempts,
            reconnect_delay: Duration::from_millis(delay_ms),
            ..ConnectionConfig::default()
        }
    }

    fn connected(config: ConnectionConfig) -> Connection {
        let mut conn = Connection::new(config);
        assert!(conn.begin_connect(None));
        conn.opened();
        conn
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let delay = backoff_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn retry_schedule_then_terminal_disconnect() {
        let mut conn = connected(config(3, 1000));

        let mut delays = Vec::new();
        for _ in 0..3 {
            match conn.lost() {
                Recovery::Retry { delay, .. } => delays.push(delay.as_millis()),
                Recovery::GiveUp { .. } => panic!("gave up too early"),
            }
            assert_eq!(conn.state(), ConnectionState::Reconnecting);
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);

        assert_eq!(conn.lost(), Recovery::GiveUp { attempts: 3 });
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn successful_reconnect_resets_attempts() {
        let mut conn = connected(config(3, 100));
        conn.lost();
        conn.lost();
        assert_eq!(conn.reconnect_attempts(), 2);
        assert!(conn.opened(), "open after a loss is a reconnect");
        assert_eq!(conn.reconnect_attempts(), 0);
        assert_eq!(
            conn.lost(),
            Recovery::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn auto_reconnect_disabled_gives_up_immediately() {
        let mut conn = connected(ConnectionConfig {
            auto_reconnect: false,
            ..ConnectionConfig::default()
        });
        assert_eq!(conn.lost(), Recovery::GiveUp { attempts: 0 });
    }

    #[test]
    fn connect_only_from_disconnected() {
        let mut conn = connected(ConnectionConfig::default());
        assert!(!conn.begin_connect(None));
        conn.close();
        assert!(conn.begin_connect(Some("s1".into())));
        assert_eq!(conn.session_id(), Some("s1"));
    }

    #[test]
    fn queue_holds_messages_until_connected() {
        let mut conn = Connection::new(ConnectionConfig::default());
        conn.enqueue(Message::Ping);
        conn.enqueue(Message::LeaveLobby {
            lobby_id: "L1".into(),
        });
        assert!(conn.next_outgoing().is_none());

        conn.begin_connect(None);
        conn.opened();
        let first = conn.next_outgoing().unwrap();
        let second = conn.next_outgoing().unwrap();
        assert_eq!(first.message, Message::Ping);
        assert_eq!(first.sequence, Some(1));
        assert_eq!(second.sequence, Some(2));
        assert!(conn.next_outgoing().is_none());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let mut conn = Connection::new(ConnectionConfig {
            max_queued_messages: 2,
            ..ConnectionConfig::default()
        });
        for _ in 0..3 {
            conn.enqueue(Message::Ping);
        }
        assert_eq!(conn.queued(), 2);
        conn.begin_connect(None);
        conn.opened();
        assert_eq!(conn.next_outgoing().unwrap().sequence, Some(2));
    }

    #[test]
    fn requeued_message_goes_out_first() {
        let mut conn = connected(ConnectionConfig::default());
        conn.enqueue(Message::Ping);
        conn.enqueue(Message::Pong { server_time: 0 });
        let failed = conn.next_outgoing().unwrap();
        conn.requeue_front(failed.clone());
        conn.lost();
        conn.opened();
        assert_eq!(conn.next_outgoing().unwrap(), failed);
    }

    #[test]
    fn welcome_keeps_first_player_id() {
        let mut conn = Connection::new(ConnectionConfig::default());
        conn.welcomed("p1", "s1");
        conn.welcomed("p2", "s2");
        assert_eq!(conn.player_id(), Some("p1"));
        assert_eq!(conn.session_id(), Some("s2"));
    }

    #[test]
    fn pong_measures_round_trip() {
        let mut conn = connected(ConnectionConfig::default());
        let start = Instant::now();
        assert!(conn.pong(start).is_none(), "no ping outstanding");
        conn.ping(start);
        let rtt = conn.pong(start + Duration::from_millis(40)).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
        assert_eq!(conn.latency(), Some(rtt));
    }

    #[test]
    fn typed_handlers_run_before_wildcard_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        let l = Arc::clone(&log);
        registry.on_any(Box::new(move |_| l.lock().unwrap().push("any")));
        let l = Arc::clone(&log);
        registry.on(MessageKind::Ping, Box::new(move |_| l.lock().unwrap().push("ping-1")));
        let l = Arc::clone(&log);
        registry.on(MessageKind::Ping, Box::new(move |_| l.lock().unwrap().push("ping-2")));
        let l = Arc::clone(&log);
        registry.on(MessageKind::Chat, Box::new(move |_| l.lock().unwrap().push("chat")));

        registry.dispatch(&Envelope::new(Message::Ping));
        assert_eq!(*log.lock().unwrap(), vec!["ping-1", "ping-2", "any"]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let hits = Arc::new(Mutex::new(0));
        let mut registry = HandlerRegistry::new();
        let h = Arc::clone(&hits);
        let first = registry.on(MessageKind::Ping, Box::new(move |_| *h.lock().unwrap() += 1));
        let h = Arc::clone(&hits);
        registry.on_any(Box::new(move |_| *h.lock().unwrap() += 10));

        assert!(registry.off(first));
        assert!(!registry.off(first));
        registry.dispatch(&Envelope::new(Message::Ping));
        assert_eq!(*hits.lock().unwrap(), 10);
        assert_eq!(registry.len(), 1);
    }
}

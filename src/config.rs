//! Session configuration.
//!
//! [`NetplayConfig`] groups the settings of every component. All fields have
//! defaults; tune them with the `with_*` builder methods.
//!
//! ```
//! use netplay_client::config::{NetplayConfig, SyncStrategy};
//! use std::time::Duration;
//!
//! let config = NetplayConfig::new()
//!     .with_max_reconnect_attempts(3)
//!     .with_reconnect_delay(Duration::from_millis(500))
//!     .with_strategy(SyncStrategy::Authoritative)
//!     .with_sync_components(["x", "y"]);
//! assert_eq!(config.connection.max_reconnect_attempts, 3);
//! assert_eq!(config.sync.sync_components.len(), 2);
//! ```

use std::time::Duration;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Connection ──────────────────────────────────────────────────────

/// Transport-level settings: open timeout, reconnection and heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long `connect` waits for the transport to open. Defaults to **10 s**.
    pub connection_timeout: Duration,
    /// Reconnect automatically after an unexpected close. Defaults to `true`.
    pub auto_reconnect: bool,
    /// Retry budget after an unexpected close. Defaults to **5**.
    pub max_reconnect_attempts: u32,
    /// Base backoff delay; attempt `n` waits `reconnect_delay * 2^(n-1)`.
    /// Defaults to **1 s**.
    pub reconnect_delay: Duration,
    /// Interval between heartbeat pings while connected. Defaults to **5 s**.
    pub heartbeat_interval: Duration,
    /// Messages held while not connected. When full the oldest is dropped.
    /// Defaults to **1024**; values below 1 are clamped to 1.
    pub max_queued_messages: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            max_queued_messages: 1024,
        }
    }
}

// ── State sync ──────────────────────────────────────────────────────

/// Reconciliation policy for locally owned entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// Remote state wins; incoming changes to local entities snap local state.
    Authoritative,
    /// Local entities run ahead; incoming changes to them are ignored.
    #[default]
    ClientPrediction,
    /// Peers advance in step; incoming changes to local entities are ignored.
    Lockstep,
}

/// Entity replication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Reconciliation policy. Defaults to [`SyncStrategy::ClientPrediction`].
    pub strategy: SyncStrategy,
    /// Outgoing delta ticks per second. Defaults to **20**; clamped to at least 1.
    pub sync_rate: u32,
    /// Component names allowed on the wire. Empty means every component.
    pub sync_components: Vec<String>,
    /// Frames kept for rollback. Defaults to **120**; clamped to at least 1.
    pub max_history_frames: usize,
}

impl SyncConfig {
    /// Period of the outgoing delta tick.
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(1) / self.sync_rate.max(1)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::default(),
            sync_rate: 20,
            sync_components: Vec::new(),
            max_history_frames: 120,
        }
    }
}

// ── Input ───────────────────────────────────────────────────────────

/// Input buffer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputConfig {
    /// Frames kept per player. Defaults to **60**; clamped to at least 1.
    pub buffer_size: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { buffer_size: 60 }
    }
}

// ── RPC ─────────────────────────────────────────────────────────────

/// Remote procedure call settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// How long a call waits for its response. Defaults to **10 s**.
    pub call_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Configuration for a [`NetplaySession`](crate::session::NetplaySession).
///
/// # Tuning
///
/// ```
/// use netplay_client::config::NetplayConfig;
/// use std::time::Duration;
///
/// let config = NetplayConfig::new()
///     .with_event_channel_capacity(512)
///     .with_shutdown_timeout(Duration::from_secs(5));
/// assert_eq!(config.event_channel_capacity, 512);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetplayConfig {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub input: InputConfig,
    pub rpc: RpcConfig,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) so the session loop never blocks. `Disconnected` is always
    /// delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the session loop gets to close the transport on
    /// [`shutdown`](crate::session::NetplaySession::shutdown) before it is
    /// aborted. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl NetplayConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
            input: InputConfig::default(),
            rpc: RpcConfig::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set how long `connect` waits for the transport to open.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connection_timeout = timeout;
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.connection.auto_reconnect = auto_reconnect;
        self
    }

    /// Set the reconnect retry budget.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.connection.max_reconnect_attempts = attempts;
        self
    }

    /// Set the base reconnect backoff delay.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.connection.reconnect_delay = delay;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.connection.heartbeat_interval = interval;
        self
    }

    /// Set how many messages are held while disconnected. Clamped to at least 1.
    #[must_use]
    pub fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.connection.max_queued_messages = max.max(1);
        self
    }

    /// Set the reconciliation strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.sync.strategy = strategy;
        self
    }

    /// Set the outgoing delta rate in Hz. Clamped to at least 1.
    #[must_use]
    pub fn with_sync_rate(mut self, hz: u32) -> Self {
        self.sync.sync_rate = hz.max(1);
        self
    }

    /// Restrict which components are put on the wire.
    #[must_use]
    pub fn with_sync_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync.sync_components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Set the rollback window in frames. Clamped to at least 1.
    #[must_use]
    pub fn with_max_history_frames(mut self, frames: usize) -> Self {
        self.sync.max_history_frames = frames.max(1);
        self
    }

    /// Set the per-player input buffer size. Clamped to at least 1.
    #[must_use]
    pub fn with_input_buffer_size(mut self, size: usize) -> Self {
        self.input.buffer_size = size.max(1);
        self
    }

    /// Set the RPC call timeout.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.rpc.call_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel. Clamped to at least 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NetplayConfig::new();
        assert_eq!(config.connection.connection_timeout, Duration::from_secs(10));
        assert!(config.connection.auto_reconnect);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.sync.strategy, SyncStrategy::ClientPrediction);
        assert_eq!(config.sync.sync_rate, 20);
        assert!(config.sync.sync_components.is_empty());
        assert_eq!(config.sync.max_history_frames, 120);
        assert_eq!(config.input.buffer_size, 60);
        assert_eq!(config.rpc.call_timeout, Duration::from_secs(10));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn degenerate_values_are_clamped() {
        let config = NetplayConfig::new()
            .with_sync_rate(0)
            .with_max_history_frames(0)
            .with_input_buffer_size(0)
            .with_event_channel_capacity(0)
            .with_max_queued_messages(0);
        assert_eq!(config.sync.sync_rate, 1);
        assert_eq!(config.sync.max_history_frames, 1);
        assert_eq!(config.input.buffer_size, 1);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.connection.max_queued_messages, 1);
    }

    #[test]
    fn sync_period_follows_rate() {
        let config = NetplayConfig::new().with_sync_rate(10);
        assert_eq!(config.sync.sync_period(), Duration::from_millis(100));
    }
}

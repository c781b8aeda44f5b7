//! The netplay session: a handle plus one background task.
//!
//! [`NetplaySession::start`] spawns the session loop, which owns the
//! connection state machine, the handler registry, the lobby client, the
//! state sync engine, the input buffer and the RPC manager. Every handle
//! method is a closure shipped to the loop over an unbounded channel and run
//! there, so component state is only ever touched by one task and message
//! handling, timers and API calls never interleave mid-step.
//!
//! Events are emitted on a bounded channel ([`mpsc::Receiver<NetplayEvent>`])
//! returned from [`NetplaySession::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = WebSocketConnector::new("ws://localhost:8080/netplay");
//! let (mut session, mut events) = NetplaySession::start(connector, NetplayConfig::new());
//! session.connect(None).await?;
//! session.join_lobby("L1", "Alice", None).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         NetplayEvent::GameStarted { seed, .. } => { /* … */ }
//!         NetplayEvent::Disconnected { .. } => break,
//!         _ => {}
//!     }
//! }
//! session.shutdown().await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::NetplayConfig;
use crate::connection::{
    Connection, ConnectionState, HandlerId, HandlerRegistry, MessageHandler, Recovery,
};
use crate::error::{NetplayError, Result};
use crate::event::{Effects, NetplayEvent};
use crate::input::{InputBuffer, InputExtra, InputFrame};
use crate::lobby::{Lobby, LobbyClient};
use crate::protocol::{
    now_millis, Components, Envelope, InputKeys, LobbyConfig, LobbyId, Message, MessageKind,
    PlayerId, PlayerInputPayload, RpcTarget,
};
use crate::rpc::{self, DeferredCall, Dispatch, RpcManager, RpcRegistration, RpcResult};
use crate::sync::{StateSync, SyncedEntity};
use crate::transport::{Connector, Transport};

// ── Session core ────────────────────────────────────────────────────

/// Everything the session loop owns apart from I/O.
struct SessionCore {
    connection: Connection,
    handlers: HandlerRegistry,
    lobby: LobbyClient,
    sync: StateSync,
    inputs: InputBuffer,
    rpc: RpcManager,
    fx: Effects,
    deferred: Vec<DeferredCall>,
}

impl SessionCore {
    fn new(config: &NetplayConfig) -> Self {
        Self {
            connection: Connection::new(config.connection.clone()),
            handlers: HandlerRegistry::new(),
            lobby: LobbyClient::new(),
            sync: StateSync::new(config.sync.clone()),
            inputs: InputBuffer::new(config.input.buffer_size),
            rpc: RpcManager::new(config.rpc.call_timeout),
            fx: Effects::new(),
            deferred: Vec::new(),
        }
    }

    fn local_player(&self) -> Result<PlayerId> {
        self.connection
            .player_id()
            .map(str::to_owned)
            .ok_or(NetplayError::NotConnected)
    }

    /// Handle one decoded envelope: user handlers first, then the components.
    fn handle_incoming(&mut self, envelope: Envelope, now: Instant) {
        self.handlers.dispatch(&envelope);
        self.route(envelope.message, now);
    }

    fn route(&mut self, message: Message, now: Instant) {
        let fx = &mut self.fx;
        match message {
            Message::Welcome {
                player_id,
                session_id,
                server_time,
            } => {
                self.connection.welcomed(&player_id, &session_id);
                let assigned = self
                    .connection
                    .player_id()
                    .unwrap_or(&player_id)
                    .to_owned();
                self.lobby.set_local_player(assigned.clone());
                self.sync.set_local_player(assigned.clone());
                info!(player_id = %assigned, session_id = %session_id, "welcomed by server");
                fx.emit(NetplayEvent::Welcome {
                    player_id: assigned,
                    session_id,
                    server_time,
                });
            }
            Message::Ping => fx.send(Message::Pong {
                server_time: now_millis(),
            }),
            Message::Pong { .. } => {
                if let Some(rtt) = self.connection.pong(now) {
                    fx.emit(NetplayEvent::Pong { rtt });
                }
            }
            Message::LobbyUpdate(update) => self.lobby.handle_lobby_update(update, fx),
            Message::GameStart {
                lobby_id,
                seed,
                initial_state,
            } => self
                .lobby
                .handle_game_start(lobby_id, seed, initial_state, fx),
            Message::GameEnd { reason, results } => {
                fx.emit(NetplayEvent::GameEnded { reason, results });
            }
            Message::PlayerJoin {
                player_id,
                player_name,
            } => fx.emit(NetplayEvent::PlayerJoined {
                player_id,
                player_name,
            }),
            Message::PlayerLeave { player_id, reason } => {
                self.inputs.clear_player(&player_id);
                fx.emit(NetplayEvent::PlayerLeft { player_id, reason });
            }
            Message::PlayerInput(input) => {
                let keys = input.inputs.keys;
                self.inputs.add_input(
                    &input.player_id,
                    input.frame,
                    keys,
                    InputExtra::from(input.inputs),
                );
                fx.emit(NetplayEvent::InputReceived {
                    player_id: input.player_id,
                    frame: input.frame,
                });
            }
            Message::StateSync(snapshot) => self.sync.handle_state_sync(snapshot),
            Message::StateDelta(delta) => self.sync.handle_state_delta(delta),
            Message::EntitySpawn {
                entity_id,
                owner_id,
                components,
            } => self
                .sync
                .handle_entity_spawn(&entity_id, owner_id, components),
            Message::EntityDestroy { entity_id } => self.sync.handle_entity_destroy(&entity_id),
            Message::EntityUpdate {
                entity_id,
                components,
                owner_id,
            } => self
                .sync
                .handle_entity_update(&entity_id, components, owner_id),
            Message::RpcCall(call) => match self.rpc.handle_call(call) {
                Dispatch::Reply(response) => fx.send(response),
                Dispatch::Deferred(call) => self.deferred.push(call),
            },
            Message::RpcResponse(response) => {
                self.rpc.handle_response(response);
            }
            Message::Chat {
                sender_id,
                sender_name,
                message,
                channel,
            } => fx.emit(NetplayEvent::Chat {
                sender_id,
                sender_name,
                message,
                channel,
            }),
            Message::Error {
                code,
                message,
                details,
            } => {
                warn!(code = %code.as_str(), message = %message, "server reported an error");
                fx.emit(NetplayEvent::ServerError {
                    code,
                    message,
                    details,
                });
            }
            Message::JoinLobby { .. }
            | Message::LeaveLobby { .. }
            | Message::PlayerReady { .. }
            | Message::UpdateSettings { .. } => {
                debug!("ignoring client-only message received from server");
            }
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(&mut SessionCore) + Send>;

enum Command {
    Connect {
        session_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Exec(Job),
}

/// State mirrored out of the loop for synchronous accessors.
struct SharedState {
    connection: AtomicU8,
}

// ── Session handle ──────────────────────────────────────────────────

/// Handle to a running netplay session.
///
/// Created by [`NetplaySession::start`]. Methods return once the session loop
/// has applied them; messages they produce are queued and written in order
/// while connected, or after the connection (re)opens.
pub struct NetplaySession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<SharedState>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl NetplaySession {
    /// Spawn the session loop and return a handle plus the event receiver.
    ///
    /// The session starts disconnected; call [`connect`](Self::connect).
    /// Must be called from within a tokio runtime.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        connector: impl Connector,
        config: NetplayConfig,
    ) -> (Self, mpsc::Receiver<NetplayEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(SharedState {
            connection: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
        });
        let shutdown_timeout = config.shutdown_timeout;

        let session_loop = SessionLoop::new(
            Arc::new(connector),
            config,
            event_tx,
            Arc::clone(&shared),
        );
        let task = tokio::spawn(session_loop.run(cmd_rx, shutdown_rx));

        let session = Self {
            cmd_tx,
            shared,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (session, event_rx)
    }

    /// Run `f` on the session loop and wait for its result.
    async fn query<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SessionCore) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |core| {
            let _ = tx.send(f(core));
        });
        self.cmd_tx
            .send(Command::Exec(job))
            .map_err(|_| NetplayError::NotConnected)?;
        rx.await.map_err(|_| NetplayError::NotConnected)
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Open the connection, resuming `session_id` if given.
    ///
    /// Resolves once the transport is open. The identity assigned by the
    /// server arrives afterwards as [`NetplayEvent::Welcome`]. If a connect or
    /// reconnect is already in progress this waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::ConnectTimeout`] if the transport does not open
    /// within the configured timeout, the connector's error if it fails, or
    /// [`NetplayError::NotConnected`] if the session loop has stopped. An
    /// initial failure is not retried.
    pub async fn connect(&self, session_id: Option<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { session_id, reply })
            .map_err(|_| NetplayError::NotConnected)?;
        rx.await.map_err(|_| NetplayError::NotConnected)?
    }

    /// Close the connection. No reconnect is attempted; queued messages stay
    /// queued until the next [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::NotConnected`] if the session loop has stopped.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect { reply })
            .map_err(|_| NetplayError::NotConnected)?;
        rx.await.map_err(|_| NetplayError::NotConnected)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.connection.load(Ordering::Acquire))
    }

    /// Returns `true` while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Player id assigned by the server's first `welcome`.
    pub async fn player_id(&self) -> Result<Option<PlayerId>> {
        self.query(|core| core.connection.player_id().map(str::to_owned)).await
    }

    /// Session id, as passed to `connect` or assigned by `welcome`.
    pub async fn session_id(&self) -> Result<Option<String>> {
        self.query(|core| core.connection.session_id().map(str::to_owned)).await
    }

    /// Last measured heartbeat round trip.
    pub async fn latency(&self) -> Result<Option<Duration>> {
        self.query(|core| core.connection.latency()).await
    }

    /// Messages waiting for the connection.
    pub async fn queued_messages(&self) -> Result<usize> {
        self.query(|core| core.connection.queued()).await
    }

    // ── Raw messages and handlers ───────────────────────────────────

    /// Queue a message.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::NotConnected`] if the session loop has stopped.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.query(move |core| core.fx.send(message)).await
    }

    /// Register a handler for one message type. Handlers run on the session
    /// loop before the message reaches the built-in components, so they must
    /// not block.
    pub async fn on<F>(&self, kind: MessageKind, handler: F) -> Result<HandlerId>
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        let handler: MessageHandler = Box::new(handler);
        self.query(move |core| core.handlers.on(kind, handler)).await
    }

    /// Register a handler for every incoming message. Runs after the typed
    /// handlers of each message.
    pub async fn on_any<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        let handler: MessageHandler = Box::new(handler);
        self.query(move |core| core.handlers.on_any(handler)).await
    }

    /// Remove a handler registered with [`on`](Self::on) or
    /// [`on_any`](Self::on_any).
    pub async fn off(&self, id: HandlerId) -> Result<bool> {
        self.query(move |core| core.handlers.off(id)).await
    }

    // ── Lobby ───────────────────────────────────────────────────────

    /// Create a lobby and join it as `player_name`. Returns the proposed
    /// lobby id; the lobby is adopted when the server's `lobby_update` arrives.
    pub async fn create_lobby(
        &self,
        player_name: impl Into<String>,
        config: LobbyConfig,
    ) -> Result<LobbyId> {
        let player_name = player_name.into();
        self.query(move |core| core.lobby.create_lobby(&player_name, config, &mut core.fx)).await
    }

    /// Join an existing lobby.
    pub async fn join_lobby(
        &self,
        lobby_id: impl Into<LobbyId>,
        player_name: impl Into<String>,
        player_data: Option<Value>,
    ) -> Result<()> {
        let (lobby_id, player_name) = (lobby_id.into(), player_name.into());
        self.query(move |core| {
            core.lobby.join_lobby(&lobby_id, &player_name, player_data, &mut core.fx);
        })
        .await
    }

    /// Leave the current lobby immediately.
    pub async fn leave_lobby(&self) -> Result<()> {
        self.query(|core| core.lobby.leave_lobby(&mut core.fx)).await
    }

    /// Set the local player's ready flag.
    pub async fn set_ready(&self, ready: bool) -> Result<()> {
        self.query(move |core| core.lobby.set_ready(ready, &mut core.fx)).await
    }

    /// Propose starting the game. Returns the proposed seed, or `None` if the
    /// local player is not the host.
    pub async fn start_game(&self, initial_state: Value) -> Result<Option<u64>> {
        self.query(move |core| core.lobby.start_game(initial_state, &mut core.fx)).await
    }

    /// Ask the server to change lobby settings. Returns `false` if the local
    /// player is not the host.
    pub async fn update_settings(&self, settings: Components) -> Result<bool> {
        self.query(move |core| core.lobby.update_settings(settings, &mut core.fx)).await
    }

    /// Snapshot of the lobby this client is in, if any.
    pub async fn current_lobby(&self) -> Result<Option<Lobby>> {
        self.query(|core| core.lobby.current().cloned()).await
    }

    /// `true` if the local player hosts the current lobby.
    pub async fn is_host(&self) -> Result<bool> {
        self.query(|core| core.lobby.is_host()).await
    }

    /// `true` if every player other than the host is ready.
    pub async fn all_players_ready(&self) -> Result<bool> {
        self.query(|core| core.lobby.all_players_ready()).await
    }

    // ── State sync ──────────────────────────────────────────────────

    /// Register a locally owned entity.
    pub async fn register_entity(
        &self,
        entity_id: impl Into<String>,
        components: Components,
    ) -> Result<()> {
        let entity_id = entity_id.into();
        self.query(move |core| {
            core.sync.register_entity(&entity_id, components, &mut core.fx);
        })
        .await
    }

    /// Remove a locally owned entity. Returns `false` if it was not local.
    pub async fn unregister_entity(&self, entity_id: impl Into<String>) -> Result<bool> {
        let entity_id = entity_id.into();
        self.query(move |core| core.sync.unregister_entity(&entity_id, &mut core.fx)).await
    }

    /// Merge components into an entity. Returns `false` if it is unknown.
    pub async fn update_entity(
        &self,
        entity_id: impl Into<String>,
        components: Components,
    ) -> Result<bool> {
        let entity_id = entity_id.into();
        self.query(move |core| core.sync.update_entity(&entity_id, components)).await
    }

    /// Advance the simulation frame and record it for rollback.
    pub async fn tick(&self) -> Result<u64> {
        self.query(|core| core.sync.tick()).await
    }

    /// Restore the entity map recorded at `frame`.
    pub async fn rollback_to_frame(&self, frame: u64) -> Result<bool> {
        self.query(move |core| core.sync.rollback_to_frame(frame)).await
    }

    /// Last frame recorded by [`tick`](Self::tick) or restored by a rollback.
    pub async fn current_frame(&self) -> Result<u64> {
        self.query(|core| core.sync.current_frame()).await
    }

    /// Copy of one entity, local or remote.
    pub async fn entity(&self, entity_id: impl Into<String>) -> Result<Option<SyncedEntity>> {
        let entity_id = entity_id.into();
        self.query(move |core| core.sync.entity(&entity_id).cloned()).await
    }

    /// Copy of every known entity, in no particular order.
    pub async fn all_entities(&self) -> Result<Vec<SyncedEntity>> {
        self.query(|core| core.sync.all_entities().cloned().collect()).await
    }

    /// Copy of every entity owned by `player_id`.
    pub async fn player_entities(
        &self,
        player_id: impl Into<String>,
    ) -> Result<Vec<SyncedEntity>> {
        let player_id = player_id.into();
        self.query(move |core| core.sync.player_entities(&player_id).cloned().collect()).await
    }

    // ── Input ───────────────────────────────────────────────────────

    /// Store the local player's input for `frame` and send it.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::NotConnected`] before the server has assigned a
    /// player id.
    pub async fn send_input(
        &self,
        frame: u64,
        inputs: InputKeys,
        extra: InputExtra,
    ) -> Result<InputFrame> {
        self.query(move |core| {
            let player_id = core.local_player()?;
            let stored = core.inputs.add_input(&player_id, frame, inputs, extra);
            core.fx.send(Message::PlayerInput(PlayerInputPayload {
                player_id,
                frame,
                inputs: stored.payload(),
            }));
            Ok(stored)
        })
        .await?
    }

    /// The buffered input of `player_id` for exactly `frame`.
    pub async fn get_input(
        &self,
        player_id: impl Into<String>,
        frame: u64,
    ) -> Result<Option<InputFrame>> {
        let player_id = player_id.into();
        self.query(move |core| core.inputs.get_input(&player_id, frame).cloned()).await
    }

    /// The buffered input of `player_id` with the highest frame.
    pub async fn get_latest_input(
        &self,
        player_id: impl Into<String>,
    ) -> Result<Option<InputFrame>> {
        let player_id = player_id.into();
        self.query(move |core| core.inputs.get_latest_input(&player_id).cloned()).await
    }

    /// Buffered inputs of `player_id` with `start <= frame <= end`, oldest first.
    pub async fn get_input_range(
        &self,
        player_id: impl Into<String>,
        start: u64,
        end: u64,
    ) -> Result<Vec<InputFrame>> {
        let player_id = player_id.into();
        self.query(move |core| core.inputs.get_input_range(&player_id, start, end)).await
    }

    /// Mark every input of `player_id` up to and including `up_to_frame` as
    /// confirmed by the server.
    pub async fn acknowledge_inputs(
        &self,
        player_id: impl Into<String>,
        up_to_frame: u64,
    ) -> Result<()> {
        let player_id = player_id.into();
        self.query(move |core| core.inputs.acknowledge_inputs(&player_id, up_to_frame)).await
    }

    /// Inputs of `player_id` the server has not confirmed yet, oldest first.
    pub async fn get_unacknowledged_inputs(
        &self,
        player_id: impl Into<String>,
    ) -> Result<Vec<InputFrame>> {
        let player_id = player_id.into();
        self.query(move |core| core.inputs.get_unacknowledged_inputs(&player_id)).await
    }

    /// Predicted input of `player_id` for `frame`: the last input before it,
    /// held. `None` if nothing earlier is buffered.
    pub async fn predict_input(
        &self,
        player_id: impl Into<String>,
        frame: u64,
    ) -> Result<Option<InputFrame>> {
        let player_id = player_id.into();
        self.query(move |core| core.inputs.predict_input(&player_id, frame)).await
    }

    // ── RPC ─────────────────────────────────────────────────────────

    /// Register a synchronous RPC handler. A panicking handler is answered
    /// with an error response.
    pub async fn register_rpc<F>(
        &self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<RpcRegistration>
    where
        F: Fn(Vec<Value>) -> RpcResult + Send + Sync + 'static,
    {
        let method = method.into();
        self.query(move |core| core.rpc.register(&method, handler)).await
    }

    /// Register an asynchronous RPC handler. It runs on its own task; the
    /// response is sent when it completes.
    pub async fn register_rpc_async<F, Fut>(
        &self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<RpcRegistration>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        let method = method.into();
        self.query(move |core| core.rpc.register_async(&method, handler)).await
    }

    /// Remove the handler `registration` refers to. Returns `false` if it was
    /// already removed or replaced.
    pub async fn unregister_rpc(&self, registration: RpcRegistration) -> Result<bool> {
        self.query(move |core| core.rpc.unregister(&registration)).await
    }

    /// Call `method` on `target` and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::Rpc`] if the remote side reports an error or an
    /// unknown method, if no response arrives within the call timeout, or if
    /// pending calls are cleared.
    pub async fn call(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        target: RpcTarget,
    ) -> Result<Value> {
        let method = method.into();
        let receiver = self
            .query(move |core| {
                let (message, receiver) =
                    core.rpc.begin_call(&method, args, target, Instant::now());
                core.fx.send(message);
                receiver
            })
            .await?;
        match receiver.await {
            Ok(outcome) => outcome.map_err(NetplayError::from),
            Err(_) => Err(NetplayError::NotConnected),
        }
    }

    /// [`call`](Self::call) the server.
    pub async fn call_server(&self, method: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        self.call(method, args, RpcTarget::Server).await
    }

    /// [`call`](Self::call) every peer; the first response wins.
    pub async fn call_all(&self, method: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        self.call(method, args, RpcTarget::All).await
    }

    /// [`call`](Self::call) every peer except this one.
    pub async fn call_others(&self, method: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        self.call(method, args, RpcTarget::Others).await
    }

    /// [`call`](Self::call) one player.
    pub async fn call_client(
        &self,
        player_id: impl Into<PlayerId>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.call(method, args, RpcTarget::Client(player_id.into())).await
    }

    /// Reject every outstanding call. Returns how many were pending.
    pub async fn clear_pending(&self) -> Result<usize> {
        self.query(|core| core.rpc.clear_pending()).await
    }

    // ── Chat ────────────────────────────────────────────────────────

    /// Send a chat line, signed with the local player's lobby name when known.
    pub async fn send_chat(
        &self,
        message: impl Into<String>,
        channel: Option<String>,
    ) -> Result<()> {
        let message = message.into();
        self.query(move |core| {
            let sender_id = core.local_player()?;
            let sender_name = core
                .lobby
                .current()
                .and_then(|lobby| lobby.player(&sender_id))
                .map_or_else(|| sender_id.clone(), |player| player.name.clone());
            core.fx.send(Message::Chat {
                sender_id,
                sender_name,
                message,
                channel,
            });
            Ok(())
        })
        .await?
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Shut the session down: reject pending calls, close the transport and
    /// stop the loop. The loop gets the configured shutdown timeout before it
    /// is aborted.
    ///
    /// After this returns, the event receiver yields `None` once drained.
    pub async fn shutdown(&mut self) {
        debug!("NetplaySession: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.shared
            .connection
            .store(ConnectionState::Disconnected.to_u8(), Ordering::Release);
    }
}

impl std::fmt::Debug for NetplaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("state", &self.connection_state())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for NetplaySession {
    fn drop(&mut self) {
        // No executor to drive a graceful close here; drop the loop instead.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

type OpenFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Transport>>> + Send>>;

fn open_transport(
    connector: Arc<dyn Connector>,
    session_id: Option<String>,
    timeout: Duration,
) -> OpenFuture {
    Box::pin(async move {
        match tokio::time::timeout(timeout, connector.connect(session_id)).await {
            Ok(result) => result,
            Err(_) => Err(NetplayError::ConnectTimeout(timeout)),
        }
    })
}

async fn poll_open(opening: &mut Option<OpenFuture>) -> Result<Box<dyn Transport>> {
    match opening {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn recv_from(transport: &mut Option<Box<dyn Transport>>) -> Option<Result<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn periodic(period: Duration, first_after: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + first_after, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct SessionLoop {
    core: SessionCore,
    connector: Arc<dyn Connector>,
    config: NetplayConfig,
    event_tx: mpsc::Sender<NetplayEvent>,
    shared: Arc<SharedState>,
    transport: Option<Box<dyn Transport>>,
    opening: Option<OpenFuture>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    sync_tick: Interval,
    rpc_tasks: JoinSet<(String, RpcResult)>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl SessionLoop {
    fn new(
        connector: Arc<dyn Connector>,
        config: NetplayConfig,
        event_tx: mpsc::Sender<NetplayEvent>,
        shared: Arc<SharedState>,
    ) -> Self {
        let period = config.sync.sync_period();
        Self {
            core: SessionCore::new(&config),
            connector,
            event_tx,
            shared,
            transport: None,
            opening: None,
            reconnect_at: None,
            heartbeat: None,
            sync_tick: periodic(period, period),
            rpc_tasks: JoinSet::new(),
            connect_waiters: Vec::new(),
            config,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("session loop started");

        loop {
            let was_staged = self.core.sync.has_staged_changes();
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    self.stop("session shut down").await;
                    break;
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Connect { session_id, reply }) => {
                        self.begin_connect(session_id, reply)
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Exec(job)) => job(&mut self.core),
                    None => {
                        debug!("command channel closed, stopping session loop");
                        self.stop("session dropped").await;
                        break;
                    }
                },

                opened = poll_open(&mut self.opening) => {
                    self.opening = None;
                    self.open_finished(opened);
                }

                () = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_open();
                }

                incoming = recv_from(&mut self.transport) => match incoming {
                    Some(Ok(text)) => self.receive(&text),
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        self.connection_lost(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!("transport closed by server");
                        self.connection_lost("connection closed by server".into());
                    }
                },

                now = tick_opt(&mut self.heartbeat) => {
                    self.core.connection.ping(now);
                }

                _ = self.sync_tick.tick(), if self.core.sync.has_staged_changes() => {
                    if let Some(delta) = self.core.sync.flush_changes() {
                        self.core.fx.send(delta);
                    }
                }

                () = sleep_until_opt(self.core.rpc.next_deadline()) => {
                    self.core.rpc.expire(Instant::now());
                }

                Some(joined) = self.rpc_tasks.join_next(), if !self.rpc_tasks.is_empty() => {
                    match joined {
                        Ok((call_id, outcome)) => {
                            self.core.fx.send(rpc::response(call_id, outcome))
                        }
                        Err(e) => warn!("RPC handler task failed: {e}"),
                    }
                }
            }

            // A first staged change waits one full period, not for ticks missed while idle.
            if !was_staged && self.core.sync.has_staged_changes() {
                self.sync_tick.reset();
            }
            self.pump().await;
        }

        self.rpc_tasks.abort_all();
        debug!("session loop exited");
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn begin_connect(&mut self, session_id: Option<String>, reply: oneshot::Sender<Result<()>>) {
        match self.core.connection.state() {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.connect_waiters.push(reply);
            }
            ConnectionState::Disconnected => {
                self.core.connection.begin_connect(session_id);
                self.connect_waiters.push(reply);
                self.start_open();
            }
        }
    }

    fn start_open(&mut self) {
        let session_id = self.core.connection.session_id().map(str::to_owned);
        self.opening = Some(open_transport(
            Arc::clone(&self.connector),
            session_id,
            self.config.connection.connection_timeout,
        ));
    }

    fn open_finished(&mut self, opened: Result<Box<dyn Transport>>) {
        match opened {
            Ok(transport) => {
                self.transport = Some(transport);
                let reconnected = self.core.connection.opened();
                let heartbeat = self.config.connection.heartbeat_interval;
                self.heartbeat = Some(periodic(heartbeat, heartbeat));
                self.core.fx.emit(NetplayEvent::Connected);
                if reconnected {
                    self.core.fx.emit(NetplayEvent::Reconnected);
                }
                self.publish_state();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) if self.core.connection.state() == ConnectionState::Connecting => {
                warn!("connect failed: {e}");
                self.core.connection.connect_failed();
                self.publish_state();
                let mut waiters = self.connect_waiters.drain(..);
                if let Some(first) = waiters.next() {
                    let _ = first.send(Err(e));
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(NetplayError::NotConnected));
                }
            }
            Err(e) => {
                warn!("reconnect attempt failed: {e}");
                self.connection_lost(e.to_string());
            }
        }
    }

    /// The transport died or a retry failed: schedule the next retry or give up.
    fn connection_lost(&mut self, reason: String) {
        self.transport = None;
        self.heartbeat = None;
        match self.core.connection.lost() {
            Recovery::Retry { attempt, delay } => {
                self.reconnect_at = Some(Instant::now() + delay);
                self.core
                    .fx
                    .emit(NetplayEvent::Reconnecting { attempt, delay });
            }
            Recovery::GiveUp { attempts } => {
                self.reconnect_at = None;
                self.publish_state();
                let reason = if attempts > 0 {
                    NetplayError::ReconnectExhausted { attempts }.to_string()
                } else {
                    reason
                };
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(NetplayError::ReconnectExhausted { attempts }));
                }
                self.core.fx.emit(NetplayEvent::Disconnected {
                    reason: Some(reason),
                });
            }
        }
    }

    async fn close_transport(&mut self) {
        self.opening = None;
        self.reconnect_at = None;
        self.heartbeat = None;
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {e}");
            }
        }
    }

    async fn disconnect(&mut self) {
        let was_active = self.core.connection.state() != ConnectionState::Disconnected;
        self.close_transport().await;
        self.core.connection.close();
        self.publish_state();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(NetplayError::NotConnected));
        }
        if was_active {
            self.core.fx.emit(NetplayEvent::Disconnected {
                reason: Some("disconnected by client".into()),
            });
        }
    }

    /// Final teardown before the loop exits.
    async fn stop(&mut self, reason: &str) {
        self.core.rpc.clear_pending();
        self.close_transport().await;
        self.core.connection.close();
        self.connect_waiters.clear();
        self.publish_state();
        emit_event(
            &self.event_tx,
            NetplayEvent::Disconnected {
                reason: Some(reason.to_owned()),
            },
        )
        .await;
    }

    // ── Message flow ────────────────────────────────────────────────

    fn receive(&mut self, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => self.core.handle_incoming(envelope, Instant::now()),
            Err(e) => warn!("dropping malformed message: {e}"),
        }
    }

    /// Apply everything the last step produced: spawn deferred RPC handlers,
    /// queue messages, emit events, write while connected.
    async fn pump(&mut self) {
        loop {
            for call in self.core.deferred.drain(..) {
                spawn_handler(&mut self.rpc_tasks, call);
            }
            let fx = std::mem::take(&mut self.core.fx);
            if fx.is_empty() && !self.has_writable() {
                break;
            }
            for message in fx.messages {
                self.core.connection.enqueue(message);
            }
            self.publish_state();
            for event in fx.events {
                emit_event(&self.event_tx, event).await;
            }
            self.flush().await;
        }
        self.publish_state();
    }

    fn has_writable(&self) -> bool {
        self.transport.is_some()
            && self.core.connection.is_connected()
            && self.core.connection.queued() > 0
    }

    async fn flush(&mut self) {
        while let Some(envelope) = self.core.connection.next_outgoing() {
            let Some(transport) = self.transport.as_mut() else {
                self.core.connection.requeue_front(envelope);
                return;
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    error!(kind = %envelope.message.kind(), "failed to serialize message: {e}");
                    continue;
                }
            };
            if let Err(e) = transport.send(text).await {
                error!("transport send error: {e}");
                self.core.connection.requeue_front(envelope);
                self.connection_lost(format!("transport send error: {e}"));
                return;
            }
        }
    }

    /// Mirror the connection state for the handle. Called before any reply or
    /// event that reveals a transition.
    fn publish_state(&self) {
        self.shared
            .connection
            .store(self.core.connection.state().to_u8(), Ordering::Release);
    }
}

/// Run an async RPC handler on its own task so a panic is reported as an
/// error response instead of losing the call id.
fn spawn_handler(tasks: &mut JoinSet<(String, RpcResult)>, call: DeferredCall) {
    let DeferredCall {
        call_id,
        method,
        future,
    } = call;
    tasks.spawn(async move {
        let outcome = match tokio::spawn(future).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(format!("handler for {method} panicked")),
            Err(e) => Err(e.to_string()),
        };
        (call_id, outcome)
    });
}

/// Emit an event. Ordinary events are dropped with a warning when the channel
/// is full so the loop never blocks; `Disconnected` waits for room.
async fn emit_event(event_tx: &mpsc::Sender<NetplayEvent>, event: NetplayEvent) {
    if matches!(event, NetplayEvent::Disconnected { .. }) {
        if event_tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
        return;
    }
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{LobbyPlayer, LobbyState, LobbyUpdatePayload};
    use serde_json::json;

    fn envelope(message: Message) -> Envelope {
        Envelope::new(message)
    }

    fn welcomed_core() -> SessionCore {
        let mut core = SessionCore::new(&NetplayConfig::new());
        core.handle_incoming(
            envelope(Message::Welcome {
                player_id: "A".into(),
                session_id: "S".into(),
                server_time: 1,
            }),
            Instant::now(),
        );
        core.fx = Effects::new();
        core
    }

    #[tokio::test]
    async fn welcome_assigns_identity_everywhere() {
        let core = welcomed_core();
        assert_eq!(core.connection.player_id(), Some("A"));
        assert_eq!(core.connection.session_id(), Some("S"));
        assert_eq!(core.lobby.local_player(), Some("A"));
    }

    #[tokio::test]
    async fn second_welcome_keeps_first_player_id() {
        let mut core = welcomed_core();
        core.handle_incoming(
            envelope(Message::Welcome {
                player_id: "B".into(),
                session_id: "S2".into(),
                server_time: 2,
            }),
            Instant::now(),
        );
        assert_eq!(core.connection.player_id(), Some("A"));
        assert!(matches!(
            core.fx.events.as_slice(),
            [NetplayEvent::Welcome { player_id, .. }] if player_id == "A"
        ));
    }

    #[tokio::test]
    async fn typed_handlers_run_before_wildcard_and_before_components() {
        let mut core = welcomed_core();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        core.handlers.on_any(Box::new(move |_| log.lock().unwrap().push("any")));
        let log = Arc::clone(&seen);
        core.handlers
            .on(MessageKind::Chat, Box::new(move |_| log.lock().unwrap().push("chat")));

        core.handle_incoming(
            envelope(Message::Chat {
                sender_id: "B".into(),
                sender_name: "Bob".into(),
                message: "hi".into(),
                channel: None,
            }),
            Instant::now(),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["chat", "any"]);
        assert!(matches!(core.fx.events.as_slice(), [NetplayEvent::Chat { .. }]));
    }

    #[tokio::test]
    async fn remote_input_is_buffered_and_cleared_on_leave() {
        let mut core = welcomed_core();
        core.handle_incoming(
            serde_json::from_value(json!({
                "type": "player_input",
                "playerId": "B",
                "frame": 4,
                "inputs": {"keys": 17}
            }))
            .unwrap(),
            Instant::now(),
        );
        assert_eq!(
            core.inputs.get_input("B", 4).unwrap().inputs,
            InputKeys::UP | InputKeys::JUMP
        );
        core.handle_incoming(
            envelope(Message::PlayerLeave {
                player_id: "B".into(),
                reason: None,
            }),
            Instant::now(),
        );
        assert_eq!(core.inputs.len("B"), 0);
    }

    #[tokio::test]
    async fn server_ping_is_answered_with_pong() {
        let mut core = welcomed_core();
        core.handle_incoming(envelope(Message::Ping), Instant::now());
        assert!(matches!(core.fx.messages.as_slice(), [Message::Pong { .. }]));
    }

    #[tokio::test]
    async fn unknown_rpc_method_is_answered_immediately() {
        let mut core = welcomed_core();
        core.handle_incoming(
            serde_json::from_value(json!({
                "type": "rpc_call",
                "callId": "c1",
                "method": "nope",
                "args": [],
                "target": "A"
            }))
            .unwrap(),
            Instant::now(),
        );
        let [Message::RpcResponse(response)] = core.fx.messages.as_slice() else {
            panic!("expected rpc_response, got {:?}", core.fx.messages);
        };
        assert_eq!(response.call_id, "c1");
        assert!(response.error.as_deref().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn lobby_update_then_game_start_reaches_in_game() {
        let mut core = welcomed_core();
        core.handle_incoming(
            envelope(Message::LobbyUpdate(LobbyUpdatePayload {
                lobby_id: "L1".into(),
                players: vec![LobbyPlayer {
                    id: "A".into(),
                    name: "Alice".into(),
                    is_host: true,
                    is_ready: true,
                }],
                state: LobbyState::Waiting,
                settings: None,
                name: None,
                max_players: None,
                created_at: None,
            })),
            Instant::now(),
        );
        core.handle_incoming(
            envelope(Message::GameStart {
                lobby_id: "L1".into(),
                seed: 9,
                initial_state: json!({}),
            }),
            Instant::now(),
        );
        assert_eq!(core.lobby.current().unwrap().state, LobbyState::InGame);
    }
}

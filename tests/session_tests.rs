#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for `NetplaySession`, driven through an in-memory
//! connector under paused tokio time.

mod common;

use std::time::Duration;

use common::{components, lobby_update, player, wait_for, welcome, MockConnector};
use netplay_client::protocol::{ChangeOperation, LobbyState, RpcCallPayload, RpcResponsePayload};
use netplay_client::{
    ConnectionState, InputExtra, InputKeys, Message, NetplayConfig, NetplayError, NetplayEvent,
    NetplaySession, RpcError, RpcTarget, SyncStrategy,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ── Helpers ─────────────────────────────────────────────────────────

fn ready(lobby_id: &str) -> Message {
    Message::PlayerReady {
        lobby_id: lobby_id.into(),
        ready: true,
    }
}

fn chat(text: &str) -> Message {
    Message::Chat {
        sender_id: "server".into(),
        sender_name: "server".into(),
        message: text.into(),
        channel: None,
    }
}

/// Push a chat line and wait for it, so everything pushed before it has been
/// handled by the session loop.
async fn settle(server: &common::ServerEnd, events: &mut mpsc::Receiver<NetplayEvent>) {
    server.push(chat("marker"));
    wait_for(
        events,
        |e| matches!(e, NetplayEvent::Chat { message, .. } if message == "marker"),
    )
    .await;
}

fn assert_spacing(earlier: tokio::time::Instant, later: tokio::time::Instant, expected_ms: u64) {
    let gap = later - earlier;
    let expected = Duration::from_millis(expected_ms);
    assert!(
        gap >= expected && gap < expected + Duration::from_millis(5),
        "expected ~{expected:?} between attempts, got {gap:?}"
    );
}

// ── Connection ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_emits_connected_and_welcome_assigns_identity() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    session.connect(None).await.unwrap();
    assert_eq!(events.recv().await, Some(NetplayEvent::Connected));
    assert!(session.is_connected());
    assert_eq!(session.player_id().await.unwrap(), None);

    server.push(welcome("P1", "S1"));
    let event = wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;
    assert!(matches!(event, NetplayEvent::Welcome { ref player_id, .. } if player_id == "P1"));
    assert_eq!(session.player_id().await.unwrap().as_deref(), Some("P1"));
    assert_eq!(session.session_id().await.unwrap().as_deref(), Some("S1"));
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_resolves_immediately() {
    let connector = MockConnector::new();
    let _server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    session.connect(None).await.unwrap();
    session.connect(None).await.unwrap();
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_passes_session_id_to_connector() {
    let connector = MockConnector::new();
    let _server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    session.connect(Some("resume-me".into())).await.unwrap();
    assert_eq!(connector.attempts()[0].1.as_deref(), Some("resume-me"));
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_without_retry() {
    let connector = MockConnector::new();
    connector.hang();
    let config = NetplayConfig::new().with_connection_timeout(Duration::from_secs(3));
    let (session, _events) = NetplaySession::start(connector.clone(), config);

    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(err, NetplayError::ConnectTimeout(d) if d == Duration::from_secs(3)));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connect_returns_connector_error() {
    let connector = MockConnector::new();
    connector.refuse();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(err, NetplayError::Io(_)));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn messages_queued_before_connect_flush_in_order() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    session.send(ready("L1")).await.unwrap();
    session
        .send(Message::LeaveLobby {
            lobby_id: "L1".into(),
        })
        .await
        .unwrap();
    assert_eq!(session.queued_messages().await.unwrap(), 2);

    session.connect(None).await.unwrap();
    let first = server.next_message().await;
    let second = server.next_message().await;
    assert_eq!(first.message, ready("L1"));
    assert!(matches!(second.message, Message::LeaveLobby { .. }));
    assert!(first.sequence.unwrap() < second.sequence.unwrap());
    assert_eq!(session.queued_messages().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_exponentially_then_gives_up() {
    let connector = MockConnector::new();
    let server = connector.accept();
    connector.refuse();
    connector.refuse();
    connector.refuse();
    let config = NetplayConfig::new()
        .with_max_reconnect_attempts(3)
        .with_reconnect_delay(Duration::from_millis(1000));
    let (session, mut events) = NetplaySession::start(connector.clone(), config);

    session.connect(None).await.unwrap();
    server.drop_connection();

    let mut retries = Vec::new();
    let reason = loop {
        match events.recv().await.unwrap() {
            NetplayEvent::Reconnecting { attempt, delay } => retries.push((attempt, delay)),
            NetplayEvent::Disconnected { reason } => break reason,
            _ => {}
        }
    };
    assert_eq!(
        retries,
        vec![
            (1, Duration::from_millis(1000)),
            (2, Duration::from_millis(2000)),
            (3, Duration::from_millis(4000)),
        ]
    );
    assert_eq!(reason.as_deref(), Some("gave up after 3 reconnect attempts"));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    assert_spacing(attempts[1].0, attempts[2].0, 2000);
    assert_spacing(attempts[2].0, attempts[3].0, 4000);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn no_reconnect_when_disabled() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let config = NetplayConfig::new().with_auto_reconnect(false);
    let (session, mut events) = NetplaySession::start(connector.clone(), config);

    session.connect(None).await.unwrap();
    server.drop_connection();
    let event = wait_for(&mut events, |e| {
        matches!(e, NetplayEvent::Disconnected { .. } | NetplayEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(event, NetplayEvent::Disconnected { .. }));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_session_and_flushes_queue() {
    let connector = MockConnector::new();
    let first = connector.accept();
    let mut second = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    session.connect(None).await.unwrap();
    first.push(welcome("P1", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    first.drop_connection();
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Reconnecting { .. })).await;
    assert_eq!(session.connection_state(), ConnectionState::Reconnecting);

    session.send(ready("L1")).await.unwrap();
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Reconnected)).await;

    assert_eq!(second.next_non_ping().await.message, ready("L1"));
    assert_eq!(connector.attempts()[1].1.as_deref(), Some("S1"));
    assert_eq!(session.player_id().await.unwrap().as_deref(), Some("P1"));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_measures_latency() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let config = NetplayConfig::new().with_heartbeat_interval(Duration::from_secs(1));
    let (session, mut events) = NetplaySession::start(connector.clone(), config);

    session.connect(None).await.unwrap();
    assert_eq!(session.latency().await.unwrap(), None);

    let ping = server.next_message().await;
    assert_eq!(ping.message, Message::Ping);

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.push(Message::Pong { server_time: 0 });
    let NetplayEvent::Pong { rtt } =
        wait_for(&mut events, |e| matches!(e, NetplayEvent::Pong { .. })).await
    else {
        unreachable!()
    };
    assert!(rtt >= Duration::from_millis(50));
    assert_eq!(session.latency().await.unwrap(), Some(rtt));
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_transport_and_stops_heartbeats() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let config = NetplayConfig::new().with_heartbeat_interval(Duration::from_secs(1));
    let (session, mut events) = NetplaySession::start(connector.clone(), config);

    session.connect(None).await.unwrap();
    session.disconnect().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, NetplayEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        NetplayEvent::Disconnected {
            reason: Some("disconnected by client".into())
        }
    );
    assert!(server.was_closed());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(server.try_next().is_none());
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_dropped() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());

    session.connect(None).await.unwrap();
    server.push_raw("not json at all");
    server.push_raw(r#"{"type":"teleport","to":"moon"}"#);
    server.push_raw(r#"{"type":"welcome"}"#);
    settle(&server, &mut events).await;

    assert!(session.is_connected());
    assert_eq!(session.player_id().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn typed_handler_sees_incoming_messages_until_removed() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let id = session
        .on(netplay_client::MessageKind::GameEnd, move |envelope| {
            let _ = seen_tx.send(envelope.message.clone());
        })
        .await
        .unwrap();

    server.push(Message::GameEnd {
        reason: "timeout".into(),
        results: None,
    });
    wait_for(&mut events, |e| matches!(e, NetplayEvent::GameEnded { .. })).await;
    assert!(matches!(seen_rx.try_recv(), Ok(Message::GameEnd { .. })));

    assert!(session.off(id).await.unwrap());
    assert!(!session.off(id).await.unwrap());
    server.push(Message::GameEnd {
        reason: "again".into(),
        results: None,
    });
    wait_for(&mut events, |e| matches!(e, NetplayEvent::GameEnded { .. })).await;
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn server_error_is_surfaced_as_event() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    server.push_raw(r#"{"type":"error","code":"LOBBY_FULL","message":"no room","timestamp":1}"#);
    let event = wait_for(&mut events, |e| matches!(e, NetplayEvent::ServerError { .. })).await;
    let NetplayEvent::ServerError { code, message, .. } = event else {
        unreachable!()
    };
    assert_eq!(code, netplay_client::ErrorCode::LobbyFull);
    assert_eq!(message, "no room");
    assert!(session.is_connected());
}

// ── RPC ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rpc_round_trip() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    let server_side = async {
        let Message::RpcCall(call) = server.next_non_ping().await.message else {
            panic!("expected rpc_call");
        };
        assert_eq!(call.method, "add");
        assert_eq!(call.args, vec![json!(1), json!(2)]);
        assert_eq!(call.target, RpcTarget::Server);
        server.push(Message::RpcResponse(RpcResponsePayload {
            call_id: call.call_id,
            result: Some(json!(3)),
            error: None,
        }));
    };
    let (result, ()) = tokio::join!(
        session.call_server("add", vec![json!(1), json!(2)]),
        server_side
    );
    assert_eq!(result.unwrap(), json!(3));
}

#[tokio::test(start_paused = true)]
async fn rpc_remote_error_rejects_call() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    let server_side = async {
        let Message::RpcCall(call) = server.next_non_ping().await.message else {
            panic!("expected rpc_call");
        };
        assert_eq!(call.target, RpcTarget::Client("P2".into()));
        server.push(Message::RpcResponse(RpcResponsePayload {
            call_id: call.call_id,
            result: None,
            error: Some("boom".into()),
        }));
    };
    let (result, ()) = tokio::join!(session.call_client("P2", "explode", vec![]), server_side);
    match result.unwrap_err() {
        NetplayError::Rpc(RpcError::Remote { method, message }) => {
            assert_eq!(method, "explode");
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn rpc_times_out_and_ignores_late_response() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let config = NetplayConfig::new().with_call_timeout(Duration::from_secs(2));
    let (session, mut events) = NetplaySession::start(connector.clone(), config);
    session.connect(None).await.unwrap();

    let (result, call) = tokio::join!(session.call_server("foo", vec![]), server.next_non_ping());
    match result.unwrap_err() {
        NetplayError::Rpc(RpcError::Timeout { method, timeout, .. }) => {
            assert_eq!(method, "foo");
            assert_eq!(timeout, Duration::from_secs(2));
        }
        other => panic!("unexpected error: {other}"),
    }

    let Message::RpcCall(call) = call.message else {
        panic!("expected rpc_call");
    };
    server.push(Message::RpcResponse(RpcResponsePayload {
        call_id: call.call_id,
        result: Some(json!("late")),
        error: None,
    }));
    settle(&server, &mut events).await;
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn clear_pending_cancels_outstanding_calls() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    let clear = async {
        server.next_non_ping().await;
        session.clear_pending().await.unwrap()
    };
    let (result, cleared) = tokio::join!(session.call_all("slow", vec![]), clear);
    assert_eq!(cleared, 1);
    assert!(matches!(
        result,
        Err(NetplayError::Rpc(RpcError::Cancelled { ref method })) if method == "slow"
    ));
}

#[tokio::test(start_paused = true)]
async fn incoming_calls_reach_sync_and_async_handlers() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    session
        .register_rpc("add", |args: Vec<Value>| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        })
        .await
        .unwrap();
    session
        .register_rpc_async("slow", |_args: Vec<Value>| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("done"))
        })
        .await
        .unwrap();

    for (call_id, method) in [("c1", "slow"), ("c2", "add"), ("c3", "missing")] {
        server.push(Message::RpcCall(RpcCallPayload {
            call_id: call_id.into(),
            method: method.into(),
            args: vec![json!(2), json!(5)],
            target: RpcTarget::Client("P1".into()),
        }));
    }

    let mut responses = Vec::new();
    while responses.len() < 3 {
        if let Message::RpcResponse(response) = server.next_non_ping().await.message {
            responses.push(response);
        }
    }
    // The async handler answers last even though it was called first.
    assert_eq!(responses[0].call_id, "c2");
    assert_eq!(responses[0].result, Some(json!(7)));
    assert_eq!(responses[1].call_id, "c3");
    assert_eq!(
        responses[1].error.as_deref(),
        Some("unknown RPC method: missing")
    );
    assert_eq!(responses[2].call_id, "c1");
    assert_eq!(responses[2].result, Some(json!("done")));
}

#[tokio::test(start_paused = true)]
async fn unregistered_rpc_answers_unknown_method() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    let registration = session
        .register_rpc("echo", |args: Vec<Value>| Ok(Value::Array(args)))
        .await
        .unwrap();
    assert!(session.unregister_rpc(registration).await.unwrap());

    server.push(Message::RpcCall(RpcCallPayload {
        call_id: "c1".into(),
        method: "echo".into(),
        args: vec![],
        target: RpcTarget::All,
    }));
    let Message::RpcResponse(response) = server.next_non_ping().await.message else {
        panic!("expected rpc_response");
    };
    assert_eq!(response.error.as_deref(), Some("unknown RPC method: echo"));
}

#[tokio::test(start_paused = true)]
async fn async_rpc_handler_panicking_before_await_answers_with_error() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, _events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    session
        .register_rpc_async("first_arg", |args: Vec<Value>| {
            let first = args[0].clone();
            async move { Ok(first) }
        })
        .await
        .unwrap();

    for (call_id, args) in [("c1", vec![]), ("c2", vec![json!("hi")])] {
        server.push(Message::RpcCall(RpcCallPayload {
            call_id: call_id.into(),
            method: "first_arg".into(),
            args,
            target: RpcTarget::Server,
        }));
    }

    let mut responses = Vec::new();
    while responses.len() < 2 {
        if let Message::RpcResponse(response) = server.next_non_ping().await.message {
            responses.push(response);
        }
    }
    assert_eq!(responses[0].call_id, "c1");
    assert_eq!(
        responses[0].error.as_deref(),
        Some("handler for first_arg panicked")
    );
    // The session loop survived and keeps answering.
    assert_eq!(responses[1].call_id, "c2");
    assert_eq!(responses[1].result, Some(json!("hi")));
    assert!(session.is_connected());
}

// ── Lobby ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn lobby_join_ready_and_game_start() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();
    server.push(welcome("P1", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    session.join_lobby("L1", "Alice", None).await.unwrap();
    let Message::JoinLobby {
        lobby_id,
        player_name,
        create,
        ..
    } = server.next_non_ping().await.message
    else {
        panic!("expected join_lobby");
    };
    assert_eq!((lobby_id.as_str(), player_name.as_str()), ("L1", "Alice"));
    assert!(create.is_none());
    assert_eq!(session.current_lobby().await.unwrap(), None);

    server.push(lobby_update(
        "L1",
        vec![player("P1", true, false), player("P2", false, false)],
    ));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::LobbyJoined(_))).await;
    assert!(session.is_host().await.unwrap());
    assert!(!session.all_players_ready().await.unwrap());

    session.set_ready(true).await.unwrap();
    assert_eq!(server.next_non_ping().await.message, ready("L1"));

    server.push(lobby_update(
        "L1",
        vec![player("P1", true, true), player("P2", false, true)],
    ));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::LobbyUpdated(_))).await;
    assert!(session.all_players_ready().await.unwrap());

    let seed = session.start_game(json!({"map": "arena"})).await.unwrap();
    let seed = seed.expect("host may start the game");
    let Message::GameStart {
        seed: sent_seed, ..
    } = server.next_non_ping().await.message
    else {
        panic!("expected game_start");
    };
    assert_eq!(sent_seed, seed);
    assert_eq!(
        session.current_lobby().await.unwrap().unwrap().state,
        LobbyState::Starting
    );

    server.push(Message::GameStart {
        lobby_id: "L1".into(),
        seed,
        initial_state: json!({"map": "arena"}),
    });
    let event = wait_for(&mut events, |e| matches!(e, NetplayEvent::GameStarted { .. })).await;
    assert!(matches!(event, NetplayEvent::GameStarted { seed: s, .. } if s == seed));
    assert_eq!(
        session.current_lobby().await.unwrap().unwrap().state,
        LobbyState::InGame
    );
}

#[tokio::test(start_paused = true)]
async fn non_host_cannot_start_game_or_change_settings() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();
    server.push(welcome("P2", "S1"));
    server.push(lobby_update(
        "L1",
        vec![player("P1", true, true), player("P2", false, true)],
    ));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::LobbyJoined(_))).await;

    assert_eq!(session.start_game(json!({})).await.unwrap(), None);
    assert!(!session
        .update_settings(components(json!({"mode": "ffa"})))
        .await
        .unwrap());

    // Nothing went out for either call: the next message is the marker.
    session.set_ready(false).await.unwrap();
    assert!(matches!(
        server.next_non_ping().await.message,
        Message::PlayerReady { ready: false, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn leave_lobby_clears_state_and_notifies() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();
    server.push(welcome("P1", "S1"));
    server.push(lobby_update("L1", vec![player("P1", true, false)]));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::LobbyJoined(_))).await;

    session.leave_lobby().await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, NetplayEvent::LobbyLeft { .. })).await;
    assert_eq!(
        event,
        NetplayEvent::LobbyLeft {
            lobby_id: "L1".into()
        }
    );
    assert_eq!(session.current_lobby().await.unwrap(), None);
    assert!(matches!(
        server.next_non_ping().await.message,
        Message::LeaveLobby { ref lobby_id } if lobby_id == "L1"
    ));
}

// ── State sync ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sync_tick_sends_filtered_delta() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let config = NetplayConfig::new().with_sync_components(["x"]);
    let (session, mut events) = NetplaySession::start(connector.clone(), config);
    session.connect(None).await.unwrap();
    server.push(welcome("A", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    session
        .register_entity("p1", components(json!({"x": 0, "y": 0})))
        .await
        .unwrap();
    let Message::EntitySpawn {
        entity_id,
        owner_id,
        components: spawned,
    } = server.next_non_ping().await.message
    else {
        panic!("expected entity_spawn");
    };
    assert_eq!((entity_id.as_str(), owner_id.as_str()), ("p1", "A"));
    assert_eq!(spawned, components(json!({"x": 0})));

    assert!(session
        .update_entity("p1", components(json!({"x": 5, "y": 9})))
        .await
        .unwrap());
    assert!(!session
        .update_entity("ghost", components(json!({"x": 1})))
        .await
        .unwrap());

    let Message::StateDelta(delta) = server.next_non_ping().await.message else {
        panic!("expected state_delta");
    };
    assert_eq!(delta.changes.len(), 1);
    let change = &delta.changes[0];
    assert_eq!(change.entity_id, "p1");
    assert_eq!(change.operation, ChangeOperation::Update);
    assert_eq!(change.components, Some(components(json!({"x": 5}))));

    let stored = session.entity("p1").await.unwrap().unwrap();
    assert_eq!(stored.components, components(json!({"x": 5, "y": 9})));
}

#[tokio::test(start_paused = true)]
async fn first_change_after_idle_waits_a_full_sync_period() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let config = NetplayConfig::new().with_sync_rate(10);
    let (session, mut events) = NetplaySession::start(connector.clone(), config);
    session.connect(None).await.unwrap();
    server.push(welcome("A", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    session
        .register_entity("p1", components(json!({"x": 0})))
        .await
        .unwrap();
    assert!(matches!(
        server.next_non_ping().await.message,
        Message::EntitySpawn { .. }
    ));

    // Idle across several sync periods.
    tokio::time::sleep(Duration::from_millis(1_050)).await;

    let staged_at = tokio::time::Instant::now();
    session
        .update_entity("p1", components(json!({"x": 3})))
        .await
        .unwrap();
    let Message::StateDelta(_) = server.next_non_ping().await.message else {
        panic!("expected state_delta");
    };
    assert_spacing(staged_at, tokio::time::Instant::now(), 100);
}

async fn local_entity_after_remote_update(strategy: SyncStrategy) -> Value {
    let connector = MockConnector::new();
    let server = connector.accept();
    let config = NetplayConfig::new().with_strategy(strategy);
    let (session, mut events) = NetplaySession::start(connector.clone(), config);
    session.connect(None).await.unwrap();
    server.push(welcome("A", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    session
        .register_entity("p1", components(json!({"x": 5})))
        .await
        .unwrap();
    server.push(Message::EntityUpdate {
        entity_id: "p1".into(),
        components: components(json!({"x": 100})),
        owner_id: None,
    });
    settle(&server, &mut events).await;

    let entity = session.entity("p1").await.unwrap().unwrap();
    entity.components["x"].clone()
}

#[tokio::test(start_paused = true)]
async fn prediction_keeps_local_state_authoritative_overrides_it() {
    assert_eq!(
        local_entity_after_remote_update(SyncStrategy::ClientPrediction).await,
        json!(5)
    );
    assert_eq!(
        local_entity_after_remote_update(SyncStrategy::Authoritative).await,
        json!(100)
    );
}

#[tokio::test(start_paused = true)]
async fn remote_entities_are_tracked_by_owner() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();
    server.push(welcome("A", "S1"));

    server.push(Message::EntitySpawn {
        entity_id: "e9".into(),
        owner_id: "B".into(),
        components: components(json!({"hp": 10})),
    });
    settle(&server, &mut events).await;
    let owned = session.player_entities("B").await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, "e9");

    server.push(Message::EntityDestroy {
        entity_id: "e9".into(),
    });
    settle(&server, &mut events).await;
    assert!(session.all_entities().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn tick_and_rollback_through_session() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();
    server.push(welcome("A", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    session
        .register_entity("p1", components(json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(session.tick().await.unwrap(), 1);
    session
        .update_entity("p1", components(json!({"x": 2})))
        .await
        .unwrap();
    assert_eq!(session.tick().await.unwrap(), 2);

    assert!(session.rollback_to_frame(1).await.unwrap());
    assert_eq!(session.current_frame().await.unwrap(), 1);
    let entity = session.entity("p1").await.unwrap().unwrap();
    assert_eq!(entity.components["x"], json!(1));
    assert!(!session.rollback_to_frame(40).await.unwrap());
}

// ── Input and chat ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn send_input_requires_identity_then_sends() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    let err = session
        .send_input(1, InputKeys::UP, InputExtra::default())
        .await
        .unwrap_err();
    assert!(matches!(err, NetplayError::NotConnected));

    server.push(welcome("A", "S1"));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::Welcome { .. })).await;

    let stored = session
        .send_input(3, InputKeys::UP | InputKeys::JUMP, InputExtra::default())
        .await
        .unwrap();
    assert_eq!(stored.frame, 3);

    let Message::PlayerInput(input) = server.next_non_ping().await.message else {
        panic!("expected player_input");
    };
    assert_eq!(input.player_id, "A");
    assert_eq!(input.frame, 3);
    assert_eq!(input.inputs.keys, InputKeys::UP | InputKeys::JUMP);

    assert_eq!(session.get_input("A", 3).await.unwrap(), Some(stored.clone()));
    assert_eq!(session.get_unacknowledged_inputs("A").await.unwrap().len(), 1);
    session.acknowledge_inputs("A", 3).await.unwrap();
    assert!(session.get_unacknowledged_inputs("A").await.unwrap().is_empty());

    let predicted = session.predict_input("A", 9).await.unwrap().unwrap();
    assert_eq!(predicted.frame, 9);
    assert_eq!(predicted.inputs, stored.inputs);
}

#[tokio::test(start_paused = true)]
async fn remote_input_is_buffered_and_reported() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    for frame in [2, 1] {
        server.push_raw(&format!(
            r#"{{"type":"player_input","playerId":"B","frame":{frame},"inputs":{{"keys":4}},"timestamp":0}}"#
        ));
    }
    wait_for(&mut events, |e| {
        matches!(e, NetplayEvent::InputReceived { frame: 1, .. })
    })
    .await;

    let range = session.get_input_range("B", 0, 10).await.unwrap();
    assert_eq!(range.iter().map(|f| f.frame).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(
        session.get_latest_input("B").await.unwrap().unwrap().frame,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn chat_is_signed_with_lobby_name() {
    let connector = MockConnector::new();
    let mut server = connector.accept();
    let (session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();
    server.push(welcome("P1", "S1"));
    server.push(lobby_update("L1", vec![player("P1", true, false)]));
    wait_for(&mut events, |e| matches!(e, NetplayEvent::LobbyJoined(_))).await;

    session.send_chat("gg", Some("team".into())).await.unwrap();
    let Message::Chat {
        sender_id,
        sender_name,
        message,
        channel,
    } = server.next_non_ping().await.message
    else {
        panic!("expected chat");
    };
    assert_eq!(sender_id, "P1");
    assert_eq!(sender_name, "player-P1");
    assert_eq!(message, "gg");
    assert_eq!(channel.as_deref(), Some("team"));
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_closes_and_rejects_further_calls() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (mut session, mut events) = NetplaySession::start(connector.clone(), NetplayConfig::new());
    session.connect(None).await.unwrap();

    session.shutdown().await;
    let event = wait_for(&mut events, |e| matches!(e, NetplayEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        NetplayEvent::Disconnected {
            reason: Some("session shut down".into())
        }
    );
    assert!(server.was_closed());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    assert!(matches!(
        session.player_id().await,
        Err(NetplayError::NotConnected)
    ));
    assert!(matches!(
        session.connect(None).await,
        Err(NetplayError::NotConnected)
    ));
}

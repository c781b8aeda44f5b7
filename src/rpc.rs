//! Remote procedure calls correlated by call id.
//!
//! Outgoing calls get a call id that is unique by construction: a random
//! per-manager prefix plus a monotonic counter. Each call waits in a pending
//! table with its own deadline; the first of response or deadline removes it,
//! so a late or duplicate response finds nothing and is ignored.
//!
//! Incoming calls are looked up in the handler table. Synchronous handlers
//! answer inline; asynchronous handlers are returned to the session loop as
//! a [`DeferredCall`] and answered when their future completes.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::protocol::{Message, RpcCallPayload, RpcResponsePayload, RpcTarget};

/// Outcome of a handler: a result value or an error message.
pub type RpcResult = std::result::Result<Value, String>;

/// Boxed future returned by asynchronous handlers.
pub type RpcFuture = Pin<Box<dyn Future<Output = RpcResult> + Send>>;

/// Receiving half of an outstanding call.
pub type CallReceiver = oneshot::Receiver<std::result::Result<Value, RpcError>>;

type SyncHandler = Arc<dyn Fn(Vec<Value>) -> RpcResult + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Vec<Value>) -> RpcFuture + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Handle returned by `register`; pass it to
/// [`unregister`](RpcManager::unregister).
///
/// A handle only removes the registration it was issued for, so a stale handle
/// cannot remove a handler registered later under the same method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpcRegistration {
    method: String,
    id: u64,
}

impl RpcRegistration {
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// An incoming call whose asynchronous handler still has to run.
pub struct DeferredCall {
    pub call_id: String,
    pub method: String,
    pub future: RpcFuture,
}

impl std::fmt::Debug for DeferredCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCall")
            .field("call_id", &self.call_id)
            .field("method", &self.method)
            .finish()
    }
}

/// How an incoming `rpc_call` is answered.
#[derive(Debug)]
pub enum Dispatch {
    /// Send this response now.
    Reply(Message),
    /// Run the future, then send [`response`] with its outcome.
    Deferred(DeferredCall),
}

struct PendingCall {
    method: String,
    deadline: Instant,
    reply: oneshot::Sender<std::result::Result<Value, RpcError>>,
}

/// Build the `rpc_response` for a handler outcome.
pub fn response(call_id: String, outcome: RpcResult) -> Message {
    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(message) => (None, Some(message)),
    };
    Message::RpcResponse(RpcResponsePayload {
        call_id,
        result,
        error,
    })
}

/// Pending-call table and handler registry.
pub struct RpcManager {
    call_timeout: Duration,
    call_prefix: String,
    next_call: u64,
    next_registration: u64,
    handlers: HashMap<String, (u64, Handler)>,
    pending: HashMap<String, PendingCall>,
}

impl RpcManager {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            call_prefix: uuid::Uuid::new_v4().simple().to_string(),
            next_call: 0,
            next_registration: 0,
            handlers: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ── Handlers ────────────────────────────────────────────────────

    fn insert(&mut self, method: &str, handler: Handler) -> RpcRegistration {
        self.next_registration += 1;
        let id = self.next_registration;
        if self
            .handlers
            .insert(method.to_owned(), (id, handler))
            .is_some()
        {
            debug!(method, "replacing RPC handler");
        }
        RpcRegistration {
            method: method.to_owned(),
            id,
        }
    }

    /// Register a synchronous handler. An existing handler for `method` is
    /// replaced.
    pub fn register<F>(&mut self, method: &str, handler: F) -> RpcRegistration
    where
        F: Fn(Vec<Value>) -> RpcResult + Send + Sync + 'static,
    {
        self.insert(method, Handler::Sync(Arc::new(handler)))
    }

    /// Register an asynchronous handler. An existing handler for `method` is
    /// replaced.
    pub fn register_async<F, Fut>(&mut self, method: &str, handler: F) -> RpcRegistration
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.insert(method, Handler::Async(handler))
    }

    /// Remove the handler a registration refers to. Returns `false` if it was
    /// already removed or replaced.
    pub fn unregister(&mut self, registration: &RpcRegistration) -> bool {
        match self.handlers.get(&registration.method) {
            Some((id, _)) if *id == registration.id => {
                self.handlers.remove(&registration.method);
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Answer an incoming `rpc_call`.
    pub fn handle_call(&self, call: RpcCallPayload) -> Dispatch {
        let RpcCallPayload {
            call_id,
            method,
            args,
            ..
        } = call;

        let Some((_, handler)) = self.handlers.get(&method) else {
            warn!(method = %method, call_id = %call_id, "RPC call for unknown method");
            return Dispatch::Reply(response(
                call_id,
                Err(RpcError::UnknownMethod(method).to_string()),
            ));
        };

        match handler.clone() {
            Handler::Sync(f) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| f(args)))
                    .unwrap_or_else(|_| Err(format!("handler for {method} panicked")));
                if let Err(message) = &outcome {
                    debug!(
                        method = %method,
                        call_id = %call_id,
                        error = %message,
                        "RPC handler failed"
                    );
                }
                Dispatch::Reply(response(call_id, outcome))
            }
            // The closure itself runs here, before any task exists to absorb a panic.
            Handler::Async(f) => match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(future) => Dispatch::Deferred(DeferredCall {
                    call_id,
                    future,
                    method,
                }),
                Err(_) => {
                    debug!(
                        method = %method,
                        call_id = %call_id,
                        "RPC handler panicked before its first await"
                    );
                    Dispatch::Reply(response(
                        call_id,
                        Err(format!("handler for {method} panicked")),
                    ))
                }
            },
        }
    }

    // ── Outgoing calls ──────────────────────────────────────────────

    fn next_call_id(&mut self) -> String {
        self.next_call += 1;
        format!("{}-{}", self.call_prefix, self.next_call)
    }

    /// Start a call. Returns the `rpc_call` to send and the receiver that
    /// resolves with the response or the timeout.
    pub fn begin_call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        target: RpcTarget,
        now: Instant,
    ) -> (Message, CallReceiver) {
        let call_id = self.next_call_id();
        let (reply, receiver) = oneshot::channel();
        debug!(method, call_id = %call_id, target = %target, "RPC call");
        self.pending.insert(
            call_id.clone(),
            PendingCall {
                method: method.to_owned(),
                deadline: now + self.call_timeout,
                reply,
            },
        );
        let message = Message::RpcCall(RpcCallPayload {
            call_id,
            method: method.to_owned(),
            args,
            target,
        });
        (message, receiver)
    }

    /// Resolve the pending call a response belongs to. Returns `false` if no
    /// call with that id is pending.
    pub fn handle_response(&mut self, response: RpcResponsePayload) -> bool {
        let Some(call) = self.pending.remove(&response.call_id) else {
            debug!(call_id = %response.call_id, "response for unknown or expired call ignored");
            return false;
        };
        let unknown_method = RpcError::UnknownMethod(call.method.clone()).to_string();
        let outcome = match response.error {
            Some(message) if message == unknown_method => Err(RpcError::UnknownMethod(call.method)),
            Some(message) => Err(RpcError::Remote {
                method: call.method,
                message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        // The caller may have stopped waiting.
        let _ = call.reply.send(outcome);
        true
    }

    /// Earliest deadline among pending calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|c| c.deadline).min()
    }

    /// Reject every call whose deadline is at or before `now`. Returns how
    /// many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for call_id in &expired {
            if let Some(call) = self.pending.remove(call_id) {
                warn!(method = %call.method, call_id = %call_id, "RPC call timed out");
                let _ = call.reply.send(Err(RpcError::Timeout {
                    method: call.method,
                    call_id: call_id.clone(),
                    timeout: self.call_timeout,
                }));
            }
        }
        expired.len()
    }

    /// Reject every outstanding call.
    pub fn clear_pending(&mut self) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            let _ = call.reply.send(Err(RpcError::Cancelled {
                method: call.method,
            }));
        }
        if count > 0 {
            debug!(count, "cleared pending RPC calls");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("call_timeout", &self.call_timeout)
            .field("handlers", &self.handlers.len())
            .field("pending", &self.pending.len())
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
    use serde_json::json;

    fn call_payload(method: &str, args: Vec<Value>) -> RpcCallPayload {
        RpcCallPayload {
            call_id: "remote-1".into(),
            method: method.into(),
            args,
            target: RpcTarget::Server,
        }
    }

    fn reply(dispatch: Dispatch) -> RpcResponsePayload {
        match dispatch {
            Dispatch::Reply(Message::RpcResponse(r)) => r,
            other => panic!("expected immediate reply, got {other:?}"),
        }
    }

    #[test]
    fn call_ids_are_unique_and_share_prefix() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        let now = Instant::now();
        let (a, _ra) = rpc.begin_call("foo", vec![], RpcTarget::Server, now);
        let (b, _rb) = rpc.begin_call("foo", vec![], RpcTarget::Server, now);
        let (Message::RpcCall(a), Message::RpcCall(b)) = (a, b) else {
            panic!("expected rpc_call messages");
        };
        assert_ne!(a.call_id, b.call_id);
        assert_eq!(
            a.call_id.rsplit_once('-').unwrap().0,
            b.call_id.rsplit_once('-').unwrap().0
        );
        assert_eq!(rpc.pending_count(), 2);
    }

    #[test]
    fn call_stays_pending_until_its_response_arrives() {
        let mut rpc = RpcManager::new(Duration::from_secs(10));
        let (message, receiver) =
            rpc.begin_call("add", vec![json!(1)], RpcTarget::Server, Instant::now());
        let Message::RpcCall(call) = message else {
            panic!("expected rpc_call");
        };
        let mut receiver = tokio_test::task::spawn(receiver);
        tokio_test::assert_pending!(receiver.poll());

        assert!(rpc.handle_response(RpcResponsePayload {
            call_id: call.call_id,
            result: Some(json!(1)),
            error: None,
        }));
        assert!(receiver.is_woken());
        let outcome = tokio_test::assert_ready!(receiver.poll());
        assert_eq!(outcome.unwrap().unwrap(), json!(1));
    }

    #[test]
    fn separate_managers_never_collide() {
        let mut one = RpcManager::new(Duration::from_secs(1));
        let mut two = RpcManager::new(Duration::from_secs(1));
        let now = Instant::now();
        let (Message::RpcCall(a), _) = one.begin_call("m", vec![], RpcTarget::All, now) else {
            panic!()
        };
        let (Message::RpcCall(b), _) = two.begin_call("m", vec![], RpcTarget::All, now) else {
            panic!()
        };
        assert_ne!(a.call_id, b.call_id);
    }

    #[tokio::test]
    async fn response_resolves_call() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        let (Message::RpcCall(call), rx) =
            rpc.begin_call("add", vec![json!(1), json!(2)], RpcTarget::Server, Instant::now())
        else {
            panic!()
        };
        assert!(rpc.handle_response(RpcResponsePayload {
            call_id: call.call_id,
            result: Some(json!(3)),
            error: None,
        }));
        assert_eq!(rx.await.unwrap(), Ok(json!(3)));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_rejects_call() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        let (Message::RpcCall(call), rx) =
            rpc.begin_call("boom", vec![], RpcTarget::Others, Instant::now())
        else {
            panic!()
        };
        rpc.handle_response(RpcResponsePayload {
            call_id: call.call_id,
            result: None,
            error: Some("out of mana".into()),
        });
        assert_eq!(
            rx.await.unwrap(),
            Err(RpcError::Remote {
                method: "boom".into(),
                message: "out of mana".into()
            })
        );
    }

    #[tokio::test]
    async fn timeout_rejects_and_late_response_is_ignored() {
        let timeout = Duration::from_millis(500);
        let mut rpc = RpcManager::new(timeout);
        let start = Instant::now();
        let (Message::RpcCall(call), rx) =
            rpc.begin_call("foo", vec![json!(1)], RpcTarget::Server, start)
        else {
            panic!()
        };
        assert_eq!(rpc.next_deadline(), Some(start + timeout));

        assert_eq!(rpc.expire(start + Duration::from_millis(499)), 0);
        assert_eq!(rpc.expire(start + timeout), 1);

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("foo"), "{err}");
        assert_eq!(rpc.pending_count(), 0);
        assert!(rpc.next_deadline().is_none());

        assert!(!rpc.handle_response(RpcResponsePayload {
            call_id: call.call_id,
            result: Some(json!("late")),
            error: None,
        }));
    }

    #[tokio::test]
    async fn clear_pending_rejects_everything() {
        let mut rpc = RpcManager::new(Duration::from_secs(10));
        let (_, rx1) = rpc.begin_call("a", vec![], RpcTarget::Server, Instant::now());
        let (_, rx2) = rpc.begin_call("b", vec![], RpcTarget::Server, Instant::now());
        assert_eq!(rpc.clear_pending(), 2);
        assert_eq!(
            rx1.await.unwrap(),
            Err(RpcError::Cancelled { method: "a".into() })
        );
        assert!(matches!(rx2.await.unwrap(), Err(RpcError::Cancelled { .. })));
    }

    #[test]
    fn unknown_method_replies_with_error_naming_it() {
        let rpc = RpcManager::new(Duration::from_secs(1));
        let r = reply(rpc.handle_call(call_payload("teleport", vec![])));
        assert_eq!(r.call_id, "remote-1");
        assert!(r.result.is_none());
        assert!(r.error.unwrap().contains("teleport"));
    }

    #[tokio::test]
    async fn unknown_method_error_maps_back_on_the_caller() {
        let callee = RpcManager::new(Duration::from_secs(1));
        let mut caller = RpcManager::new(Duration::from_secs(1));
        let (Message::RpcCall(call), rx) =
            caller.begin_call("teleport", vec![], RpcTarget::Server, Instant::now())
        else {
            panic!()
        };
        let r = reply(callee.handle_call(call));
        caller.handle_response(r);
        assert_eq!(
            rx.await.unwrap(),
            Err(RpcError::UnknownMethod("teleport".into()))
        );
    }

    #[test]
    fn sync_handler_result_and_error() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        rpc.register("sum", |args| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        rpc.register("fail", |_| Err("nope".into()));

        let r = reply(rpc.handle_call(call_payload("sum", vec![json!(2), json!(5)])));
        assert_eq!(r.result, Some(json!(7)));

        let r = reply(rpc.handle_call(call_payload("fail", vec![])));
        assert_eq!(r.error.as_deref(), Some("nope"));
    }

    #[test]
    fn panicking_sync_handler_becomes_error_response() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        rpc.register("explode", |_| panic!("kaboom"));
        let r = reply(rpc.handle_call(call_payload("explode", vec![])));
        assert!(r.error.unwrap().contains("explode"));
    }

    #[test]
    fn async_handler_panicking_while_building_its_future_replies_with_error() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        rpc.register_async("first_arg", |args| {
            let first = args[0].clone();
            async move { Ok(first) }
        });
        let r = reply(rpc.handle_call(call_payload("first_arg", vec![])));
        assert_eq!(r.call_id, "remote-1");
        assert_eq!(r.result, None);
        assert!(r.error.unwrap().contains("first_arg"));
    }

    #[tokio::test]
    async fn async_handler_is_deferred() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        rpc.register_async("echo", |args| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });
        match rpc.handle_call(call_payload("echo", vec![json!("hi")])) {
            Dispatch::Deferred(call) => {
                assert_eq!(call.call_id, "remote-1");
                assert_eq!(call.future.await, Ok(json!("hi")));
            }
            other => panic!("expected deferred call, got {other:?}"),
        }
    }

    #[test]
    fn stale_registration_does_not_remove_replacement() {
        let mut rpc = RpcManager::new(Duration::from_secs(1));
        let old = rpc.register("ping", |_| Ok(json!(1)));
        let new = rpc.register("ping", |_| Ok(json!(2)));
        assert!(!rpc.unregister(&old));
        assert!(rpc.is_registered("ping"));
        assert!(rpc.unregister(&new));
        assert!(!rpc.is_registered("ping"));
    }
}

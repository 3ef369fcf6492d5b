//! The hub: RPC + pub/sub engine over registered transports.
//!
//! Symmetric between client and server processes. The hub owns pending-call
//! tracking, the method handler registry (single handler per method, last
//! registration wins), and the subscription registry (many handlers per
//! method, scoped by session). Replies to inbound CALLs always go back out
//! on the transport they arrived on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use lattice_protocol::{ErrorPayload, GLOBAL_SESSION, HubMessage, MessageType};

use crate::error::HubError;
use crate::listeners::Disposer;
use crate::transport::Transport;

/// Default timeout for `call` when neither the call nor the hub overrides it.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Configuration and per-call options
// ============================================================================

/// Hub construction options.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Applied to every `call` without an explicit timeout.
    pub default_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Session scope; defaults to `"global"`.
    pub session_id: Option<String>,
    /// Target room carried on the message.
    pub room: Option<String>,
    /// Overrides the hub default timeout.
    pub timeout: Option<Duration>,
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Session scope; defaults to `"global"`.
    pub session_id: Option<String>,
    /// Target room carried on the message.
    pub room: Option<String>,
}

/// Subscription scoping.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// `None` receives the method across all sessions; `Some(id)` only
    /// messages with that exact `sessionId` (`"global"` is a valid scope).
    pub session_id: Option<String>,
}

// ============================================================================
// Internal registries
// ============================================================================

type CallHandler = Arc<dyn Fn(HubMessage) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type EventHandler = Arc<dyn Fn(&HubMessage) -> anyhow::Result<()> + Send + Sync>;
type ControlHandler = Arc<dyn Fn(&HubMessage) + Send + Sync>;

/// An in-flight RPC awaiting its correlated response.
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Option<Value>, HubError>>,
}

struct Subscription {
    id: u64,
    session_id: Option<String>,
    handler: EventHandler,
}

struct RegisteredTransport {
    transport: Arc<dyn Transport>,
    wiring: Disposer,
    /// Per-transport dispatch task draining the inbound queue in order.
    pump: JoinHandle<()>,
}

struct HubInner {
    config: HubConfig,
    pending: DashMap<String, PendingCall>,
    handlers: DashMap<String, CallHandler>,
    subscriptions: DashMap<String, Vec<Subscription>>,
    control: std::sync::Mutex<Option<ControlHandler>>,
    transports: DashMap<u64, RegisteredTransport>,
    next_id: AtomicU64,
}

// ============================================================================
// Hub
// ============================================================================

/// The call/handle/publish/subscribe surface over one or more transports.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                pending: DashMap::new(),
                handlers: DashMap::new(),
                subscriptions: DashMap::new(),
                control: std::sync::Mutex::new(None),
                transports: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // -- Transport wiring --

    /// Wire a transport's inbound messages into this hub's dispatch loop.
    ///
    /// A hub may have several active transports; outbound sends pick the
    /// first ready one, while replies to inbound CALLs go back out on the
    /// transport that delivered them.
    ///
    /// Inbound messages from one transport are queued and dispatched by a
    /// single task, preserving the transport's delivery order as observed by
    /// subscribers. Only CALL handler execution runs concurrently.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::unbounded_channel::<HubMessage>();
        let hub = self.clone();
        let via = Arc::clone(&transport);
        let pump = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                hub.dispatch(msg, Arc::clone(&via)).await;
            }
        });

        let wiring = transport.on_message(Box::new(move |msg: &HubMessage| {
            // Receiver gone means the transport was unregistered.
            let _ = tx.send(msg.clone());
        }));

        self.inner.transports.insert(id, RegisteredTransport { transport, wiring, pump });
        debug!("Registered transport {}", id);
        id
    }

    /// Unwire a previously registered transport. Does not close it.
    pub fn unregister_transport(&self, id: u64) {
        if let Some((_, registered)) = self.inner.transports.remove(&id) {
            registered.wiring.dispose();
            registered.pump.abort();
            debug!("Unregistered transport {}", id);
        }
    }

    fn ready_transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .transports
            .iter()
            .find(|entry| entry.value().transport.is_ready())
            .map(|entry| Arc::clone(&entry.value().transport))
    }

    // -- RPC --

    /// Send a CALL and await its correlated RESULT or ERROR.
    ///
    /// Settles exactly once: with the peer's result, with the peer's error
    /// ([`HubError::Remote`]), or with a local [`HubError::CallTimeout`].
    pub async fn call(
        &self,
        method: &str,
        data: Option<Value>,
        opts: CallOptions,
    ) -> Result<Option<Value>, HubError> {
        let transport = self.ready_transport().ok_or(HubError::NoTransport)?;

        let session = opts.session_id.unwrap_or_else(|| GLOBAL_SESSION.to_string());
        let mut msg = HubMessage::call(method, session, data);
        if let Some(room) = opts.room {
            msg = msg.with_room(room);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            msg.id.clone(),
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        if let Err(e) = transport.send(&msg).await {
            self.inner.pending.remove(&msg.id);
            return Err(e);
        }

        let timeout = opts.timeout.unwrap_or(self.inner.config.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The pending entry was dropped without settling (hub torn down).
            Ok(Err(_)) => Err(HubError::Closed),
            Err(_) => {
                self.inner.pending.remove(&msg.id);
                debug!("Call '{}' ({}) timed out after {:?}", method, msg.id, timeout);
                Err(HubError::CallTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Register the handler for incoming CALLs on `method`.
    ///
    /// Exactly one handler per method; registering again replaces the
    /// previous one (last registration wins).
    pub fn handle<F, Fut>(&self, method: &str, f: F)
    where
        F: Fn(HubMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |msg| Box::pin(f(msg)));
        if self.inner.handlers.insert(method.to_string(), handler).is_some() {
            info!("Replaced handler for method '{}'", method);
        }
    }

    /// Remove the handler for `method`, if any.
    pub fn unhandle(&self, method: &str) {
        self.inner.handlers.remove(method);
    }

    // -- Pub/sub --

    /// Build and send an EVENT for fan-out to subscribers.
    pub async fn publish(
        &self,
        method: &str,
        data: Option<Value>,
        opts: PublishOptions,
    ) -> Result<(), HubError> {
        let transport = self.ready_transport().ok_or(HubError::NoTransport)?;
        let session = opts.session_id.unwrap_or_else(|| GLOBAL_SESSION.to_string());
        let mut msg = HubMessage::event(method, session, data);
        if let Some(room) = opts.room {
            msg = msg.with_room(room);
        }
        transport.send(&msg).await
    }

    /// Subscribe to EVENT/PUBLISH messages on `method`.
    ///
    /// Multiple subscribers per (method, scope) are allowed and all invoked;
    /// duplicate registrations stack, each with its own disposer. A handler
    /// error is logged and does not block delivery to other subscribers.
    pub fn subscribe<F>(&self, method: &str, f: F, opts: SubscribeOptions) -> Disposer
    where
        F: Fn(&HubMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .entry(method.to_string())
            .or_default()
            .push(Subscription {
                id,
                session_id: opts.session_id,
                handler: Arc::new(f),
            });

        let inner = Arc::clone(&self.inner);
        let method = method.to_string();
        Disposer::new(move || {
            let now_empty = match inner.subscriptions.get_mut(&method) {
                Some(mut subs) => {
                    subs.retain(|s| s.id != id);
                    subs.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.subscriptions.remove_if(&method, |_, subs| subs.is_empty());
            }
        })
    }

    /// RPC first, then publish the event; the publish step does not run when
    /// the RPC fails. Returns the RPC result.
    pub async fn call_and_publish(
        &self,
        call_method: &str,
        publish_method: &str,
        data: Option<Value>,
        opts: CallOptions,
    ) -> Result<Option<Value>, HubError> {
        let result = self.call(call_method, data.clone(), opts.clone()).await?;
        self.publish(
            publish_method,
            data,
            PublishOptions {
                session_id: opts.session_id,
                room: opts.room,
            },
        )
        .await?;
        Ok(result)
    }

    /// Register a handler for inbound SUBSCRIBE/UNSUBSCRIBE control messages
    /// (server glue typically maps these to router room membership).
    pub fn on_control<F>(&self, f: F)
    where
        F: Fn(&HubMessage) + Send + Sync + 'static,
    {
        *self.inner.control.lock().unwrap() = Some(Arc::new(f));
    }

    /// Number of in-flight calls (observability).
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    // -- Dispatch --

    async fn dispatch(&self, msg: HubMessage, via: Arc<dyn Transport>) {
        match msg.kind {
            MessageType::Call => {
                // Handlers may be slow; the full call path runs off the pump
                // so events behind it are not held up. RPCs stay concurrent.
                let hub = self.clone();
                tokio::spawn(async move { hub.dispatch_call(msg, via).await });
            }
            MessageType::Result | MessageType::Error => self.settle(msg),
            MessageType::Event | MessageType::Publish => self.dispatch_event(&msg),
            MessageType::Ping => {
                let pong = HubMessage::pong(&msg);
                if let Err(e) = via.send(&pong).await {
                    warn!("Failed to answer PING {}: {}", msg.id, e);
                }
            }
            MessageType::Pong => {
                // Observed by transports on their read path for liveness;
                // nothing to do at the hub layer.
                debug!("PONG for {:?}", msg.request_id);
            }
            MessageType::Subscribe | MessageType::Unsubscribe => {
                let control = self.inner.control.lock().unwrap().clone();
                match control {
                    Some(handler) => handler(&msg),
                    None => debug!("Dropping {} '{}' (no control handler)", msg.kind, msg.method),
                }
            }
        }
    }

    async fn dispatch_call(&self, msg: HubMessage, via: Arc<dyn Transport>) {
        let handler = self
            .inner
            .handlers
            .get(&msg.method)
            .map(|entry| Arc::clone(entry.value()));

        let response = match handler {
            None => {
                warn!("No handler registered for CALL '{}'", msg.method);
                HubMessage::error_response(
                    &msg,
                    ErrorPayload::new("method_not_found", format!("no handler for '{}'", msg.method)),
                )
            }
            Some(handler) => {
                // Run the handler in its own task so a panic is contained at
                // the dispatch boundary instead of tearing down the read loop.
                let fut = handler(msg.clone());
                match tokio::spawn(fut).await {
                    Ok(Ok(value)) => HubMessage::result(&msg, Some(value)),
                    Ok(Err(e)) => {
                        warn!("Handler for '{}' failed: {:#}", msg.method, e);
                        HubMessage::error_response(
                            &msg,
                            ErrorPayload::new("handler_error", e.to_string()),
                        )
                    }
                    Err(join_err) => {
                        warn!("Handler for '{}' panicked: {}", msg.method, join_err);
                        HubMessage::error_response(
                            &msg,
                            ErrorPayload::new("internal_error", "handler aborted"),
                        )
                    }
                }
            }
        };

        if let Err(e) = via.send(&response).await {
            warn!("Failed to send response for CALL '{}': {}", msg.method, e);
        }
    }

    /// Resolve or reject the pending call correlated to a RESULT/ERROR.
    fn settle(&self, msg: HubMessage) {
        let Some(request_id) = msg.request_id.clone() else {
            warn!("Dropping {} without requestId", msg.kind);
            return;
        };

        match self.inner.pending.remove(&request_id) {
            Some((_, pending)) => {
                let outcome = if msg.is_error() {
                    let payload = msg.error.unwrap_or(ErrorPayload {
                        code: None,
                        message: "unknown peer error".to_string(),
                    });
                    Err(HubError::Remote {
                        code: payload.code.unwrap_or_else(|| "error".to_string()),
                        message: payload.message,
                    })
                } else {
                    Ok(msg.data)
                };
                if pending.tx.send(outcome).is_err() {
                    debug!("Call '{}' ({}) already settled locally", pending.method, request_id);
                }
            }
            // Expected under timeout races and duplicate delivery.
            None => debug!("Dropping response with unknown requestId {}", request_id),
        }
    }

    fn dispatch_event(&self, msg: &HubMessage) {
        // Snapshot matching handlers before invoking so a subscriber can
        // subscribe/dispose without deadlocking the registry.
        let handlers: Vec<EventHandler> = self
            .inner
            .subscriptions
            .get(&msg.method)
            .map(|subs| {
                subs.iter()
                    .filter(|s| match &s.session_id {
                        None => true,
                        Some(scope) => *scope == msg.session_id,
                    })
                    .map(|s| Arc::clone(&s.handler))
                    .collect()
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No subscribers for {} '{}'", msg.kind, msg.method);
            return;
        }

        for handler in handlers {
            if let Err(e) = handler(msg) {
                warn!("Subscriber for '{}' failed: {:#}", msg.method, e);
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_call_without_transport_fails_immediately() {
        let hub = Hub::default();
        let err = hub.call("session.create", None, CallOptions::default()).await;
        assert!(matches!(err, Err(HubError::NoTransport)));
    }

    #[tokio::test]
    async fn test_publish_without_transport_fails_immediately() {
        let hub = Hub::default();
        let err = hub.publish("session.deleted", None, PublishOptions::default()).await;
        assert!(matches!(err, Err(HubError::NoTransport)));
    }

    #[test]
    fn test_subscribe_disposer_removes_entry() {
        let hub = Hub::default();
        let d = hub.subscribe("session.deleted", |_| Ok(()), SubscribeOptions::default());
        assert_eq!(hub.inner.subscriptions.get("session.deleted").unwrap().len(), 1);
        d.dispose();
        assert!(hub.inner.subscriptions.get("session.deleted").is_none());
    }

    #[test]
    fn test_duplicate_subscriptions_stack() {
        let hub = Hub::default();
        let _d1 = hub.subscribe("session.deleted", |_| Ok(()), SubscribeOptions::default());
        let _d2 = hub.subscribe("session.deleted", |_| Ok(()), SubscribeOptions::default());
        assert_eq!(hub.inner.subscriptions.get("session.deleted").unwrap().len(), 2);
    }

    #[test]
    fn test_event_dispatch_respects_session_scope() {
        let hub = Hub::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let _d1 = hub.subscribe(
            "session.deleted",
            move |m| {
                s1.lock().unwrap().push(format!("scoped:{}", m.session_id));
                Ok(())
            },
            SubscribeOptions {
                session_id: Some("abc".to_string()),
            },
        );
        let s2 = Arc::clone(&seen);
        let _d2 = hub.subscribe(
            "session.deleted",
            move |m| {
                s2.lock().unwrap().push(format!("any:{}", m.session_id));
                Ok(())
            },
            SubscribeOptions::default(),
        );

        hub.dispatch_event(&HubMessage::event("session.deleted", "abc", None));
        hub.dispatch_event(&HubMessage::event("session.deleted", "other", None));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["scoped:abc".to_string(), "any:abc".to_string(), "any:other".to_string()]
        );
    }

    #[test]
    fn test_subscriber_error_does_not_block_others() {
        let hub = Hub::default();
        let delivered = Arc::new(Mutex::new(0u32));

        let _d1 = hub.subscribe(
            "session.deleted",
            |_| anyhow::bail!("subscriber exploded"),
            SubscribeOptions::default(),
        );
        let d = Arc::clone(&delivered);
        let _d2 = hub.subscribe(
            "session.deleted",
            move |_| {
                *d.lock().unwrap() += 1;
                Ok(())
            },
            SubscribeOptions::default(),
        );

        hub.dispatch_event(&HubMessage::event("session.deleted", "global", None));
        assert_eq!(*delivered.lock().unwrap(), 1);
    }

    #[test]
    fn test_late_result_with_unknown_request_id_is_dropped() {
        let hub = Hub::default();
        let call = HubMessage::call("session.create", "global", None);
        let result = HubMessage::result(&call, Some(json!({"ok": true})));
        // No pending entry exists; must not panic or create state.
        hub.settle(result);
        assert_eq!(hub.pending_calls(), 0);
    }

    #[test]
    fn test_handle_replaces_previous_handler() {
        let hub = Hub::default();
        hub.handle("session.create", |_| async { Ok(json!(1)) });
        hub.handle("session.create", |_| async { Ok(json!(2)) });
        assert_eq!(hub.inner.handlers.len(), 1);
    }
}

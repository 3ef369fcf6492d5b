//! WebSocket server transport.
//!
//! Accepts raw WebSocket connections and exposes each as a
//! [`WsServerConnection`] implementing [`ClientConnection`], so the daemon
//! can register them into a [`crate::router::Router`]. Per-client activity is
//! tracked and a background sweep closes connections idle past the stale
//! timeout.
//!
//! Outbound writes go through a bounded per-connection buffer; a full buffer
//! fails the send instead of blocking or growing, which is the backpressure
//! safety valve against slow clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lattice_protocol::{HubMessage, decode, encode};

use crate::error::HubError;
use crate::listeners::{Disposer, Listeners};
use crate::router::ClientConnection;
use crate::transport::{ConnectionHandler, ConnectionState, MessageHandler, StateCell, Transport};

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// WebSocket server options.
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    /// TCP bind address, e.g. `127.0.0.1:8787`.
    pub bind_addr: String,
    /// Close connections with no inbound activity for longer than this.
    pub stale_timeout: Duration,
    /// Interval of the background stale-connection sweep.
    pub sweep_interval: Duration,
    /// Outbound buffer capacity per connection.
    pub connection_buffer: usize,
}

impl WsServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            stale_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            connection_buffer: CONNECTION_BUFFER_SIZE,
        }
    }
}

// ============================================================================
// Per-client connection
// ============================================================================

/// One accepted WebSocket client.
pub struct WsServerConnection {
    id: String,
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
    open: AtomicBool,
    last_activity: Mutex<Instant>,
    close_token: CancellationToken,
}

impl WsServerConnection {
    /// Refresh the last-activity timestamp. Called on every inbound message.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Mark closed and tear down the socket tasks.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_token.cancel();
    }
}

#[async_trait]
impl ClientConnection for WsServerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &str) -> Result<(), HubError> {
        if !self.is_open() {
            return Err(HubError::Closed);
        }
        // try_send keeps slow clients from blocking the sender or buffering
        // without bound.
        self.tx.try_send(payload.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => HubError::Transport("connection write buffer full".to_string()),
            TrySendError::Closed(_) => HubError::Closed,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn can_accept(&self) -> bool {
        self.is_open() && self.tx.capacity() > 0
    }
}

// ============================================================================
// Server transport
// ============================================================================

struct WsServerInner {
    config: WsServerConfig,
    state: StateCell,
    messages: Listeners<HubMessage>,
    connects: Listeners<Arc<WsServerConnection>>,
    disconnects: Listeners<String>,
    connections: DashMap<String, Arc<WsServerConnection>>,
    /// Inbound CALL/PING id -> originating client, for reply routing.
    call_origins: DashMap<String, String>,
    token: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// WebSocket server transport.
pub struct WsServerTransport {
    inner: Arc<WsServerInner>,
}

impl WsServerTransport {
    pub fn new(config: WsServerConfig) -> Self {
        Self {
            inner: Arc::new(WsServerInner {
                config,
                state: StateCell::new(),
                messages: Listeners::new(),
                connects: Listeners::new(),
                disconnects: Listeners::new(),
                connections: DashMap::new(),
                call_origins: DashMap::new(),
                token: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Register a handler invoked for every accepted connection; the daemon
    /// typically registers the connection into a router here.
    pub fn on_connection(&self, handler: impl Fn(&Arc<WsServerConnection>) + Send + Sync + 'static) -> Disposer {
        self.inner.connects.add(handler)
    }

    /// Register a handler invoked with the client id of every closed
    /// connection (router unregistration hook).
    pub fn on_disconnect(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> Disposer {
        self.inner.disconnects.add(move |id: &String| handler(id))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn initialize(&self) -> Result<(), HubError> {
        if self.inner.state.get() == ConnectionState::Connected {
            return Ok(());
        }
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock().unwrap() = Some(addr);

        let token = CancellationToken::new();
        if let Some(old) = self.inner.token.lock().unwrap().replace(token.clone()) {
            old.cancel();
        }

        info!("WebSocket server listening on {}", addr);
        self.inner.state.set(ConnectionState::Connected);

        // Accept loop.
        let accept_inner = Arc::clone(&self.inner);
        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let inner = Arc::clone(&accept_inner);
                                tokio::spawn(async move {
                                    inner.handle_socket(stream, peer).await;
                                });
                            }
                            Err(e) => warn!("Accept error: {}", e),
                        }
                    }
                }
            }
        });

        // Stale-connection sweep.
        let sweep_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_inner.config.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => sweep_inner.sweep_stale(),
                }
            }
        });

        Ok(())
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        if !self.is_ready() {
            return Err(HubError::NotReady);
        }
        let text = encode(message)?;

        // A response goes back to exactly the connection that delivered the
        // correlated CALL/PING.
        if let Some(request_id) = &message.request_id
            && let Some((_, client_id)) = self.inner.call_origins.remove(request_id)
        {
            let Some(connection) = self.inner.connections.get(&client_id).map(|c| Arc::clone(c.value())) else {
                debug!("Origin of request {} disconnected before reply", request_id);
                return Err(HubError::Closed);
            };
            return connection.send(&text).await;
        }

        // Everything else fans out to all open connections.
        for entry in self.inner.connections.iter() {
            let connection = Arc::clone(entry.value());
            if let Err(e) = connection.send(&text).await {
                warn!("Fan-out to client {} failed: {}", connection.id(), e);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), HubError> {
        if let Some(token) = self.inner.token.lock().unwrap().take() {
            token.cancel();
        }
        for entry in self.inner.connections.iter() {
            entry.value().close();
        }
        self.inner.connections.clear();
        self.inner.call_origins.clear();
        self.inner.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.inner.state.get() == ConnectionState::Connected
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn on_message(&self, handler: MessageHandler) -> Disposer {
        self.inner.messages.add(move |msg: &HubMessage| handler(msg))
    }

    fn on_connection_change(&self, handler: ConnectionHandler) -> Disposer {
        self.inner.state.watch(handler)
    }
}

impl WsServerInner {
    async fn handle_socket(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(self.config.connection_buffer);
        let connection = Arc::new(WsServerConnection {
            id: Uuid::new_v4().to_string(),
            peer,
            tx,
            open: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            close_token: CancellationToken::new(),
        });
        let client_id = connection.id.clone();
        self.connections.insert(client_id.clone(), Arc::clone(&connection));
        info!("Client {} connected from {}", client_id, peer);
        self.connects.emit(&connection);

        let (mut sink, mut source) = ws.split();

        // Writer: drains the bounded buffer in order.
        let write_token = connection.close_token.clone();
        let writer_id = client_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_token.cancelled() => {
                        // A close frame may fail on an already-dead socket;
                        // that must not take anything else down with it.
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame to client {} failed: {}", writer_id, e);
                        }
                        break;
                    }
                    outbound = rx.recv() => {
                        match outbound {
                            Some(text) => {
                                if let Err(e) = sink.send(Message::text(text)).await {
                                    debug!("Write to client {} failed: {}", writer_id, e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        // Reader runs on this task; its end is the single cleanup path.
        loop {
            tokio::select! {
                _ = connection.close_token.cancelled() => break,
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match decode(text.as_str()) {
                                Ok(msg) => {
                                    connection.touch();
                                    if msg.is_call() || msg.is_ping() {
                                        self.call_origins.insert(msg.id.clone(), client_id.clone());
                                    }
                                    self.messages.emit(&msg);
                                }
                                Err(e) => {
                                    warn!("Dropping malformed frame from client {}: {}", client_id, e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Read from client {} failed: {}", client_id, e);
                            break;
                        }
                    }
                }
            }
        }

        connection.close();
        self.connections.remove(&client_id);
        self.call_origins.retain(|_, origin| origin != &client_id);
        self.disconnects.emit(&client_id);
        info!("Client {} disconnected", client_id);
    }

    /// Close every connection idle past the stale timeout. One misbehaving
    /// socket cannot abort the sweep for the rest.
    fn sweep_stale(&self) {
        let stale: Vec<Arc<WsServerConnection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() > self.config.stale_timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for connection in stale {
            warn!(
                "Closing stale client {} (idle {:?}, limit {:?})",
                connection.id(),
                connection.idle_for(),
                self.config.stale_timeout
            );
            connection.close();
        }
    }
}

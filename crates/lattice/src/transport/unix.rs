//! Unix domain socket transport, newline-delimited JSON framing.
//!
//! Runs in `server` mode (listen on a path, many clients) or `client` mode
//! (connect to a path). A server removes any pre-existing socket file before
//! binding and removes it again on close.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lattice_protocol::{HubMessage, decode, encode};

use crate::error::HubError;
use crate::listeners::{Disposer, Listeners};
use crate::transport::{ConnectionHandler, ConnectionState, MessageHandler, StateCell, Transport};

/// Size of the outbound write buffer (per peer in server mode).
const WRITE_BUFFER_SIZE: usize = 64;

/// Which side of the socket this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixMode {
    /// Listen on the path; accepts many clients.
    Server,
    /// Connect to the path.
    Client,
}

/// Unix socket transport options.
#[derive(Debug, Clone)]
pub struct UnixTransportConfig {
    pub path: PathBuf,
    pub mode: UnixMode,
}

impl UnixTransportConfig {
    pub fn server(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: UnixMode::Server,
        }
    }

    pub fn client(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: UnixMode::Client,
        }
    }
}

/// One accepted peer (server mode).
struct UnixPeer {
    tx: mpsc::Sender<String>,
    open: Arc<AtomicBool>,
}

struct UnixInner {
    config: UnixTransportConfig,
    state: StateCell,
    messages: Listeners<HubMessage>,
    /// Server mode: all connected peers.
    peers: DashMap<String, UnixPeer>,
    /// Server mode: inbound CALL/PING id -> peer id, for reply routing.
    call_origins: DashMap<String, String>,
    /// Client mode: the single outbound writer.
    writer: Mutex<Option<mpsc::Sender<String>>>,
    token: Mutex<Option<CancellationToken>>,
}

/// Unix domain socket transport.
pub struct UnixTransport {
    inner: Arc<UnixInner>,
}

impl UnixTransport {
    pub fn new(config: UnixTransportConfig) -> Self {
        Self {
            inner: Arc::new(UnixInner {
                config,
                state: StateCell::new(),
                messages: Listeners::new(),
                peers: DashMap::new(),
                call_origins: DashMap::new(),
                writer: Mutex::new(None),
                token: Mutex::new(None),
            }),
        }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.inner.config.path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn initialize(&self) -> Result<(), HubError> {
        if self.inner.state.get() == ConnectionState::Connected {
            return Ok(());
        }
        self.inner.state.set(ConnectionState::Connecting);
        match self.inner.config.mode {
            UnixMode::Server => Arc::clone(&self.inner).start_server().await,
            UnixMode::Client => Arc::clone(&self.inner).start_client().await,
        }
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        if !self.is_ready() {
            return Err(HubError::NotReady);
        }
        let text = encode(message)?;

        match self.inner.config.mode {
            UnixMode::Client => {
                let sender = self
                    .inner
                    .writer
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or(HubError::NotReady)?;
                sender.send(text).await.map_err(|_| HubError::Closed)
            }
            UnixMode::Server => {
                // Responses route back to the peer that delivered the
                // correlated request; everything else fans out.
                if let Some(request_id) = &message.request_id
                    && let Some((_, peer_id)) = self.inner.call_origins.remove(request_id)
                {
                    let sender = self
                        .inner
                        .peers
                        .get(&peer_id)
                        .map(|p| p.tx.clone())
                        .ok_or(HubError::Closed)?;
                    return sender.send(text).await.map_err(|_| HubError::Closed);
                }
                for entry in self.inner.peers.iter() {
                    if entry.value().open.load(Ordering::SeqCst)
                        && entry.value().tx.try_send(text.clone()).is_err()
                    {
                        warn!("Fan-out to peer {} failed", entry.key());
                    }
                }
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), HubError> {
        if let Some(token) = self.inner.token.lock().unwrap().take() {
            token.cancel();
        }
        *self.inner.writer.lock().unwrap() = None;
        self.inner.peers.clear();
        self.inner.call_origins.clear();
        self.inner.state.set(ConnectionState::Disconnected);
        if self.inner.config.mode == UnixMode::Server {
            let _ = tokio::fs::remove_file(&self.inner.config.path).await;
        }
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

impl UnixInner {
    async fn start_server(self: Arc<Self>) -> Result<(), HubError> {
        if let Some(parent) = self.config.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Remove a stale socket file from a previous run.
        let _ = tokio::fs::remove_file(&self.config.path).await;

        let listener = UnixListener::bind(&self.config.path)?;
        info!("Unix socket server listening on {:?}", self.config.path);

        let token = CancellationToken::new();
        if let Some(old) = self.token.lock().unwrap().replace(token.clone()) {
            old.cancel();
        }
        self.state.set(ConnectionState::Connected);

        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let inner = Arc::clone(&inner);
                                let conn_token = token.child_token();
                                tokio::spawn(async move {
                                    inner.handle_peer(stream, conn_token).await;
                                });
                            }
                            Err(e) => warn!("Accept error: {}", e),
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_peer(self: Arc<Self>, stream: UnixStream, token: CancellationToken) {
        let peer_id = Uuid::new_v4().to_string();
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<String>(WRITE_BUFFER_SIZE);
        let open = Arc::new(AtomicBool::new(true));

        self.peers.insert(
            peer_id.clone(),
            UnixPeer {
                tx,
                open: Arc::clone(&open),
            },
        );
        debug!("Peer {} connected on {:?}", peer_id, self.config.path);

        // Writer: one line per message.
        let write_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_token.cancelled() => break,
                    outbound = rx.recv() => {
                        match outbound {
                            Some(mut line) => {
                                line.push('\n');
                                if write_half.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        // Reader.
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => match decode(&line) {
                            Ok(msg) => {
                                if msg.is_call() || msg.is_ping() {
                                    self.call_origins.insert(msg.id.clone(), peer_id.clone());
                                }
                                self.messages.emit(&msg);
                            }
                            Err(e) => warn!("Dropping malformed line from peer {}: {}", peer_id, e),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Read from peer {} failed: {}", peer_id, e);
                            break;
                        }
                    }
                }
            }
        }

        open.store(false, Ordering::SeqCst);
        token.cancel();
        self.peers.remove(&peer_id);
        self.call_origins.retain(|_, origin| origin != &peer_id);
        debug!("Peer {} disconnected", peer_id);
    }

    async fn start_client(self: Arc<Self>) -> Result<(), HubError> {
        let stream = match UnixStream::connect(&self.config.path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state.set(ConnectionState::Error);
                return Err(HubError::Transport(format!(
                    "connecting to {:?}: {}",
                    self.config.path, e
                )));
            }
        };
        info!("Connected to unix socket {:?}", self.config.path);

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<String>(WRITE_BUFFER_SIZE);

        let token = CancellationToken::new();
        if let Some(old) = self.token.lock().unwrap().replace(token.clone()) {
            old.cancel();
        }
        *self.writer.lock().unwrap() = Some(tx);
        self.state.set(ConnectionState::Connected);

        let write_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_token.cancelled() => break,
                    outbound = rx.recv() => {
                        match outbound {
                            Some(mut line) => {
                                line.push('\n');
                                if write_half.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => match decode(&line) {
                                Ok(msg) => inner.messages.emit(&msg),
                                Err(e) => warn!("Dropping malformed line: {}", e),
                            },
                            Ok(None) => break,
                            Err(e) => {
                                debug!("Read failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            *inner.writer.lock().unwrap() = None;
            inner.state.set(ConnectionState::Disconnected);
        });

        Ok(())
    }
}

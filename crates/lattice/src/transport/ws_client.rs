//! WebSocket client transport with reconnection and heartbeat liveness.
//!
//! State machine: `disconnected -> connecting -> connected`; on remote close
//! or error the transport goes `disconnected` and, with auto-reconnect on,
//! `reconnecting` with exponential backoff and jitter. After the attempt
//! budget is exhausted the state becomes `failed`, terminal until
//! [`WsClientTransport::reset_reconnect`] is called.
//!
//! Liveness is enforced independently of the socket's reported status: a
//! protocol-level PING is sent periodically and a missing PONG within the
//! timeout window forces a reconnect, defending against half-open sockets.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use lattice_protocol::{HubMessage, decode, encode};

use crate::error::HubError;
use crate::listeners::{Disposer, Listeners};
use crate::transport::{ConnectionHandler, ConnectionState, MessageHandler, StateCell, Transport};

/// Size of the outbound write buffer.
const WRITE_BUFFER_SIZE: usize = 64;

/// WebSocket client options.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// ws:// or wss:// endpoint.
    pub url: String,
    /// Reconnect automatically after a lost connection.
    pub auto_reconnect: bool,
    /// Attempt budget before the terminal `failed` state.
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay: Duration,
    /// Floor applied after jitter.
    pub min_reconnect_delay: Duration,
    /// Interval between protocol-level PINGs.
    pub ping_interval: Duration,
    /// Connection is considered stale when no PONG arrives in this window.
    pub pong_timeout: Duration,
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_secs(1),
            min_reconnect_delay: Duration::from_millis(250),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

struct WsClientInner {
    config: WsClientConfig,
    state: StateCell,
    messages: Listeners<HubMessage>,
    writer: Mutex<Option<mpsc::Sender<Message>>>,
    /// Consecutive failed attempts since the last successful connect.
    attempts: AtomicU32,
    /// Incremented per connect attempt; stale tasks compare against it.
    generation: AtomicU64,
    /// Highest generation whose disconnect has already been handled.
    handled_gen: AtomicU64,
    closed: AtomicBool,
    last_pong: Mutex<Instant>,
    conn_token: Mutex<Option<CancellationToken>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

/// WebSocket client transport.
pub struct WsClientTransport {
    inner: Arc<WsClientInner>,
}

impl WsClientTransport {
    pub fn new(config: WsClientConfig) -> Self {
        Self {
            inner: Arc::new(WsClientInner {
                config,
                state: StateCell::new(),
                messages: Listeners::new(),
                writer: Mutex::new(None),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                handled_gen: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                last_pong: Mutex::new(Instant::now()),
                conn_token: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
            }),
        }
    }

    /// Clear reconnect bookkeeping after the terminal `failed` state.
    ///
    /// Required before `initialize` will attempt the connection again.
    pub fn reset_reconnect(&self) {
        self.inner.attempts.store(0, Ordering::SeqCst);
        if self.inner.state.get() == ConnectionState::Failed {
            self.inner.state.set(ConnectionState::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn initialize(&self) -> Result<(), HubError> {
        if self.inner.state.get() == ConnectionState::Failed {
            return Err(HubError::Transport(
                "reconnect attempts exhausted; call reset_reconnect() first".to_string(),
            ));
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connect().await
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        if !self.is_ready() {
            return Err(HubError::NotReady);
        }
        // Size cap enforced here, before the wire write is attempted.
        let text = encode(message)?;
        let sender = self
            .inner
            .writer
            .lock()
            .unwrap()
            .clone()
            .ok_or(HubError::NotReady)?;
        sender
            .send(Message::text(text))
            .await
            .map_err(|_| HubError::Closed)
    }

    async fn close(&self) -> Result<(), HubError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.reconnect_timer.lock().unwrap().take() {
            timer.abort();
        }
        if let Some(token) = self.inner.conn_token.lock().unwrap().take() {
            token.cancel();
        }
        *self.inner.writer.lock().unwrap() = None;
        // `failed` stays terminal through close; only reset_reconnect()
        // clears it.
        if self.inner.state.get() != ConnectionState::Failed {
            self.inner.state.set(ConnectionState::Disconnected);
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

impl WsClientInner {
    async fn connect(self: &Arc<Self>) -> Result<(), HubError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.set(ConnectionState::Connecting);

        let stream = match connect_async(self.config.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                let reason = format!("connect to {} failed: {}", self.config.url, e);
                Arc::clone(self).on_connection_lost(generation, reason.clone());
                return Err(HubError::Transport(reason));
            }
        };

        info!("Connected to {}", self.config.url);

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(WRITE_BUFFER_SIZE);

        let token = CancellationToken::new();
        {
            // Tear down any previous connection's tasks.
            if let Some(old) = self.conn_token.lock().unwrap().replace(token.clone()) {
                old.cancel();
            }
            *self.writer.lock().unwrap() = Some(tx);
            *self.last_pong.lock().unwrap() = Instant::now();
        }
        self.attempts.store(0, Ordering::SeqCst);
        self.state.set(ConnectionState::Connected);

        // Writer: single task per connection preserves send order.
        let write_token = token.clone();
        let writer_inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    outbound = rx.recv() => {
                        match outbound {
                            Some(frame) => {
                                if let Err(e) = sink.send(frame).await {
                                    debug!("Write failed: {}", e);
                                    writer_inner.clone().on_connection_lost(
                                        generation,
                                        format!("write failed: {}", e),
                                    );
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        // Reader: decode, track PONGs, fan messages out.
        let read_token = token.clone();
        let reader_inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_token.cancelled() => return,
                    frame = source.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                match decode(text.as_str()) {
                                    Ok(msg) => {
                                        if msg.is_pong() {
                                            *reader_inner.last_pong.lock().unwrap() = Instant::now();
                                        }
                                        reader_inner.messages.emit(&msg);
                                    }
                                    Err(e) => warn!("Dropping malformed frame: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                reader_inner.on_connection_lost(generation, "remote closed".to_string());
                                return;
                            }
                            Some(Ok(_)) => {} // binary / transport-level ping frames
                            Some(Err(e)) => {
                                reader_inner.on_connection_lost(generation, format!("read failed: {}", e));
                                return;
                            }
                        }
                    }
                }
            }
        });

        // Heartbeat: PING on an interval, force-reconnect on PONG silence.
        let ping_token = token;
        let ping_inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_inner.config.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ping_token.cancelled() => return,
                    _ = ticker.tick() => {
                        let silent_for = ping_inner.last_pong.lock().unwrap().elapsed();
                        if silent_for > ping_inner.config.pong_timeout {
                            warn!(
                                "No PONG for {:?} (limit {:?}); treating connection as stale",
                                silent_for, ping_inner.config.pong_timeout
                            );
                            ping_inner.on_connection_lost(generation, "heartbeat timeout".to_string());
                            return;
                        }
                        let sender = ping_inner.writer.lock().unwrap().clone();
                        if let Some(sender) = sender {
                            let ping = HubMessage::ping();
                            if let Ok(text) = encode(&ping) {
                                let _ = sender.send(Message::text(text)).await;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Handle loss of the connection identified by `generation`. The first
    /// caller for a generation wins; later signals for the same or older
    /// connections are ignored.
    fn on_connection_lost(self: Arc<Self>, generation: u64, reason: String) {
        if self.handled_gen.fetch_max(generation, Ordering::SeqCst) >= generation {
            return;
        }

        if let Some(token) = self.conn_token.lock().unwrap().take() {
            token.cancel();
        }
        *self.writer.lock().unwrap() = None;
        self.state.set(ConnectionState::Disconnected);

        if self.closed.load(Ordering::SeqCst) {
            debug!("Connection closed intentionally ({})", reason);
            return;
        }
        if !self.config.auto_reconnect {
            info!("Connection lost ({}); auto-reconnect disabled", reason);
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.config.max_reconnect_attempts {
            error!(
                "Connection lost ({}); giving up after {} attempts",
                reason, self.config.max_reconnect_attempts
            );
            self.state.set(ConnectionState::Failed);
            return;
        }

        self.state.set(ConnectionState::Reconnecting);
        let delay = backoff_delay(&self.config, attempt);
        info!(
            "Connection lost ({}); reconnecting in {:?} (attempt {}/{})",
            reason,
            delay,
            attempt + 1,
            self.config.max_reconnect_attempts
        );

        let inner = Arc::clone(&self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            // A failed attempt schedules the next one through this same path.
            let _ = inner.connect().await;
        });
        if let Some(old) = self.reconnect_timer.lock().unwrap().replace(timer) {
            old.abort();
        }
    }
}

/// `base * 2^attempt` with +/-30% jitter to avoid synchronized retry storms,
/// floored at the configured minimum.
fn backoff_delay(config: &WsClientConfig, attempt: u32) -> Duration {
    let exp = attempt.min(16);
    let base_ms = config.reconnect_base_delay.as_millis() as f64 * f64::from(1u32 << exp);
    let jitter = rand::rng().random_range(0.7..=1.3);
    let delay = Duration::from_millis((base_ms * jitter) as u64);
    delay.max(config.min_reconnect_delay)
}

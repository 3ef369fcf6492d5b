//! In-process transport pair for tests and same-process wiring.
//!
//! [`InProcessTransport::pair`] returns two linked endpoints; anything sent
//! on one side is decoded and emitted on the other. Messages still pass
//! through [`encode`]/[`decode`], so size caps and validation apply exactly
//! as they do on real sockets.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lattice_protocol::{HubMessage, decode, encode};

use crate::error::HubError;
use crate::listeners::{Disposer, Listeners};
use crate::transport::{ConnectionHandler, ConnectionState, MessageHandler, StateCell, Transport};

const PAIR_BUFFER_SIZE: usize = 64;

struct InProcessInner {
    state: StateCell,
    messages: Listeners<HubMessage>,
    peer_tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    token: Mutex<Option<CancellationToken>>,
}

/// One endpoint of an in-process transport pair.
pub struct InProcessTransport {
    inner: Arc<InProcessInner>,
}

impl InProcessTransport {
    /// Creates two linked endpoints. Each side must still be initialized
    /// before it delivers inbound messages.
    pub fn pair() -> (Self, Self) {
        let (to_a_tx, to_a_rx) = mpsc::channel::<String>(PAIR_BUFFER_SIZE);
        let (to_b_tx, to_b_rx) = mpsc::channel::<String>(PAIR_BUFFER_SIZE);

        let a = Self {
            inner: Arc::new(InProcessInner {
                state: StateCell::new(),
                messages: Listeners::new(),
                peer_tx: to_b_tx,
                rx: Mutex::new(Some(to_a_rx)),
                token: Mutex::new(None),
            }),
        };
        let b = Self {
            inner: Arc::new(InProcessInner {
                state: StateCell::new(),
                messages: Listeners::new(),
                peer_tx: to_a_tx,
                rx: Mutex::new(Some(to_b_rx)),
                token: Mutex::new(None),
            }),
        };
        (a, b)
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn initialize(&self) -> Result<(), HubError> {
        if self.inner.state.get() == ConnectionState::Connected {
            return Ok(());
        }
        let Some(mut rx) = self.inner.rx.lock().unwrap().take() else {
            return Err(HubError::Closed);
        };

        let token = CancellationToken::new();
        *self.inner.token.lock().unwrap() = Some(token.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    inbound = rx.recv() => {
                        match inbound {
                            Some(text) => match decode(&text) {
                                Ok(msg) => inner.messages.emit(&msg),
                                Err(e) => warn!("Dropping malformed in-process frame: {}", e),
                            },
                            None => break,
                        }
                    }
                }
            }
            inner.state.set(ConnectionState::Disconnected);
        });

        self.inner.state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        if !self.is_ready() {
            return Err(HubError::NotReady);
        }
        let text = encode(message)?;
        self.inner
            .peer_tx
            .send(text)
            .await
            .map_err(|_| HubError::Closed)
    }

    async fn close(&self) -> Result<(), HubError> {
        if let Some(token) = self.inner.token.lock().unwrap().take() {
            token.cancel();
        }
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

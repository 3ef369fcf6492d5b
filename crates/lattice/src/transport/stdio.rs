//! Stdio transport: newline-delimited JSON over stdin/stdout.
//!
//! Useful for child-process plumbing where the parent owns the pipes. All
//! diagnostic output must go to stderr (the `log` crate does); stdout carries
//! protocol frames only.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio_util::sync::CancellationToken;

use lattice_protocol::{HubMessage, decode, encode};

use crate::error::HubError;
use crate::listeners::{Disposer, Listeners};
use crate::transport::{ConnectionHandler, ConnectionState, MessageHandler, StateCell, Transport};

struct StdioInner {
    state: StateCell,
    messages: Listeners<HubMessage>,
    stdout: tokio::sync::Mutex<Stdout>,
    token: Mutex<Option<CancellationToken>>,
}

/// Transport speaking newline-delimited JSON on the process's own
/// stdin/stdout.
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdioInner {
                state: StateCell::new(),
                messages: Listeners::new(),
                stdout: tokio::sync::Mutex::new(tokio::io::stdout()),
                token: Mutex::new(None),
            }),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn initialize(&self) -> Result<(), HubError> {
        if self.inner.state.get() == ConnectionState::Connected {
            return Ok(());
        }

        let token = CancellationToken::new();
        if let Some(old) = self.inner.token.lock().unwrap().replace(token.clone()) {
            old.cancel();
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if line.trim().is_empty() {
                                    continue;
                                }
                                match decode(&line) {
                                    Ok(msg) => inner.messages.emit(&msg),
                                    Err(e) => warn!("Dropping malformed stdin line: {}", e),
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!("Stdin read failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            // Stdin closing means the parent is gone.
            inner.state.set(ConnectionState::Disconnected);
        });

        self.inner.state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        if !self.is_ready() {
            return Err(HubError::NotReady);
        }
        let mut line = encode(message)?;
        line.push('\n');
        let mut stdout = self.inner.stdout.lock().await;
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
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

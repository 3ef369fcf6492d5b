//! Transport abstraction.
//!
//! Every concrete transport (WebSocket client/server, Unix socket, stdio,
//! in-process pair) implements the same contract so the hub can dispatch
//! over any of them interchangeably. All transports run frames through
//! `lattice_protocol::{encode, decode}`, so validation and the size cap hold
//! regardless of the underlying I/O.

mod in_process;
mod stdio;
mod unix;
mod ws_client;
mod ws_server;

pub use in_process::InProcessTransport;
pub use stdio::StdioTransport;
pub use unix::{UnixMode, UnixTransport, UnixTransportConfig};
pub use ws_client::{WsClientConfig, WsClientTransport};
pub use ws_server::{WsServerConfig, WsServerConnection, WsServerTransport};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lattice_protocol::HubMessage;

use crate::error::HubError;
use crate::listeners::{Disposer, Listeners};

/// Connectivity of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    /// Reconnect attempts exhausted. Terminal until an explicit reset.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Handler for inbound, already-validated messages.
pub type MessageHandler = Box<dyn Fn(&HubMessage) + Send + Sync>;

/// Handler for connection state transitions.
pub type ConnectionHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Uniform contract implemented by every concrete transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin connecting (or listening). Idempotent once connected.
    async fn initialize(&self) -> Result<(), HubError>;

    /// Serialize and write one message. Fails immediately when not ready;
    /// nothing queues at this layer.
    async fn send(&self, message: &HubMessage) -> Result<(), HubError>;

    /// Tear down the transport and cancel all timers and tasks.
    async fn close(&self) -> Result<(), HubError>;

    fn is_ready(&self) -> bool;

    fn state(&self) -> ConnectionState;

    /// Register a handler for inbound messages.
    fn on_message(&self, handler: MessageHandler) -> Disposer;

    /// Register a handler for state transitions.
    fn on_connection_change(&self, handler: ConnectionHandler) -> Disposer;
}

/// Shared state holder: current [`ConnectionState`] plus change listeners.
/// Listeners fire only on actual transitions.
pub(crate) struct StateCell {
    state: Mutex<ConnectionState>,
    listeners: Listeners<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            listeners: Listeners::new(),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set(&self, next: ConnectionState) {
        let changed = {
            let mut guard = self.state.lock().unwrap();
            if *guard == next {
                false
            } else {
                *guard = next;
                true
            }
        };
        if changed {
            self.listeners.emit(&next);
        }
    }

    pub fn watch(&self, handler: ConnectionHandler) -> Disposer {
        self.listeners.add(move |state: &ConnectionState| handler(*state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_state_cell_emits_only_on_transition() {
        let cell = StateCell::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let _d = cell.watch(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        cell.set(ConnectionState::Connecting);
        cell.set(ConnectionState::Connecting);
        cell.set(ConnectionState::Connected);

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}

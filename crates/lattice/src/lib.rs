//! Bidirectional RPC and pub/sub over pluggable transports.
//!
//! The [`Hub`] is the symmetric engine: either end of a connection can issue
//! calls, register handlers, publish events, and subscribe. Server processes
//! additionally use the [`Router`] to track connected clients and fan events
//! out to rooms.
//!
//! Transports live in [`transport`]: WebSocket client and server, Unix domain
//! sockets, stdio, and an in-process pair for tests.

pub mod error;
pub mod hub;
pub mod listeners;
pub mod router;
pub mod transport;

pub use lattice_protocol as protocol;

pub use error::HubError;
pub use hub::{CallOptions, Hub, HubConfig, PublishOptions, SubscribeOptions};
pub use listeners::Disposer;
pub use router::{BroadcastReport, ClientConnection, ClientInfo, RouteReport, Router};
pub use transport::{
    ConnectionState, InProcessTransport, StdioTransport, Transport, UnixMode, UnixTransport,
    UnixTransportConfig, WsClientConfig, WsClientTransport, WsServerConfig, WsServerTransport,
};

//! Wire protocol for the Lattice messaging substrate.
//!
//! One message shape carries both RPC (CALL/RESULT/ERROR) and pub/sub
//! (PUBLISH/EVENT/SUBSCRIBE/UNSUBSCRIBE) plus liveness (PING/PONG). Messages
//! are routed by session and room identifiers, never by connection or URL.
//!
//! Every transport runs inbound and outbound frames through [`encode`] and
//! [`decode`] so validation and the size cap apply uniformly.

mod error;
mod message;
mod validate;

pub use error::ProtocolError;
pub use message::{ErrorPayload, HubMessage, MessageType};
pub use validate::{decode, encode, validate_message, validate_method};

/// Protocol version stamped on every message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Reserved session scope meaning "system-wide", not a real session.
pub const GLOBAL_SESSION: &str = "global";

/// Reserved room every registered connection joins automatically.
pub const GLOBAL_ROOM: &str = "global";

/// Maximum serialized message size, enforced on both send and receive.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

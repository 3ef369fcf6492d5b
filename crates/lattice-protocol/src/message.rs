//! The canonical message envelope.
//!
//! A [`HubMessage`] is one wire unit. It is created per send, never
//! persisted, and treated as immutable after construction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{GLOBAL_SESSION, PROTOCOL_VERSION};

// ============================================================================
// Message types
// ============================================================================

/// All message types carried by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// RPC request expecting exactly one RESULT or ERROR.
    Call,
    /// Successful RPC response, correlated via `request_id`.
    Result,
    /// Failed RPC response, correlated via `request_id`.
    Error,
    /// Event published into a room for fan-out.
    Publish,
    /// Event delivered to subscribers.
    Event,
    /// Room/session subscription request.
    Subscribe,
    /// Room/session unsubscription request.
    Unsubscribe,
    /// Liveness probe.
    Ping,
    /// Liveness reply, correlated via `request_id`.
    Pong,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Call => "CALL",
            Self::Result => "RESULT",
            Self::Error => "ERROR",
            Self::Publish => "PUBLISH",
            Self::Event => "EVENT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Error payload
// ============================================================================

/// Error details carried by ERROR messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code (e.g. "method_not_found").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Human-readable description.
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// One wire unit.
///
/// Field names follow the wire format exactly (camelCase keys, `type` tag).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMessage {
    /// Unique message id (UUID v4).
    pub id: String,

    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Session scope. `"global"` means system-wide.
    pub session_id: String,

    /// Method name, `<domain>.<action>[.<type>]`.
    pub method: String,

    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Correlates RESULT/ERROR/PONG to the originating CALL/PING id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Error details (ERROR messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,

    /// Target room for fan-out. Defaults to `"global"` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// Unix milliseconds at construction.
    pub timestamp: i64,

    /// Protocol version.
    pub version: u32,
}

impl HubMessage {
    fn base(kind: MessageType, method: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            session_id: session_id.into(),
            method: method.into(),
            data: None,
            request_id: None,
            error: None,
            room: None,
            timestamp: Utc::now().timestamp_millis(),
            version: PROTOCOL_VERSION,
        }
    }

    // -- Constructors --

    /// Build a CALL message.
    pub fn call(
        method: impl Into<String>,
        session_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let mut msg = Self::base(MessageType::Call, method, session_id);
        msg.data = data;
        msg
    }

    /// Build a RESULT responding to `request`.
    pub fn result(request: &HubMessage, data: Option<Value>) -> Self {
        let mut msg = Self::base(MessageType::Result, request.method.clone(), request.session_id.clone());
        msg.request_id = Some(request.id.clone());
        msg.data = data;
        msg
    }

    /// Build an ERROR responding to `request`.
    pub fn error_response(request: &HubMessage, error: ErrorPayload) -> Self {
        let mut msg = Self::base(MessageType::Error, request.method.clone(), request.session_id.clone());
        msg.request_id = Some(request.id.clone());
        msg.error = Some(error);
        msg
    }

    /// Build an EVENT message.
    pub fn event(
        method: impl Into<String>,
        session_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let mut msg = Self::base(MessageType::Event, method, session_id);
        msg.data = data;
        msg
    }

    /// Build a PUBLISH message.
    pub fn publish(
        method: impl Into<String>,
        session_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let mut msg = Self::base(MessageType::Publish, method, session_id);
        msg.data = data;
        msg
    }

    /// Build a SUBSCRIBE message for a room.
    pub fn subscribe(method: impl Into<String>, session_id: impl Into<String>, room: impl Into<String>) -> Self {
        let mut msg = Self::base(MessageType::Subscribe, method, session_id);
        msg.room = Some(room.into());
        msg
    }

    /// Build an UNSUBSCRIBE message for a room.
    pub fn unsubscribe(method: impl Into<String>, session_id: impl Into<String>, room: impl Into<String>) -> Self {
        let mut msg = Self::base(MessageType::Unsubscribe, method, session_id);
        msg.room = Some(room.into());
        msg
    }

    /// Build a liveness PING.
    pub fn ping() -> Self {
        Self::base(MessageType::Ping, "system.ping", GLOBAL_SESSION)
    }

    /// Build a PONG replying to `ping`, correlated via `request_id`.
    pub fn pong(ping: &HubMessage) -> Self {
        let mut msg = Self::base(MessageType::Pong, "system.pong", ping.session_id.clone());
        msg.request_id = Some(ping.id.clone());
        msg
    }

    /// Set the target room (builder style, used at construction time).
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    // -- Type guards --

    pub fn is_call(&self) -> bool {
        self.kind == MessageType::Call
    }

    pub fn is_result(&self) -> bool {
        self.kind == MessageType::Result
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    pub fn is_publish(&self) -> bool {
        self.kind == MessageType::Publish
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageType::Event
    }

    pub fn is_ping(&self) -> bool {
        self.kind == MessageType::Ping
    }

    pub fn is_pong(&self) -> bool {
        self.kind == MessageType::Pong
    }

    /// RESULT or ERROR: a reply that settles a pending call.
    pub fn is_response(&self) -> bool {
        matches!(self.kind, MessageType::Result | MessageType::Error)
    }

    /// The room this message targets, defaulting to `"global"`.
    pub fn room_or_global(&self) -> &str {
        self.room.as_deref().unwrap_or(crate::GLOBAL_ROOM)
    }
}

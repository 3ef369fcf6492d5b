//! Validation and wire encoding.
//!
//! Every transport funnels outbound messages through [`encode`] and inbound
//! text through [`decode`], so the size cap and structural checks hold on
//! both sides of every connection.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ProtocolError;
use crate::message::HubMessage;
use crate::{MAX_MESSAGE_BYTES, PROTOCOL_VERSION};

/// `<domain>.<action>[.<type>]`, lowercase segments.
static METHOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*\.[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)?$").expect("valid regex")
});

/// Check a method name against the `<domain>.<action>[.<type>]` convention.
pub fn validate_method(method: &str) -> Result<(), ProtocolError> {
    if METHOD_RE.is_match(method) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidMethod(method.to_string()))
    }
}

/// Structural validation applied to every inbound and outbound message.
pub fn validate_message(msg: &HubMessage) -> Result<(), ProtocolError> {
    if msg.id.is_empty() {
        return Err(ProtocolError::MissingField("id"));
    }
    if msg.session_id.is_empty() {
        return Err(ProtocolError::MissingField("sessionId"));
    }
    if msg.version > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(msg.version));
    }
    validate_method(&msg.method)?;
    if msg.is_response() && msg.request_id.is_none() {
        return Err(ProtocolError::MissingField("requestId"));
    }
    if msg.is_error() && msg.error.is_none() {
        return Err(ProtocolError::MissingField("error"));
    }
    Ok(())
}

/// Serialize a message for the wire, enforcing the size cap before any write.
pub fn encode(msg: &HubMessage) -> Result<String, ProtocolError> {
    validate_message(msg)?;
    let text = serde_json::to_string(msg)?;
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized {
            size: text.len(),
            limit: MAX_MESSAGE_BYTES,
        });
    }
    Ok(text)
}

/// Parse and validate a wire frame/line.
pub fn decode(text: &str) -> Result<HubMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::Oversized {
            size: text.len(),
            limit: MAX_MESSAGE_BYTES,
        });
    }
    let msg: HubMessage = serde_json::from_str(text)?;
    validate_message(&msg)?;
    Ok(msg)
}

//! The inline control vocabulary shared by both ends of a session channel.
//!
//! Terminal bytes and control messages travel on the same logical channel.
//! A text frame that parses as a JSON object with a `type` tag is control;
//! the single reserved [`HEARTBEAT`] byte is a liveness probe that must
//! never reach a renderer; everything else is data and is forwarded
//! untouched.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved liveness probe byte. Never valid terminal output; both ends
/// consume it silently.
pub const HEARTBEAT: u8 = 0x00;

/// Control messages carried as JSON text frames, e.g.
/// `{"type":"resize","cols":80,"rows":24}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| Error::ProtocolViolation(err.to_string()))
    }
}

/// One classified unit of client-originated input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Control(ControlMessage),
    Data(Bytes),
    Heartbeat,
}

/// True when a payload is exactly the heartbeat sentinel.
pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload.len() == 1 && payload[0] == HEARTBEAT
}

/// Classifies a text frame from the client side of the channel.
///
/// Returns `Err(ProtocolViolation)` for a tagged JSON object that does not
/// decode into a known control message; callers log it and drop the frame
/// without disturbing the session. Text that is not a tagged object is
/// keyboard data.
pub fn decode_client_text(text: &str) -> Result<ClientInput> {
    if is_heartbeat(text.as_bytes()) {
        return Ok(ClientInput::Heartbeat);
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Ok(ClientInput::Data(Bytes::copy_from_slice(text.as_bytes())));
    };
    if !value.is_object() || value.get("type").is_none() {
        // valid JSON typed at the prompt is still just input
        return Ok(ClientInput::Data(Bytes::copy_from_slice(text.as_bytes())));
    }
    let message: ControlMessage = serde_json::from_value(value)
        .map_err(|err| Error::ProtocolViolation(format!("bad control frame: {err}")))?;
    let ControlMessage::Resize { cols, rows } = message;
    if cols == 0 || rows == 0 {
        return Err(Error::ProtocolViolation(format!(
            "resize to {cols}x{rows} rejected"
        )));
    }
    Ok(ClientInput::Control(message))
}

//! # Control Messages
//!
//! JSON text frames travel between browser and backend untouched. The proxy only
//! peeks at the `type` field to pick out the few commands it handles itself, and
//! produces its own [`ProxyMessage`]s for errors and acknowledgements.
//!
//! ## Handled by the proxy:
//! - **Browser `reset`**: drop the partial audio frame, not forwarded
//! - **Browser `getLastData`**: flush the partial frame, answer `lastData`, not forwarded
//! - **Backend `tts` / `start`**: new speech stream, decoder is recreated, forwarded

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the browser-to-backend direction should do with a text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserCommand {
    /// Discard buffered audio.
    Reset,
    /// Flush buffered audio and acknowledge with `lastData`.
    FlushLastData,
    /// Relay the frame to the backend unchanged.
    Forward,
}

/// What the backend-to-browser direction should do with a text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A new TTS stream starts; decoder state must not carry over.
    SpeechStart,
    Forward,
}

/// Messages the proxy itself sends to the browser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ProxyMessage {
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        session_id: Option<String>,
    },

    /// Acknowledges `getLastData` once the remaining audio has been sent.
    #[serde(rename = "lastData")]
    LastData,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BackendUnavailable,
    CapacityExceeded,
    MessageTooLarge,
    ProtocolError,
    Internal,
}

impl ProxyMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>, session_id: Option<&str>) -> Self {
        ProxyMessage::Error {
            code,
            message: message.into(),
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing a plain enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

fn message_type(text: &str) -> Result<Option<String>, ProxyError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProxyError::Protocol(format!("invalid JSON control message: {}", e)))?;

    Ok(value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Classify a text frame received from the browser.
pub fn classify_browser_text(text: &str) -> Result<BrowserCommand, ProxyError> {
    Ok(match message_type(text)?.as_deref() {
        Some("reset") => BrowserCommand::Reset,
        Some("getLastData") => BrowserCommand::FlushLastData,
        _ => BrowserCommand::Forward,
    })
}

/// Classify a text frame received from the backend.
pub fn classify_backend_text(text: &str) -> Result<BackendEvent, ProxyError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProxyError::Protocol(format!("invalid JSON from backend: {}", e)))?;

    let is_tts_start = value.get("type").and_then(Value::as_str) == Some("tts")
        && value.get("state").and_then(Value::as_str) == Some("start");

    Ok(if is_tts_start {
        BackendEvent::SpeechStart
    } else {
        BackendEvent::Forward
    })
}

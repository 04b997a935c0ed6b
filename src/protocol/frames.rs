use actix_web::web::Bytes;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use super::close::CloseOutcome;
use crate::error::ProtocolError;

/// Milliseconds since the Unix epoch, the timestamp unit on every frame.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Frames pushed from the proxy to the client over the SSE stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String, timestamp: i64 },
    Ping { timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    WebsocketConnected { session_id: String, timestamp: i64 },
    Message { data: String, timestamp: i64 },
    /// `data` is base64; the SSE channel only carries text.
    BinaryMessage { data: String, timestamp: i64 },
    WebsocketError { error: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    WebsocketClosed {
        code: u16,
        reason: String,
        was_clean: bool,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn connected(session_id: &str) -> Self {
        ServerFrame::Connected {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn ping() -> Self {
        ServerFrame::Ping { timestamp: now_millis() }
    }

    pub fn websocket_connected(session_id: &str) -> Self {
        ServerFrame::WebsocketConnected {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn text(data: impl Into<String>) -> Self {
        ServerFrame::Message {
            data: data.into(),
            timestamp: now_millis(),
        }
    }

    pub fn binary(data: &[u8]) -> Self {
        ServerFrame::BinaryMessage {
            data: BASE64.encode(data),
            timestamp: now_millis(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerFrame::WebsocketError {
            error: error.into(),
            timestamp: now_millis(),
        }
    }

    pub fn closed(outcome: &CloseOutcome) -> Self {
        ServerFrame::WebsocketClosed {
            code: outcome.code,
            reason: outcome.reason.clone(),
            was_clean: outcome.was_clean,
            timestamp: now_millis(),
        }
    }

    /// Encodes the frame as one SSE event: `data: <json>\n\n`.
    pub fn to_sse(&self) -> Result<Bytes, ProtocolError> {
        let json = serde_json::to_string(self)?;
        Ok(Bytes::from(format!("data: {}\n\n", json)))
    }

    /// Decodes the `data` payload of one SSE event.
    pub fn decode(data: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Bodies posted by the client to the send endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Text { data: String },
    /// `data` is base64.
    Binary { data: String },
}

impl ClientFrame {
    pub fn text(data: impl Into<String>) -> Self {
        ClientFrame::Text { data: data.into() }
    }

    pub fn binary(data: &[u8]) -> Self {
        ClientFrame::Binary {
            data: BASE64.encode(data),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Validates the frame and converts it into the message sent to the backend.
    pub fn into_message(self) -> Result<Message, ProtocolError> {
        match self {
            ClientFrame::Text { data } => Ok(Message::Text(data)),
            ClientFrame::Binary { data } => Ok(Message::Binary(decode_base64(&data)?)),
        }
    }
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(BASE64.decode(data)?)
}

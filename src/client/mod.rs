//! Client side of the bridge
//!
//! [`WebSocket`] mirrors the browser WebSocket API (ready states, close-code
//! validation, open/message/error/close events) on top of an SSE stream for
//! receiving and HTTP posts for sending, both through the proxy.

mod events;
mod websocket;

pub use events::{Blob, CloseEvent, ErrorEvent, Event, EventKind, EventTarget, Listener, ListenerId, MessageData};
pub use websocket::{with_proxy, WebSocket, WebSocketBuilder, WebSocketFactory};

use std::fmt;

/// Connection state, numbered like the browser constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ReadyState {
    #[default]
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "CONNECTING",
            ReadyState::Open => "OPEN",
            ReadyState::Closing => "CLOSING",
            ReadyState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// How binary messages are handed to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryType {
    /// An opaque [`Blob`].
    #[default]
    Blob,
    /// Plain bytes.
    ArrayBuffer,
}

impl BinaryType {
    fn wrap(self, bytes: Vec<u8>) -> MessageData {
        match self {
            BinaryType::Blob => MessageData::Blob(Blob::new(bytes)),
            BinaryType::ArrayBuffer => MessageData::Binary(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_order() {
        assert!(ReadyState::Connecting < ReadyState::Open);
        assert!(ReadyState::Open < ReadyState::Closing);
        assert!(ReadyState::Closing < ReadyState::Closed);
        assert_eq!(ReadyState::Closing as u8, 2);
        assert_eq!(ReadyState::Open.to_string(), "OPEN");
    }

    #[test]
    fn test_binary_type_wrapping() {
        assert_eq!(BinaryType::default(), BinaryType::Blob);
        assert_eq!(
            BinaryType::ArrayBuffer.wrap(vec![1, 2]),
            MessageData::Binary(vec![1, 2])
        );
        match BinaryType::Blob.wrap(vec![1, 2, 3]) {
            MessageData::Blob(blob) => {
                assert_eq!(blob.size(), 3);
                assert_eq!(blob.to_vec(), vec![1, 2, 3]);
            }
            other => panic!("unexpected data {:?}", other),
        }
    }
}

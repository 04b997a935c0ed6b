//! Wire protocol shared by the proxy and the client
//!
//! Proxy-to-client frames travel as JSON objects inside SSE `data:` lines;
//! client-to-proxy frames are JSON request bodies.

mod close;
mod frames;

pub use close::{
    is_clean_code, validate_close_code, validate_close_reason, CloseOutcome, CloseRequest,
    ABNORMAL_CLOSURE, GOING_AWAY, MAX_REASON_BYTES, NORMAL_CLOSURE, NO_STATUS_RECEIVED,
};
pub use frames::{decode_base64, now_millis, ClientFrame, ServerFrame};

/// Request header carrying the session id on send and close posts.
pub const SESSION_HEADER: &str = "X-Session-Id";

/// Request header carrying the operator secret for health diagnostics.
pub const HEALTH_SECRET_HEADER: &str = "X-Health-Secret";

pub const STREAM_PATH: &str = "/stream";
pub const SEND_PATH: &str = "/send";
pub const CLOSE_PATH: &str = "/close";
pub const HEALTH_PATH: &str = "/health";

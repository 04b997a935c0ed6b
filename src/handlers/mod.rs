//! HTTP entry points of the proxy
//!
//! Four routes: the SSE stream that opens a session, the send and close posts
//! that act on it, and the health check.

mod health;
mod messages;
mod stream;

pub use health::health_check;
pub use messages::{close, send};
pub use stream::{open_stream, StreamQuery};

use actix_web::{web, HttpRequest};

use crate::error::AppError;
use crate::protocol::{CLOSE_PATH, HEALTH_PATH, SEND_PATH, SESSION_HEADER, STREAM_PATH};

/// Route table of the proxy.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route(STREAM_PATH, web::get().to(open_stream))
        .route(SEND_PATH, web::post().to(send))
        .route(CLOSE_PATH, web::post().to(close))
        .route(HEALTH_PATH, web::get().to(health_check));
}

fn session_id(req: &HttpRequest) -> Result<String, AppError> {
    req.headers()
        .get(SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::ValidationError(format!("Missing {} header", SESSION_HEADER)))
}

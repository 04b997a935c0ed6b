use actix_web::http::header;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::protocol::ServerFrame;
use crate::session::{run_bridge, spawn_keepalive, EventStream, Session};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Backend target, a full `ws://` or `wss://` URL.
    pub url: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

fn parse_target(raw: Option<&str>) -> Result<Url, AppError> {
    let raw = raw
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AppError::ValidationError("Missing 'url' query parameter".into()))?;

    let url = Url::parse(raw)
        .map_err(|e| AppError::ValidationError(format!("Invalid target URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(AppError::ValidationError(format!(
            "Unsupported target scheme '{}': expected ws or wss",
            other
        ))),
    }
}

/// Opens a session: authorizes the target, registers the session, starts the
/// backend bridge and answers with the session's SSE stream.
pub async fn open_stream(
    query: web::Query<StreamQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let target = parse_target(query.url.as_deref())?;

    if let Err(e) = state.guard.authorize(&target) {
        warn!(target = %target, "Refusing stream: {}", e);
        return Err(e.into());
    }

    let session_id = query
        .session_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (session, channels) = Session::new(session_id.clone(), target);
    state.registry.insert(session.clone()).await?;
    info!(session_id = %session_id, target = %session.target(), "Opened event stream");

    session.emit(&ServerFrame::connected(&session_id));
    tokio::spawn(run_bridge(
        session.clone(),
        state.registry.clone(),
        channels.outbound,
    ));
    spawn_keepalive(session.clone(), state.config.proxy.ping_interval());

    let body = EventStream::new(channels.events, state.registry.clone(), session);
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert!(parse_target(Some("ws://localhost:8080/chat")).is_ok());
        assert!(parse_target(Some("wss://example.com")).is_ok());

        assert!(matches!(parse_target(None), Err(AppError::ValidationError(_))));
        assert!(matches!(parse_target(Some("  ")), Err(AppError::ValidationError(_))));
        assert!(matches!(parse_target(Some("not a url")), Err(AppError::ValidationError(_))));
        assert!(matches!(
            parse_target(Some("http://localhost:8080")),
            Err(AppError::ValidationError(_))
        ));
    }
}

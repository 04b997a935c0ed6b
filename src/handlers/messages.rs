use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{debug, info, warn};

use super::session_id;
use crate::error::{AppError, ProtocolError, SessionError};
use crate::protocol::{ClientFrame, CloseOutcome, CloseRequest};
use crate::session::{BackendState, TeardownReason};
use crate::AppState;

/// Forwards one client frame to the session's backend.
pub async fn send(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let session_id = session_id(&req)?;
    let message = ClientFrame::decode(&body)?.into_message()?;

    let session = state.registry.require(&session_id).await?;
    if !session.is_open() {
        debug!(session_id = %session_id, state = %session.backend_state(), "Send before backend is open");
        return Err(SessionError::BackendNotOpen(session_id).into());
    }
    session.forward(message)?;
    session.touch().await;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

/// Closes the session and answers with its terminal result.
pub async fn close(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let session_id = session_id(&req)?;

    // An empty body is a close without code or reason.
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CloseRequest::default()
    } else {
        serde_json::from_slice::<CloseRequest>(&body).map_err(ProtocolError::from)?
    };
    request.validate()?;

    let session = state.registry.require(&session_id).await?;
    info!(session_id = %session_id, code = ?request.code, "Close requested");

    let outcome = if session.backend_state() == BackendState::Connecting {
        session.settle(request.local_outcome());
        session.outcome().unwrap_or_else(|| request.local_outcome())
    } else {
        session.request_close(request.code, request.reason.clone());
        let wait = session.wait_for_outcome();
        match tokio::time::timeout(state.config.proxy.close_timeout(), wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(session_id = %session_id, "Backend did not complete the close handshake in time");
                session.settle(CloseOutcome::abnormal());
                session.outcome().unwrap_or_else(CloseOutcome::abnormal)
            }
        }
    };

    state
        .registry
        .cleanup_if(&session, TeardownReason::CloseHandshake)
        .await;
    Ok(HttpResponse::Ok().json(outcome))
}

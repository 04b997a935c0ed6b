use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::protocol::HEALTH_SECRET_HEADER;
use crate::AppState;

/// Health check endpoint handler
/// Always reports liveness; session diagnostics need the operator secret.
pub async fn health_check(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let mut body = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    });

    if authorized(&req, state.config.health.secret.as_deref()) {
        let sessions = state.registry.snapshot().await;
        body["activeSessions"] = json!(sessions.len());
        body["sessions"] = json!(sessions);
    }

    HttpResponse::Ok().json(body)
}

fn authorized(req: &HttpRequest, secret: Option<&str>) -> bool {
    let (Some(secret), Some(supplied)) = (
        secret.filter(|s| !s.is_empty()),
        req.headers()
            .get(HEALTH_SECRET_HEADER)
            .and_then(|h| h.to_str().ok()),
    ) else {
        return false;
    };
    // Compare digests rather than the raw secrets.
    Sha256::digest(secret.as_bytes()) == Sha256::digest(supplied.as_bytes())
}

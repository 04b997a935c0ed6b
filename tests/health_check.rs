use actix_web::{test, web, App};
use chrono::DateTime;
use url::Url;
use ws_sse_bridge::session::Session;
use ws_sse_bridge::{AppState, Settings};

async fn health(state: &AppState, secret: Option<&str>) -> serde_json::Value {
    // Create test app
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/health", web::get().to(ws_sse_bridge::health_check)),
    )
    .await;

    let mut req = test::TestRequest::get().uri("/health");
    if let Some(secret) = secret {
        req = req.insert_header(("X-Health-Secret", secret));
    }
    let resp = test::call_service(&app, req.to_request()).await;
    assert!(resp.status().is_success());

    let body = test::read_body(resp).await;
    serde_json::from_slice(&body).unwrap()
}

#[actix_web::test]
async fn test_health_check() {
    let state = AppState::new(Settings::default()).expect("Failed to build state");
    let json = health(&state, None).await;

    // Verify response format
    assert_eq!(json["status"], "healthy");
    assert!(DateTime::parse_from_rfc3339(json["timestamp"].as_str().unwrap()).is_ok());
    assert!(json.get("activeSessions").is_none());
}

#[actix_web::test]
async fn test_health_diagnostics_need_the_secret() {
    let mut config = Settings::default();
    config.health.secret = Some("letmein".into());
    let state = AppState::new(config).unwrap();

    let (session, _channels) = Session::new("diag".into(), Url::parse("ws://127.0.0.1:4000/feed").unwrap());
    state.registry.insert(session).await.unwrap();

    let json = health(&state, None).await;
    assert!(json.get("activeSessions").is_none());
    assert!(json.get("sessions").is_none());

    let json = health(&state, Some("wrong")).await;
    assert!(json.get("activeSessions").is_none());

    let json = health(&state, Some("letmein")).await;
    assert_eq!(json["activeSessions"], 1);
    let session = &json["sessions"][0];
    assert_eq!(session["id"], "diag");
    assert_eq!(session["target"], "ws://127.0.0.1:4000/feed");
    assert_eq!(session["backendState"], "connecting");
    assert!(session["idleMs"].is_u64());
    assert!(session["createdAt"].is_string());
}

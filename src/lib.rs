pub mod client;
pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod protocol;
pub mod session;

use std::net::TcpListener;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::middleware::Condition;
use actix_web::{web, App, HttpServer};
use tracing::info;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use client::{with_proxy, WebSocket, WebSocketBuilder, WebSocketFactory};
pub use guard::HostGuard;
pub use handlers::health_check;
pub use session::SessionRegistry;

use config::CorsConfig;
use protocol::{HEALTH_SECRET_HEADER, SESSION_HEADER};

/// Application state shared across all workers of one proxy instance
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: SessionRegistry,
    pub guard: Arc<HostGuard>,
}

impl AppState {
    pub fn new(config: Settings) -> Result<Self> {
        config.validate()?;
        let guard = HostGuard::from_config(&config.allowlist)
            .map_err(|e| AppError::ConfigError(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            guard: Arc::new(guard),
        })
    }

    pub async fn shutdown(&self) {
        let live = self.registry.session_count().await;
        info!("Shutting down {} live sessions", live);
        self.registry.shutdown().await;
    }
}

fn cors(config: &CorsConfig) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec!["Content-Type", "Accept", SESSION_HEADER, HEALTH_SECRET_HEADER])
        .max_age(config.max_age as usize);

    if config.allowed_origins.is_empty() {
        cors.allow_any_origin()
    } else {
        config
            .allowed_origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

/// Builds the proxy server on an already bound listener. The caller drives the
/// returned future.
pub fn run(listener: TcpListener, state: AppState) -> std::io::Result<Server> {
    let workers = state.config.server.workers.max(1) as usize;
    let body_limit = state.config.proxy.max_body_bytes;
    let cors_config = state.config.cors.clone();
    let state = web::Data::new(state);

    info!("Proxy listening on http://{}", listener.local_addr()?);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Condition::new(cors_config.enabled, cors(&cors_config)))
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(body_limit))
            .configure(handlers::routes)
    })
    .listen(listener)?
    .workers(workers)
    .run();

    Ok(server)
}

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    #[error("Host not allowed: {0}")]
    GuardError(#[from] GuardError),

    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ProtocolError(_) => StatusCode::BAD_REQUEST,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::GuardError(_) => StatusCode::FORBIDDEN,
            AppError::SessionError(e) => match e {
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::AlreadyExists(_) => StatusCode::CONFLICT,
                SessionError::BackendNotOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures decoding or validating a frame in either direction.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    #[error("Close reason exceeds 123 bytes ({0} bytes)")]
    ReasonTooLong(usize),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedFrame(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("'{0}' is not an allowed backend target")]
    NotAllowed(String),

    #[error("Target URL has no host: {0}")]
    MissingHost(String),

    #[error("Invalid allow-list entry '{0}'")]
    InvalidEntry(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unknown session {0}")]
    NotFound(String),

    #[error("Session {0} already has an open stream")]
    AlreadyExists(String),

    #[error("Backend connection for session {0} is not open")]
    BackendNotOpen(String),
}

/// Errors surfaced synchronously by the client-side socket.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Subprotocols are not supported: {0:?}")]
    UnsupportedSubprotocols(Vec<String>),

    #[error("A proxy address is required")]
    MissingProxy,

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Socket is not open (state: {0})")]
    InvalidState(crate::client::ReadyState),

    #[error("Invalid close code {0}: must be 1000 or in 3000-4999")]
    InvalidCloseCode(u16),

    #[error("Close reason exceeds 123 bytes ({0} bytes)")]
    ReasonTooLong(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No async runtime available: {0}")]
    Runtime(String),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidCloseCode(code) => ClientError::InvalidCloseCode(code),
            ProtocolError::ReasonTooLong(len) => ClientError::ReasonTooLong(len),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

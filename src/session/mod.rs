//! Session module for the bridge
//!
//! A session pairs one client SSE stream with one backend WebSocket
//! connection. The registry owns every live session of a proxy instance, the
//! bridge task owns the backend socket, and the reaper evicts idle sessions.

mod bridge;
mod reaper;
mod registry;
mod stream;

pub use bridge::{run as run_bridge, spawn_keepalive};
pub use reaper::spawn_reaper;
pub use registry::SessionRegistry;
pub use stream::EventStream;

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::error::SessionError;
use crate::protocol::{CloseOutcome, ServerFrame, GOING_AWAY, NORMAL_CLOSURE};

/// Lifecycle of the backend link, as seen by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl BackendState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BackendState::Connecting,
            1 => BackendState::Open,
            2 => BackendState::Closing,
            _ => BackendState::Closed,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendState::Connecting => "connecting",
            BackendState::Open => "open",
            BackendState::Closing => "closing",
            BackendState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The client's SSE stream closed or was aborted without a close call.
    StreamClosed,
    /// The backend connection closed (or never opened).
    BackendClosed,
    /// An explicit close request completed or timed out.
    CloseHandshake,
    /// The reaper found the session idle.
    IdleTimeout,
    /// The proxy is shutting down.
    Shutdown,
}

/// Receiving halves created alongside a session.
pub struct SessionChannels {
    pub events: mpsc::UnboundedReceiver<Bytes>,
    pub outbound: mpsc::UnboundedReceiver<Message>,
}

/// Per-session diagnostics reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub backend_state: BackendState,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    target: Url,
    created_at: DateTime<Utc>,
    last_activity: RwLock<Instant>,
    backend_state: AtomicU8,
    events: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    outbound: mpsc::UnboundedSender<Message>,
    // One-shot terminal result; the first writer wins.
    outcome: watch::Sender<Option<CloseOutcome>>,
    close_sent: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(id: String, target: Url) -> (Arc<Self>, SessionChannels) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (outcome, _) = watch::channel(None);

        let session = Self {
            id,
            target,
            created_at: Utc::now(),
            last_activity: RwLock::new(Instant::now()),
            backend_state: AtomicU8::new(BackendState::Connecting as u8),
            events: Mutex::new(Some(events_tx)),
            outbound: outbound_tx,
            outcome,
            close_sent: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };

        (
            Arc::new(session),
            SessionChannels {
                events: events_rx,
                outbound: outbound_rx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn backend_state(&self) -> BackendState {
        BackendState::from_u8(self.backend_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_backend_state(&self, state: BackendState) {
        self.backend_state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.backend_state() == BackendState::Open
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pushes a frame onto the SSE stream. Returns `false` once the stream is gone.
    pub fn emit(&self, frame: &ServerFrame) -> bool {
        let bytes = match frame.to_sse() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(session_id = %self.id, "Failed to encode frame: {}", e);
                return false;
            }
        };
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    /// Queues a client frame for the backend.
    pub fn forward(&self, message: Message) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::BackendNotOpen(self.id.clone()));
        }
        self.outbound
            .send(message)
            .map_err(|_| SessionError::BackendNotOpen(self.id.clone()))
    }

    /// Sends the close frame to the backend. Only the first call has an effect.
    pub fn request_close(&self, code: Option<u16>, reason: Option<String>) -> bool {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.id, "Close already requested");
            return false;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code.unwrap_or(NORMAL_CLOSURE)),
            reason: Cow::Owned(reason.unwrap_or_default()),
        };
        if self.is_open() {
            self.set_backend_state(BackendState::Closing);
        }
        self.outbound.send(Message::Close(Some(frame))).is_ok()
    }

    /// Records the terminal result. The first caller wins, and only the
    /// winner's result reaches the client stream.
    pub fn settle(&self, outcome: CloseOutcome) -> bool {
        let mut won = false;
        self.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome.clone());
                won = true;
            }
            won
        });
        if won {
            info!(
                session_id = %self.id,
                code = outcome.code,
                was_clean = outcome.was_clean,
                "Session closed"
            );
            self.emit(&ServerFrame::closed(&outcome));
        }
        won
    }

    pub fn outcome(&self) -> Option<CloseOutcome> {
        self.outcome.borrow().clone()
    }

    /// Resolves once some path has settled the session.
    pub async fn wait_for_outcome(&self) -> CloseOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(CloseOutcome::abnormal)
    }

    /// Releases the stream and the backend socket. Called once, by the registry.
    pub(crate) fn teardown(&self, reason: TeardownReason) {
        let state = self.backend_state();
        debug!(session_id = %self.id, ?reason, backend_state = %state, "Tearing down session");

        if reason == TeardownReason::StreamClosed && state == BackendState::Open {
            let frame = CloseFrame {
                code: CloseCode::from(GOING_AWAY),
                reason: Cow::Borrowed("going away"),
            };
            self.close_sent.store(true, Ordering::SeqCst);
            let _ = self.outbound.send(Message::Close(Some(frame)));
        }

        self.cancel.cancel();
        // Dropping the sender ends the SSE response.
        self.events.lock().take();
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            target: self.target.to_string(),
            created_at: self.created_at,
            idle_ms: self.idle_for().await.as_millis() as u64,
            backend_state: self.backend_state(),
        }
    }
}

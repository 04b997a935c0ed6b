use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::web::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Session, SessionRegistry, TeardownReason};

/// SSE response body of one session.
///
/// Dropping it means the client's transport is gone (closed, aborted, or the
/// session ended), so drop schedules cleanup of the session it was opened
/// for. A session registered later under the same id is left alone.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<Bytes>,
    registry: SessionRegistry,
    session: Arc<Session>,
}

impl EventStream {
    pub fn new(events: mpsc::UnboundedReceiver<Bytes>, registry: SessionRegistry, session: Arc<Session>) -> Self {
        Self {
            events,
            registry,
            session,
        }
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx).map(|event| event.map(Ok))
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let session = self.session.clone();
        debug!(session_id = %session.id(), "Event stream dropped");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.cleanup_if(&session, TeardownReason::StreamClosed).await;
            });
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{BackendState, Session, SessionRegistry, TeardownReason};
use crate::protocol::{CloseOutcome, ServerFrame, NO_STATUS_RECEIVED};

/// Owns the backend connection of one session: dials the target, relays
/// frames in both directions and reports the authoritative close.
pub async fn run(
    session: Arc<Session>,
    registry: SessionRegistry,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let cancel = session.cancellation();
    let session_id = session.id().to_string();
    info!(session_id = %session_id, target = %session.target(), "Connecting to backend");

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(session_id = %session_id, "Session torn down before the backend connected");
            session.set_backend_state(BackendState::Closed);
            return;
        }
        result = connect_async(session.target().as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!(session_id = %session_id, "Backend connection failed: {}", e);
            session.emit(&ServerFrame::error(e.to_string()));
            session.set_backend_state(BackendState::Closed);
            finish(&session, &registry, CloseOutcome::abnormal()).await;
            return;
        }
    };

    session.set_backend_state(BackendState::Open);
    session.emit(&ServerFrame::websocket_connected(&session_id));
    info!(session_id = %session_id, "Backend connection established");

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    // Close frame received from the backend, if any.
    let mut received: Option<CloseOutcome> = None;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Flush what teardown queued (e.g. a going-away close) before letting go.
                while let Ok(message) = outbound.try_recv() {
                    if ws_sink.send(message).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = ws_sink.close().await {
                    debug!(session_id = %session_id, "Error closing backend socket: {}", e);
                }
                break None;
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = ws_sink.send(message).await {
                    error!(session_id = %session_id, "Error sending to backend: {}", e);
                    session.emit(&ServerFrame::error(e.to_string()));
                    break Some(received.take().unwrap_or_else(CloseOutcome::abnormal));
                }
            }
            message = ws_stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    session.touch().await;
                    session.emit(&ServerFrame::text(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    session.touch().await;
                    session.emit(&ServerFrame::binary(&data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let outcome = match frame {
                        Some(frame) => CloseOutcome::from_code(u16::from(frame.code), frame.reason.into_owned()),
                        None => CloseOutcome::from_code(NO_STATUS_RECEIVED, ""),
                    };
                    debug!(session_id = %session_id, code = outcome.code, "Backend sent close frame");
                    session.set_backend_state(BackendState::Closing);
                    received = Some(outcome);
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    break Some(received.take().unwrap_or_else(CloseOutcome::abnormal));
                }
                Some(Err(WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake))) => {
                    warn!(session_id = %session_id, "Backend dropped the connection without a closing handshake");
                    break Some(CloseOutcome::abnormal());
                }
                Some(Err(e)) => {
                    error!(session_id = %session_id, "Backend connection error: {}", e);
                    session.emit(&ServerFrame::error(e.to_string()));
                    break Some(received.take().unwrap_or_else(CloseOutcome::abnormal));
                }
            }
        }
    };

    session.set_backend_state(BackendState::Closed);
    if let Some(outcome) = outcome {
        finish(&session, &registry, outcome).await;
    }
    debug!(session_id = %session_id, "Backend bridge stopped");
}

/// The single unconditional cleanup path for backend-side closure.
async fn finish(session: &Arc<Session>, registry: &SessionRegistry, outcome: CloseOutcome) {
    session.settle(outcome);
    registry.cleanup_if(session, TeardownReason::BackendClosed).await;
}

/// Emits keepalive pings on the session's stream until it is torn down.
pub fn spawn_keepalive(session: Arc<Session>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = session.cancellation();
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !session.emit(&ServerFrame::ping()) {
                        debug!(session_id = %session.id(), "Stream gone, stopping keepalive");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use url::Url;

    fn frames(rx: &mut mpsc::UnboundedReceiver<actix_web::web::Bytes>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            let text = std::str::from_utf8(&bytes).unwrap().to_string();
            let payload = text.trim_end().strip_prefix("data: ").unwrap().to_string();
            out.push(ServerFrame::decode(&payload).unwrap());
        }
        out
    }

    /// Backend that echoes one message, then closes with 4002 "bye".
    async fn spawn_backend() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(message)) = ws.next().await {
                ws.send(message).await.unwrap();
            }
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(4002),
                reason: "bye".into(),
            })))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });
        Url::parse(&format!("ws://{}", addr)).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_bridge_relays_and_reports_backend_close() {
        let target = spawn_backend().await;
        let registry = SessionRegistry::new();
        let (session, mut channels) = Session::new("bridge-test".into(), target);
        registry.insert(session.clone()).await.unwrap();

        let bridge = tokio::spawn(run(session.clone(), registry.clone(), channels.outbound));
        while !session.is_open() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        session.forward(Message::Binary(vec![0, 1, 2])).unwrap();

        tokio::time::timeout(Duration::from_secs(5), bridge).await.unwrap().unwrap();

        let outcome = session.outcome().unwrap();
        assert_eq!(outcome.code, 4002);
        assert_eq!(outcome.reason, "bye");
        assert!(!outcome.was_clean);
        assert_eq!(registry.session_count().await, 0);

        let frames = frames(&mut channels.events);
        assert!(matches!(frames[0], ServerFrame::WebsocketConnected { .. }));
        match &frames[1] {
            ServerFrame::BinaryMessage { data, .. } => assert_eq!(data, "AAEC"),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(frames.last(), Some(ServerFrame::WebsocketClosed { code: 4002, .. })));
    }

    #[test_log::test(tokio::test)]
    async fn test_unreachable_backend_reports_error_then_abnormal_close() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let target = Url::parse(&format!("ws://{}", addr)).unwrap();

        let registry = SessionRegistry::new();
        let (session, mut channels) = Session::new("unreachable".into(), target);
        registry.insert(session.clone()).await.unwrap();

        run(session.clone(), registry.clone(), channels.outbound).await;

        let frames = frames(&mut channels.events);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerFrame::WebsocketError { .. }));
        assert!(matches!(
            frames[1],
            ServerFrame::WebsocketClosed { code: 1006, was_clean: false, .. }
        ));
        assert_eq!(session.backend_state(), BackendState::Closed);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_keepalive_stops_on_teardown() {
        let (session, mut channels) =
            Session::new("keepalive".into(), Url::parse("ws://127.0.0.1:9").unwrap());
        let handle = spawn_keepalive(session.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(70)).await;
        session.teardown(TeardownReason::IdleTimeout);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let pings = frames(&mut channels.events);
        assert!(!pings.is_empty());
        assert!(pings.iter().all(|f| matches!(f, ServerFrame::Ping { .. })));
    }
}

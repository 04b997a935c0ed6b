#![allow(dead_code)]

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use ws_sse_bridge::client::{Event, EventKind, WebSocketBuilder};
use ws_sse_bridge::{run, AppState, Settings};

pub const HEALTH_SECRET: &str = "test-secret";

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.workers = 1;
    settings.proxy.close_timeout_ms = 2_000;
    settings.health.secret = Some(HEALTH_SECRET.to_string());
    settings
}

pub struct TestProxy {
    pub address: String,
    pub state: AppState,
}

impl TestProxy {
    pub async fn active_sessions(&self) -> u64 {
        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("{}/health", self.address))
            .header("X-Health-Secret", HEALTH_SECRET)
            .send()
            .await
            .expect("Failed to query health")
            .json()
            .await
            .expect("Health body is not JSON");
        body["activeSessions"].as_u64().expect("Missing activeSessions")
    }
}

/// Starts a proxy on an ephemeral port.
pub fn spawn_proxy(settings: Settings) -> TestProxy {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let state = AppState::new(settings).expect("Failed to build state");
    let server = run(listener, state.clone()).expect("Failed to start proxy");
    let _ = tokio::spawn(server);

    TestProxy {
        address: format!("http://127.0.0.1:{}", port),
        state,
    }
}

/// Backend that echoes every data frame until the peer closes.
pub async fn spawn_echo_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else { return };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_text() || message.is_binary() {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    format!("ws://{}", addr)
}

/// Backend that closes every connection with `code`/`reason` right after the handshake.
pub async fn spawn_closing_backend(code: u16, reason: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else { return };
                tokio::time::sleep(Duration::from_millis(50)).await;
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if ws.send(Message::Close(Some(frame))).await.is_ok() {
                    while ws.next().await.is_some() {}
                }
            });
        }
    });
    format!("ws://{}", addr)
}

/// Backend that completes the handshake and then never reads, so a close
/// frame sent to it is never answered.
pub async fn spawn_deaf_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(_ws) = accept_async(stream).await else { return };
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    format!("ws://{}", addr)
}

/// A backend address that accepts TCP but never completes the handshake.
pub async fn silent_backend() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// A backend address nothing listens on.
pub async fn unreachable_backend() -> String {
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    format!("ws://{}", addr)
}

/// Records every event a socket dispatches, in order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn attach(&self, builder: WebSocketBuilder) -> WebSocketBuilder {
        [EventKind::Open, EventKind::Message, EventKind::Error, EventKind::Close]
            .into_iter()
            .fold(builder, |builder, kind| {
                let events = self.events.clone();
                builder.on(kind, move |event| events.lock().push(event.clone()))
            })
    }

    pub fn record(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Waits up to five seconds for `condition` to hold over the recorded events.
    pub async fn wait_for<F>(&self, condition: F)
    where
        F: Fn(&[Event]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if condition(&self.events.lock()) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for events, got {:?}", self.events());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not met in time");
}

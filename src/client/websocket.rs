use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::events::{CloseEvent, ErrorEvent, Event, EventKind, EventTarget, Listener, ListenerId, MessageData};
use eventsource_stream::Eventsource;
use super::{BinaryType, ReadyState};
use crate::error::ClientError;
use crate::protocol::{
    decode_base64, ClientFrame, CloseOutcome, CloseRequest, ServerFrame, CLOSE_PATH, NORMAL_CLOSURE,
    SEND_PATH, SESSION_HEADER, STREAM_PATH,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a send refused because the backend is no longer open waits for
/// the backend's own close to arrive on the stream.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Pre-configures the proxy address for every socket it creates.
pub fn with_proxy(proxy: &str) -> Result<WebSocketFactory, ClientError> {
    Ok(WebSocketFactory {
        proxy: parse_proxy(proxy)?,
    })
}

#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    proxy: Url,
}

impl WebSocketFactory {
    pub fn proxy(&self) -> &Url {
        &self.proxy
    }

    pub fn builder(&self, url: &str) -> WebSocketBuilder {
        WebSocket::builder(url).proxy_url(self.proxy.clone())
    }

    pub fn connect(&self, url: &str) -> Result<WebSocket, ClientError> {
        self.builder(url).connect()
    }
}

/// Collects options and listeners before the stream starts, so no early
/// event can be missed.
#[derive(Debug)]
pub struct WebSocketBuilder {
    url: String,
    proxy: Option<Result<Url, ClientError>>,
    protocols: Vec<String>,
    binary_type: BinaryType,
    events: EventTarget,
}

impl WebSocketBuilder {
    pub fn proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(parse_proxy(proxy));
        self
    }

    fn proxy_url(mut self, proxy: Url) -> Self {
        self.proxy = Some(Ok(proxy));
        self
    }

    /// Subprotocols cannot be negotiated through the proxy; a non-empty list
    /// makes `connect` fail.
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn binary_type(mut self, binary_type: BinaryType) -> Self {
        self.binary_type = binary_type;
        self
    }

    pub fn on<F>(self, kind: EventKind, listener: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.add_listener(kind, Arc::new(listener));
        self
    }

    pub fn on_open<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.set_handler(EventKind::Open, Some(Arc::new(handler)));
        self
    }

    pub fn on_message<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.set_handler(EventKind::Message, Some(Arc::new(handler)));
        self
    }

    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.set_handler(EventKind::Error, Some(Arc::new(handler)));
        self
    }

    pub fn on_close<F>(self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.set_handler(EventKind::Close, Some(Arc::new(handler)));
        self
    }

    /// Validates the options and starts connecting. Must be called inside a
    /// tokio runtime.
    pub fn connect(self) -> Result<WebSocket, ClientError> {
        if !self.protocols.is_empty() {
            return Err(ClientError::UnsupportedSubprotocols(self.protocols));
        }
        let proxy = self.proxy.ok_or(ClientError::MissingProxy)??;
        let url = parse_target(&self.url)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Runtime(e.to_string()))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        let session_id = Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            url,
            session_id,
            state: Mutex::new(ClientState::default()),
            binary_type: Mutex::new(self.binary_type),
            events: self.events,
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
        });

        let mut stream_url = endpoint(&proxy, STREAM_PATH);
        stream_url
            .query_pairs_mut()
            .append_pair("url", shared.url.as_str())
            .append_pair("sessionId", &shared.session_id);
        info!(session_id = %shared.session_id, target = %shared.url, proxy = %proxy, "Opening bridged WebSocket");

        runtime.spawn(read_stream(shared.clone(), client.clone(), stream_url));
        runtime.spawn(post_outbound(
            shared.clone(),
            client,
            endpoint(&proxy, SEND_PATH),
            endpoint(&proxy, CLOSE_PATH),
            outbound_rx,
        ));

        Ok(WebSocket { shared })
    }
}

/// A WebSocket-shaped connection tunneled through the proxy.
///
/// Cloning yields another handle to the same connection.
#[derive(Debug, Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl WebSocket {
    pub fn builder(url: &str) -> WebSocketBuilder {
        WebSocketBuilder {
            url: url.to_string(),
            proxy: None,
            protocols: Vec::new(),
            binary_type: BinaryType::default(),
            events: EventTarget::new(),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Always empty; subprotocols are not supported.
    pub fn protocol(&self) -> &str {
        ""
    }

    /// Always empty; extensions are not supported.
    pub fn extensions(&self) -> &str {
        ""
    }

    pub fn binary_type(&self) -> BinaryType {
        *self.shared.binary_type.lock()
    }

    /// Applies to messages received from now on.
    pub fn set_binary_type(&self, binary_type: BinaryType) {
        *self.shared.binary_type.lock() = binary_type;
    }

    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.events.add_listener(kind, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }

    /// Sets or clears the single handler slot for `kind`.
    pub fn set_handler(&self, kind: EventKind, handler: Option<Listener>) {
        self.shared.events.set_handler(kind, handler);
    }

    pub fn send_text(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientFrame::text(data))
    }

    pub fn send_binary(&self, data: impl AsRef<[u8]>) -> Result<(), ClientError> {
        self.send(ClientFrame::binary(data.as_ref()))
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(ClientError::InvalidState(state));
        }
        self.shared
            .outbound
            .send(Outbound::Send(frame))
            .map_err(|_| ClientError::InvalidState(self.ready_state()))
    }

    /// Starts the closing handshake. Invalid codes or reasons fail before any
    /// state change; closing an already closing or closed socket does nothing.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) -> Result<(), ClientError> {
        let request = CloseRequest {
            code,
            reason: reason.map(str::to_string),
        };
        request.validate()?;

        let previous = {
            let mut state = self.shared.state.lock();
            let previous = state.ready_state;
            match previous {
                ReadyState::Connecting => state.ready_state = ReadyState::Closed,
                ReadyState::Open => state.ready_state = ReadyState::Closing,
                ReadyState::Closing | ReadyState::Closed => return Ok(()),
            }
            state.user_initiated_close = true;
            previous
        };

        if previous == ReadyState::Connecting {
            // The backend never opened: close locally, without a round trip.
            debug!(session_id = %self.shared.session_id, "Closing before open");
            self.shared.cancel.cancel();
            self.shared.dispatch(Event::Close(CloseEvent {
                code: code.unwrap_or(NORMAL_CLOSURE),
                reason: request.reason.unwrap_or_default(),
                was_clean: true,
            }));
            return Ok(());
        }

        if self.shared.outbound.send(Outbound::Close(request)).is_err() {
            self.shared.finish_close(CloseOutcome::abnormal());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClientState {
    ready_state: ReadyState,
    user_initiated_close: bool,
    // An error event was already delivered while connecting.
    error_reported: bool,
}

#[derive(Debug)]
enum Outbound {
    Send(ClientFrame),
    Close(CloseRequest),
}

#[derive(Debug)]
struct Shared {
    url: Url,
    session_id: String,
    state: Mutex<ClientState>,
    binary_type: Mutex<BinaryType>,
    events: EventTarget,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl Shared {
    fn ready_state(&self) -> ReadyState {
        self.state.lock().ready_state
    }

    fn dispatch(&self, event: Event) {
        self.events.dispatch(&event);
    }

    fn error(&self, message: impl Into<String>) {
        self.dispatch(Event::Error(ErrorEvent {
            message: message.into(),
        }));
    }

    fn open(&self) {
        {
            let mut state = self.state.lock();
            if state.ready_state != ReadyState::Connecting {
                return;
            }
            state.ready_state = ReadyState::Open;
        }
        info!(session_id = %self.session_id, "Bridged WebSocket open");
        self.dispatch(Event::Open);
    }

    /// The connection never opened: an error event (once), then CLOSED with
    /// no close event.
    fn fail_establishment(&self, message: String) {
        let report = {
            let mut state = self.state.lock();
            if state.ready_state != ReadyState::Connecting {
                return;
            }
            state.ready_state = ReadyState::Closed;
            !std::mem::replace(&mut state.error_reported, true)
        };
        warn!(session_id = %self.session_id, "Connection failed: {}", message);
        self.cancel.cancel();
        if report {
            self.error(message);
        }
    }

    /// Delivers the single close event. Later calls do nothing.
    fn finish_close(&self, outcome: CloseOutcome) {
        let user_initiated = {
            let mut state = self.state.lock();
            if state.ready_state == ReadyState::Closed {
                return;
            }
            state.ready_state = ReadyState::Closed;
            state.user_initiated_close
        };
        info!(
            session_id = %self.session_id,
            code = outcome.code,
            was_clean = outcome.was_clean,
            user_initiated,
            "Bridged WebSocket closed"
        );
        self.cancel.cancel();
        self.dispatch(Event::Close(CloseEvent {
            code: outcome.code,
            reason: outcome.reason,
            was_clean: outcome.was_clean,
        }));
    }

    /// A frame the stream should never carry.
    fn protocol_failure(&self, message: String) {
        match self.ready_state() {
            ReadyState::Connecting => self.fail_establishment(message),
            ReadyState::Open | ReadyState::Closing => {
                warn!(session_id = %self.session_id, "Protocol failure: {}", message);
                self.error(message);
                self.finish_close(CloseOutcome::abnormal());
            }
            ReadyState::Closed => {}
        }
    }

    fn deliver(&self, data: MessageData) {
        match self.ready_state() {
            ReadyState::Open | ReadyState::Closing => self.dispatch(Event::Message(data)),
            state => debug!(session_id = %self.session_id, %state, "Dropping message outside an open connection"),
        }
    }

    fn handle_frame(&self, data: &str) {
        let frame = match ServerFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_failure(format!("Failed to decode stream frame: {}", e));
                return;
            }
        };

        match frame {
            ServerFrame::Connected { session_id, .. } => {
                debug!(session_id = %session_id, "Proxy accepted the stream");
            }
            ServerFrame::Ping { .. } => {}
            ServerFrame::WebsocketConnected { .. } => self.open(),
            ServerFrame::Message { data, .. } => self.deliver(MessageData::Text(data)),
            ServerFrame::BinaryMessage { data, .. } => match decode_base64(&data) {
                Ok(bytes) => {
                    let binary_type = *self.binary_type.lock();
                    self.deliver(binary_type.wrap(bytes));
                }
                Err(e) => self.protocol_failure(format!("Failed to decode binary message: {}", e)),
            },
            ServerFrame::WebsocketError { error, .. } => {
                {
                    let mut state = self.state.lock();
                    if state.ready_state == ReadyState::Connecting {
                        state.error_reported = true;
                    }
                }
                self.error(error);
            }
            ServerFrame::WebsocketClosed {
                code,
                reason,
                was_clean,
                ..
            } => {
                if self.ready_state() == ReadyState::Connecting {
                    self.fail_establishment(format!(
                        "Backend connection closed before opening (code {})",
                        code
                    ));
                } else {
                    self.finish_close(CloseOutcome {
                        code,
                        reason,
                        was_clean,
                    });
                }
            }
        }
    }

    /// The SSE stream ended or broke.
    fn stream_lost(&self, cause: String) {
        match self.ready_state() {
            ReadyState::Connecting => self.fail_establishment(cause),
            ReadyState::Open => {
                warn!(session_id = %self.session_id, "Stream lost: {}", cause);
                self.finish_close(CloseOutcome::abnormal());
            }
            // The close post reports the result.
            ReadyState::Closing | ReadyState::Closed => {}
        }
    }
}

async fn read_stream(shared: Arc<Shared>, client: Client, stream_url: Url) {
    let request = client
        .get(stream_url)
        .header(header::ACCEPT, "text/event-stream")
        .send();
    let response = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        response = request => response,
    };

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            shared.fail_establishment(format!("Proxy rejected the stream ({}): {}", status, body));
            return;
        }
        Err(e) => {
            shared.fail_establishment(format!("Proxy unreachable: {}", e));
            return;
        }
    };

    let mut events = Box::pin(response.bytes_stream().eventsource());
    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                if event.data.is_empty() {
                    continue;
                }
                shared.handle_frame(&event.data);
                if shared.ready_state() == ReadyState::Closed {
                    return;
                }
            }
            Some(Err(e)) => {
                shared.stream_lost(format!("Stream error: {}", e));
                return;
            }
            None => {
                shared.stream_lost("Stream ended".to_string());
                return;
            }
        }
    }
}

/// Posts sends and the close request in order, one at a time.
async fn post_outbound(
    shared: Arc<Shared>,
    client: Client,
    send_url: Url,
    close_url: Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        let item = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            Outbound::Send(frame) => {
                let result = client
                    .post(send_url.clone())
                    .header(SESSION_HEADER, &shared.session_id)
                    .json(&frame)
                    .send()
                    .await;
                let failure = match result {
                    Ok(response) if response.status().is_success() => None,
                    Ok(response) => Some((format!("proxy answered {}", response.status()), Some(response.status()))),
                    Err(e) => Some((e.to_string(), None)),
                };
                if let Some((failure, status)) = failure {
                    if status == Some(StatusCode::SERVICE_UNAVAILABLE) {
                        // The backend is already closing; its close frame is likely in flight.
                        debug!(session_id = %shared.session_id, "Send refused, waiting for the backend close");
                        tokio::select! {
                            _ = shared.cancel.cancelled() => {}
                            _ = tokio::time::sleep(CLOSE_GRACE) => {}
                        }
                    }
                    if shared.ready_state() == ReadyState::Open {
                        warn!(session_id = %shared.session_id, "Send failed: {}", failure);
                        shared.finish_close(CloseOutcome::abnormal());
                    }
                }
            }
            Outbound::Close(request) => {
                let result = client
                    .post(close_url.clone())
                    .header(SESSION_HEADER, &shared.session_id)
                    .json(&request)
                    .send()
                    .await;
                let outcome = match result {
                    Ok(response) if response.status().is_success() => {
                        response.json::<CloseOutcome>().await.unwrap_or_else(|e| {
                            warn!(session_id = %shared.session_id, "Unreadable close response: {}", e);
                            CloseOutcome::abnormal()
                        })
                    }
                    Ok(response) => {
                        warn!(session_id = %shared.session_id, "Close rejected: {}", response.status());
                        CloseOutcome::abnormal()
                    }
                    Err(e) => {
                        warn!(session_id = %shared.session_id, "Close failed: {}", e);
                        CloseOutcome::abnormal()
                    }
                };
                shared.finish_close(outcome);
                break;
            }
        }
    }
}

fn parse_target(raw: &str) -> Result<Url, ClientError> {
    let invalid = |reason: &str| ClientError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        _ => return Err(invalid("scheme must be ws or wss")),
    }
    if url.fragment().is_some() {
        return Err(invalid("fragments are not allowed"));
    }
    Ok(url)
}

fn parse_proxy(raw: &str) -> Result<Url, ClientError> {
    let invalid = |reason: &str| ClientError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(invalid("proxy scheme must be http or https")),
    }
}

/// `path` under the proxy's base path.
fn endpoint(proxy: &Url, path: &str) -> Url {
    let mut url = proxy.clone();
    let base = proxy.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}{}", base, path));
    url.set_query(None);
    url.set_fragment(None);
    url
}

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque binary payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    data: Arc<[u8]>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob").field("size", &self.size()).finish()
    }
}

/// Payload of a message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    Text(String),
    Binary(Vec<u8>),
    Blob(Blob),
}

impl MessageData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageData::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The raw bytes, whatever the representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MessageData::Text(text) => text.as_bytes().to_vec(),
            MessageData::Binary(bytes) => bytes.clone(),
            MessageData::Blob(blob) => blob.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Message(MessageData),
    Error(ErrorEvent),
    Close(CloseEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Open => EventKind::Open,
            Event::Message(_) => EventKind::Message,
            Event::Error(_) => EventKind::Error,
            Event::Close(_) => EventKind::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners in insertion order, plus one handler slot per event
/// kind. Every dispatch reaches both.
#[derive(Default)]
pub struct EventTarget {
    listeners: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
    handlers: Mutex<HashMap<EventKind, Listener>>,
    next_id: AtomicU64,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, kind, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    /// Replaces the handler slot for `kind`; `None` clears it.
    pub fn set_handler(&self, kind: EventKind, handler: Option<Listener>) {
        let mut handlers = self.handlers.lock();
        match handler {
            Some(handler) => {
                handlers.insert(kind, handler);
            }
            None => {
                handlers.remove(&kind);
            }
        }
    }

    pub fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        // Snapshot first so callbacks may register or remove listeners.
        let mut targets: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| l.clone())
            .collect();
        if let Some(handler) = self.handlers.lock().get(&kind) {
            targets.push(handler.clone());
        }

        for target in targets {
            target(event);
        }
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("listeners", &self.listeners.lock().len())
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = log.clone();
        Arc::new(move |event: &Event| log.lock().push(format!("{}:{:?}", tag, event.kind())))
    }

    #[test]
    fn test_listeners_and_handler_observe_same_event() {
        let target = EventTarget::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        target.add_listener(EventKind::Message, Arc::new(move |e: &Event| a.lock().push(e.clone())));
        let b = seen.clone();
        target.set_handler(EventKind::Message, Some(Arc::new(move |e: &Event| b.lock().push(e.clone()))));

        let event = Event::Message(MessageData::Text("hi".into()));
        target.dispatch(&event);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| *e == event));
    }

    #[test]
    fn test_dispatch_order_and_filtering() {
        let target = EventTarget::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        target.add_listener(EventKind::Open, recorder(&log, "first"));
        let second = target.add_listener(EventKind::Open, recorder(&log, "second"));
        target.add_listener(EventKind::Close, recorder(&log, "close"));
        target.set_handler(EventKind::Open, Some(recorder(&log, "slot")));

        target.dispatch(&Event::Open);
        assert_eq!(*log.lock(), vec!["first:Open", "second:Open", "slot:Open"]);

        log.lock().clear();
        assert!(target.remove_listener(second));
        assert!(!target.remove_listener(second));
        target.set_handler(EventKind::Open, None);
        target.dispatch(&Event::Open);
        assert_eq!(*log.lock(), vec!["first:Open"]);
    }

    #[test]
    fn test_listener_may_register_during_dispatch() {
        let target = Arc::new(EventTarget::new());
        let inner = target.clone();
        target.add_listener(
            EventKind::Error,
            Arc::new(move |_: &Event| {
                inner.add_listener(EventKind::Error, Arc::new(|_: &Event| {}));
            }),
        );
        target.dispatch(&Event::Error(ErrorEvent { message: "boom".into() }));
        assert_eq!(target.listeners.lock().len(), 2);
    }
}

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::models::Communication;

/// Callbacks the core fires toward its host. Every method is optional and
/// fire-and-forget.
pub trait ChatListener: Send + Sync {
    fn on_error(&self, _error: &ChatError) {}
    fn on_websocket_close(&self) {}
    fn on_websocket_open(&self) {}
    fn on_subscription_connect(&self) {}
    fn on_message_received(&self, _message: &Communication) {}
    fn on_message_updated(&self, _message: &Communication) {}
}

pub type SharedListener = Arc<dyn ChatListener>;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Error(String),
    WebsocketClose,
    WebsocketOpen,
    SubscriptionConnect,
    MessageReceived(Communication),
    MessageUpdated(Communication),
}

/// Forwards listener callbacks as [`CoreEvent`]s over a channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: CoreEvent) {
        // receiver gone means nobody is watching
        let _ = self.tx.send(event);
    }
}

impl ChatListener for ChannelListener {
    fn on_error(&self, error: &ChatError) {
        self.emit(CoreEvent::Error(error.to_string()));
    }

    fn on_websocket_close(&self) {
        self.emit(CoreEvent::WebsocketClose);
    }

    fn on_websocket_open(&self) {
        self.emit(CoreEvent::WebsocketOpen);
    }

    fn on_subscription_connect(&self) {
        self.emit(CoreEvent::SubscriptionConnect);
    }

    fn on_message_received(&self, message: &Communication) {
        self.emit(CoreEvent::MessageReceived(message.clone()));
    }

    fn on_message_updated(&self, message: &Communication) {
        self.emit(CoreEvent::MessageUpdated(message.clone()));
    }
}

/// Listener that keeps every event in memory, for inspection
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CoreEvent::Error(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ChatListener for RecordingListener {
    fn on_error(&self, error: &ChatError) {
        self.events.lock().push(CoreEvent::Error(error.to_string()));
    }

    fn on_websocket_close(&self) {
        self.events.lock().push(CoreEvent::WebsocketClose);
    }

    fn on_websocket_open(&self) {
        self.events.lock().push(CoreEvent::WebsocketOpen);
    }

    fn on_subscription_connect(&self) {
        self.events.lock().push(CoreEvent::SubscriptionConnect);
    }

    fn on_message_received(&self, message: &Communication) {
        self.events
            .lock()
            .push(CoreEvent::MessageReceived(message.clone()));
    }

    fn on_message_updated(&self, message: &Communication) {
        self.events
            .lock()
            .push(CoreEvent::MessageUpdated(message.clone()));
    }
}

//! Query / write / subscribe interface to the FHIR backend, plus the
//! Medplum REST+websocket adapter and an in-memory store.

pub mod bundle;
pub mod medplum;
pub mod memory;
pub mod patch;
pub mod search;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub use bundle::{Bundle, BundleEntry, SearchMode, SearchResult};
pub use medplum::MedplumClient;
pub use memory::MemoryBackend;
pub use json_patch::Patch;
pub use patch::PatchBuilder;
pub use search::{SearchFilter, SearchParams};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A versioned write lost against a concurrent change
    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid FHIR resource: {0}")]
    InvalidResource(String),

    #[error("Websocket error: {0}")]
    Websocket(String),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("{0}")]
    Unsupported(String),
}

/// Lifecycle and data events delivered by a subscription channel
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Subscription bound and active (handshake received)
    Connect,
    SocketClose,
    SocketOpen,
    /// Notification bundle; entry[1] is the changed resource
    Message(Bundle),
    Error(String),
}

/// Receiving end of a live subscription. Dropping it stops the producer.
pub struct SubscriptionStream {
    events: mpsc::Receiver<SubscriptionEvent>,
    cancel_tx: watch::Sender<bool>,
}

impl SubscriptionStream {
    /// Build a stream plus the handles a producer needs: the event sender
    /// and a cancellation receiver flipped to `true` on close/drop.
    pub fn channel(
        buffer: usize,
    ) -> (
        Self,
        mpsc::Sender<SubscriptionEvent>,
        watch::Receiver<bool>,
    ) {
        let (event_tx, events) = mpsc::channel(buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (Self { events, cancel_tx }, event_tx, cancel_rx)
    }

    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// The backend as seen by the chat core. Resources travel as JSON so the
/// trait stays independent of any one resource type.
#[async_trait]
pub trait FhirBackend: Send + Sync {
    async fn search(&self, resource_type: &str, params: &SearchParams)
        -> Result<Bundle, BackendError>;

    async fn create(&self, resource: Value) -> Result<Value, BackendError>;

    async fn update(&self, resource: Value) -> Result<Value, BackendError>;

    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: Patch,
    ) -> Result<Value, BackendError>;

    async fn read(&self, resource_type: &str, id: &str) -> Result<Value, BackendError>;

    /// Open a subscription for `criteria` (e.g. `Communication?part-of:missing=true`)
    async fn subscribe(&self, criteria: &str) -> Result<SubscriptionStream, BackendError>;
}

pub(crate) fn resource_type_of(resource: &Value) -> Result<String, BackendError> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| BackendError::InvalidResource("Missing resourceType field".to_string()))
}

pub(crate) fn id_of(resource: &Value) -> Option<String> {
    resource.get("id").and_then(Value::as_str).map(String::from)
}

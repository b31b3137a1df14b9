use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, FhirBackend, MedplumClient};
use crate::config::CoreConfig;
use crate::events::SharedListener;
use crate::models::{Profile, Reference};
use crate::store::{AvatarCache, ThreadStore};
use crate::subscription::SubscriptionCoordinator;

/// Wires a backend, the thread store, the subscription coordinator and the
/// avatar cache for one host process.
pub struct ChatRuntime {
    backend: Arc<dyn FhirBackend>,
    store: ThreadStore,
    coordinator: SubscriptionCoordinator,
    avatars: Arc<AvatarCache>,
    subscription_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatRuntime {
    pub fn new(backend: Arc<dyn FhirBackend>, listener: SharedListener, config: &CoreConfig) -> Self {
        let store = ThreadStore::new(backend.clone(), listener.clone(), config.thread_page_size);
        let coordinator = SubscriptionCoordinator::new(backend.clone(), store.clone(), listener);
        Self {
            backend,
            store,
            coordinator,
            avatars: Arc::new(AvatarCache::new()),
            subscription_task: Mutex::new(None),
        }
    }

    /// Runtime talking to a Medplum server described by `config`
    pub fn with_medplum(config: &CoreConfig, listener: SharedListener) -> Result<Self, BackendError> {
        let client = MedplumClient::new(config)?;
        Ok(Self::new(Arc::new(client), listener, config))
    }

    /// Share an avatar cache owned by the host
    pub fn with_avatar_cache(mut self, avatars: Arc<AvatarCache>) -> Self {
        self.avatars = avatars;
        self
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn coordinator(&self) -> &SubscriptionCoordinator {
        &self.coordinator
    }

    pub fn avatars(&self) -> &Arc<AvatarCache> {
        &self.avatars
    }

    /// Switch identity: reset the store, stop the previous live feed,
    /// subscribe for the new profile and load its threads. A failed
    /// subscription is reported to the listener; threads load regardless.
    pub async fn set_profile(&self, profile: Option<Profile>) {
        if !self.store.set_profile(profile.clone()) {
            return;
        }
        // already cancelled by the store's session switch
        self.join_subscription().await;

        let Some(profile) = profile else {
            return;
        };
        info!("Starting session for {}", profile.reference);

        let cancel_rx = self.store.session_cancellation();
        match self.coordinator.start(&profile, cancel_rx).await {
            Ok(task) => *self.subscription_task.lock() = Some(task),
            Err(e) => self.store.report(e),
        }

        self.store.refresh_threads().await;
    }

    /// Switch identity and load its threads without opening a live feed
    pub async fn load_profile(&self, profile: Profile) {
        if self.store.set_profile(Some(profile)) {
            self.store.refresh_threads().await;
        }
    }

    /// Avatar URL for a Patient/Practitioner reference, fetched once
    pub async fn avatar(&self, reference: &Reference) -> Option<String> {
        self.avatars.get_or_fetch(self.backend.as_ref(), reference).await
    }

    /// End the session and wait for the live feed to stop
    pub async fn shutdown(&self) {
        self.store.set_profile(None);
        self.join_subscription().await;
    }

    async fn join_subscription(&self) {
        let task = self.subscription_task.lock().take();
        let Some(task) = task else {
            return;
        };
        match task.await {
            Ok(()) => debug!("Subscription loop stopped"),
            Err(e) => warn!("Subscription loop ended abnormally: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Bundle, MemoryBackend, Patch, SearchParams, SubscriptionStream};
    use crate::events::RecordingListener;
    use crate::store::SessionPhase;
    use crate::subscription::ConnectionStatus;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn runtime() -> (Arc<MemoryBackend>, ChatRuntime) {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(json!({
            "resourceType": "Communication",
            "id": "T",
            "status": "in-progress",
            "subject": { "reference": "Patient/p1" },
            "sent": "2024-01-01T10:00:00Z"
        }));
        let runtime = ChatRuntime::new(
            backend.clone(),
            Arc::new(RecordingListener::new()),
            &CoreConfig::default(),
        );
        (backend, runtime)
    }

    #[tokio::test]
    async fn test_set_profile_loads_and_subscribes() {
        let (backend, runtime) = runtime();
        runtime.set_profile(Some(Profile::patient("p1"))).await;

        assert_eq!(runtime.store().phase(), SessionPhase::Ready);
        assert_eq!(runtime.store().threads().len(), 1);
        assert_eq!(
            backend.subscription_criteria(),
            vec!["Communication?part-of:missing=true&subject=Patient/p1"]
        );
    }

    #[tokio::test]
    async fn test_profile_switch_replaces_subscription() {
        let (backend, runtime) = runtime();
        runtime.set_profile(Some(Profile::patient("p1"))).await;
        runtime.set_profile(Some(Profile::practitioner("dr"))).await;

        assert_eq!(
            backend.subscription_criteria(),
            vec!["Communication?part-of:missing=true"]
        );
        assert_eq!(runtime.store().threads().len(), 1);

        runtime.shutdown().await;
        assert!(backend.subscription_criteria().is_empty());
        assert_eq!(runtime.store().phase(), SessionPhase::NoProfile);
        assert_eq!(
            runtime.coordinator().connection_state().status,
            ConnectionStatus::Disconnected
        );
    }

    /// Serves every query but refuses live subscriptions
    struct NoFeedBackend {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl FhirBackend for NoFeedBackend {
        async fn search(&self, resource_type: &str, params: &SearchParams) -> Result<Bundle, BackendError> {
            self.inner.search(resource_type, params).await
        }

        async fn create(&self, resource: Value) -> Result<Value, BackendError> {
            self.inner.create(resource).await
        }

        async fn update(&self, resource: Value) -> Result<Value, BackendError> {
            self.inner.update(resource).await
        }

        async fn patch(&self, resource_type: &str, id: &str, patch: Patch) -> Result<Value, BackendError> {
            self.inner.patch(resource_type, id, patch).await
        }

        async fn read(&self, resource_type: &str, id: &str) -> Result<Value, BackendError> {
            self.inner.read(resource_type, id).await
        }

        async fn subscribe(&self, _criteria: &str) -> Result<SubscriptionStream, BackendError> {
            Err(BackendError::Websocket("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_still_loads_threads() {
        let inner = MemoryBackend::new();
        inner.insert(json!({
            "resourceType": "Communication",
            "id": "T",
            "status": "in-progress",
            "subject": { "reference": "Patient/p1" },
            "sent": "2024-01-01T10:00:00Z"
        }));
        let listener = Arc::new(RecordingListener::new());
        let runtime = ChatRuntime::new(
            Arc::new(NoFeedBackend { inner }),
            listener.clone(),
            &CoreConfig::default(),
        );

        runtime.set_profile(Some(Profile::patient("p1"))).await;

        assert_eq!(runtime.store().phase(), SessionPhase::Ready);
        assert!(!runtime.store().is_loading());
        assert_eq!(runtime.store().threads().len(), 1);
        assert_eq!(
            runtime.coordinator().connection_state().status,
            ConnectionStatus::Disconnected
        );
        let errors = listener.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("down"));

        runtime.shutdown().await;
        assert_eq!(runtime.store().phase(), SessionPhase::NoProfile);
    }

    #[tokio::test]
    async fn test_panicked_subscription_task_is_joined() {
        let (_backend, runtime) = runtime();
        runtime.set_profile(Some(Profile::patient("p1"))).await;
        *runtime.subscription_task.lock() = Some(tokio::spawn(async { panic!("feed crashed") }));

        runtime.shutdown().await;
        assert!(runtime.subscription_task.lock().is_none());
        assert_eq!(runtime.store().phase(), SessionPhase::NoProfile);
    }

    #[tokio::test]
    async fn test_load_profile_skips_subscription() {
        let (backend, runtime) = runtime();
        runtime.load_profile(Profile::practitioner("dr")).await;

        assert_eq!(runtime.store().threads().len(), 1);
        assert!(backend.subscription_criteria().is_empty());
    }

    #[tokio::test]
    async fn test_avatar_uses_injected_cache() {
        let (backend, runtime) = runtime();
        backend.insert(json!({ "resourceType": "Patient", "id": "p1", "photo": [{ "url": "https://img/p1" }] }));
        let shared = Arc::new(AvatarCache::new());
        let runtime = runtime.with_avatar_cache(shared.clone());

        let url = runtime.avatar(&Reference::new("Patient/p1")).await;
        assert_eq!(url.as_deref(), Some("https://img/p1"));
        assert_eq!(shared.get("Patient/p1"), Some(Some("https://img/p1".to_string())));
    }
}

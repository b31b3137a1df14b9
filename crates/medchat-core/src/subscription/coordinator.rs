use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectionState, ConnectionStatus};
use crate::backend::search::thread_filter;
use crate::backend::{Bundle, FhirBackend, SubscriptionEvent, SubscriptionStream};
use crate::constants::resource_types;
use crate::error::ChatError;
use crate::events::SharedListener;
use crate::models::{Communication, Profile};
use crate::store::ThreadStore;

/// Routes subscription events into the [`ThreadStore`] and tracks the
/// connection lifecycle.
///
/// The feed only carries thread roots. A notification is a trigger to
/// re-pull that thread's messages, and a `Connect` following a socket close
/// triggers one full thread refresh.
#[derive(Clone)]
pub struct SubscriptionCoordinator {
    backend: Arc<dyn FhirBackend>,
    store: ThreadStore,
    listener: SharedListener,
    state: Arc<Mutex<ConnectionState>>,
}

impl SubscriptionCoordinator {
    pub fn new(backend: Arc<dyn FhirBackend>, store: ThreadStore, listener: SharedListener) -> Self {
        Self {
            backend,
            store,
            listener,
            state: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    /// Subscription criteria for `profile`: the thread-root filter without
    /// sort, count or include directives.
    pub fn criteria(profile: &Profile) -> String {
        thread_filter(profile).to_criteria(resource_types::COMMUNICATION)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Subscribe for `profile` and spawn the event loop. The loop ends when
    /// `cancel_rx` flips to true or its sender goes away.
    pub async fn start(
        &self,
        profile: &Profile,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ChatError> {
        *self.state.lock() = ConnectionState {
            status: ConnectionStatus::Connecting,
            ..ConnectionState::default()
        };

        let criteria = Self::criteria(profile);
        info!("Subscribing to {}", criteria);
        let stream = match self.backend.subscribe(&criteria).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state.lock().status = ConnectionStatus::Disconnected;
                return Err(e.into());
            }
        };

        let coordinator = self.clone();
        Ok(tokio::spawn(coordinator.run(stream, cancel_rx)))
    }

    async fn run(self, mut stream: SubscriptionStream, mut cancel_rx: watch::Receiver<bool>) {
        if *cancel_rx.borrow() {
            return;
        }
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        debug!("Subscription loop received cancellation signal, exiting");
                        break;
                    }
                }
                event = stream.next() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("Subscription stream ended");
                            break;
                        }
                    }
                }
            }
        }
        stream.close();
        self.state.lock().status = ConnectionStatus::Disconnected;
    }

    pub async fn handle_event(&self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Connect => {
                let resync = {
                    let mut state = self.state.lock();
                    state.status = ConnectionStatus::Connected;
                    state.connected_once = true;
                    std::mem::take(&mut state.reconnecting)
                };
                if resync {
                    info!("Subscription reconnected, refreshing threads");
                    self.store.refresh_threads().await;
                }
                self.listener.on_subscription_connect();
            }
            SubscriptionEvent::SocketClose => {
                {
                    let mut state = self.state.lock();
                    state.reconnecting = true;
                    state.status = ConnectionStatus::Disconnected;
                }
                info!("Subscription socket closed");
                self.listener.on_websocket_close();
            }
            SubscriptionEvent::SocketOpen => {
                self.state.lock().status = ConnectionStatus::Connecting;
                self.listener.on_websocket_open();
            }
            SubscriptionEvent::Message(bundle) => self.handle_notification(bundle).await,
            SubscriptionEvent::Error(message) => {
                warn!("Subscription error: {}", message);
                self.listener.on_error(&ChatError::Subscription(message));
            }
        }
    }

    async fn handle_notification(&self, bundle: Bundle) {
        let Some(focus) = bundle.focus_resource() else {
            self.listener.on_error(&ChatError::InvalidResource(
                "notification bundle without a changed resource".to_string(),
            ));
            return;
        };
        let changed = match Communication::from_value(focus.clone()) {
            Ok(changed) => changed,
            Err(e) => {
                self.listener.on_error(&e.into());
                return;
            }
        };

        let thread_id = if changed.is_thread_root() {
            let id = changed.id().map(String::from);
            self.store.merge_thread(changed);
            id
        } else {
            changed.thread_id().map(String::from)
        };

        match thread_id {
            Some(thread_id) => {
                debug!("Notification for thread {}", thread_id);
                self.store.receive_thread(&thread_id).await;
            }
            None => debug!("Ignoring notification without a thread id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::WriteRecord;
    use crate::backend::{MemoryBackend, SearchFilter};
    use crate::events::{ChannelListener, CoreEvent, RecordingListener};
    use serde_json::json;
    use std::time::Duration;

    fn setup(profile: Profile) -> (Arc<MemoryBackend>, ThreadStore, SubscriptionCoordinator, Arc<RecordingListener>) {
        let backend = Arc::new(MemoryBackend::new());
        let listener = Arc::new(RecordingListener::new());
        let store = ThreadStore::new(backend.clone(), listener.clone(), 50);
        store.set_profile(Some(profile));
        let coordinator = SubscriptionCoordinator::new(backend.clone(), store.clone(), listener.clone());
        (backend, store, coordinator, listener)
    }

    fn seed_thread(backend: &MemoryBackend) {
        backend.insert(json!({
            "resourceType": "Communication",
            "id": "T",
            "status": "in-progress",
            "subject": { "reference": "Patient/p1" },
            "sent": "2024-01-01T10:00:00Z"
        }));
        backend.insert(json!({
            "resourceType": "Communication",
            "id": "m1",
            "status": "in-progress",
            "partOf": [{ "reference": "Communication/T" }],
            "sender": { "reference": "Practitioner/dr" },
            "payload": [{ "contentString": "Results are in" }],
            "sent": "2024-01-01T10:05:00Z"
        }));
    }

    #[test]
    fn test_criteria_per_role() {
        assert_eq!(
            SubscriptionCoordinator::criteria(&Profile::patient("p1")),
            "Communication?part-of:missing=true&subject=Patient/p1"
        );
        assert_eq!(
            SubscriptionCoordinator::criteria(&Profile::practitioner("dr")),
            "Communication?part-of:missing=true"
        );
    }

    #[tokio::test]
    async fn test_reconnect_triggers_one_refresh() {
        let (backend, _store, coordinator, listener) = setup(Profile::patient("p1"));

        coordinator.handle_event(SubscriptionEvent::Connect).await;
        assert!(coordinator.connection_state().connected_once);
        assert!(backend.searches().is_empty(), "first connect does not resync");

        let mut observed = vec![coordinator.connection_state().reconnecting];
        for event in [
            SubscriptionEvent::SocketClose,
            SubscriptionEvent::SocketOpen,
            SubscriptionEvent::Connect,
        ] {
            coordinator.handle_event(event).await;
            observed.push(coordinator.connection_state().reconnecting);
        }

        assert_eq!(observed, vec![false, true, true, false]);
        assert_eq!(backend.searches().len(), 1);
        let state = coordinator.connection_state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert!(state.connected_once);
        assert_eq!(
            listener.events(),
            vec![
                CoreEvent::SubscriptionConnect,
                CoreEvent::WebsocketClose,
                CoreEvent::WebsocketOpen,
                CoreEvent::SubscriptionConnect,
            ]
        );
    }

    #[tokio::test]
    async fn test_notification_pulls_thread_messages() {
        let (backend, store, coordinator, _listener) = setup(Profile::patient("p1"));
        seed_thread(&backend);
        let root = backend.get("Communication", "T").unwrap();
        let status = json!({ "resourceType": "SubscriptionStatus", "type": "event-notification" });

        coordinator
            .handle_event(SubscriptionEvent::Message(Bundle::notification(status, root)))
            .await;

        assert_eq!(store.threads().len(), 1);
        let messages = store.messages("T");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].received.is_some(), "incoming message stamped on push");
        let writes = backend.writes();
        assert_eq!(writes.len(), 1);
        assert!(matches!(&writes[0], WriteRecord::Patch { id, .. } if id == "m1"));
        assert!(backend.get("Communication", "m1").unwrap()["received"].is_string());
        let searches = backend.searches();
        assert_eq!(searches.len(), 1);
        assert!(searches[0].1.filters.contains(&SearchFilter::ReferenceEquals {
            param: "part-of".to_string(),
            reference: "Communication/T".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_errors_are_forwarded_without_state_change() {
        let (_backend, _store, coordinator, listener) = setup(Profile::patient("p1"));
        coordinator.handle_event(SubscriptionEvent::Connect).await;
        let before = coordinator.connection_state();

        coordinator
            .handle_event(SubscriptionEvent::Error("binding token expired".to_string()))
            .await;
        coordinator
            .handle_event(SubscriptionEvent::Message(Bundle::default()))
            .await;

        assert_eq!(coordinator.connection_state(), before);
        let errors = listener.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("binding token expired"));
    }

    #[tokio::test]
    async fn test_event_loop_runs_until_cancelled() {
        let backend = Arc::new(MemoryBackend::new());
        let (listener, mut events) = ChannelListener::new();
        let listener: SharedListener = Arc::new(listener);
        let store = ThreadStore::new(backend.clone(), listener.clone(), 50);
        store.set_profile(Some(Profile::patient("p1")));
        let coordinator = SubscriptionCoordinator::new(backend.clone(), store, listener);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = coordinator.start(&Profile::patient("p1"), cancel_rx).await.unwrap();
        assert_eq!(
            backend.subscription_criteria(),
            vec!["Communication?part-of:missing=true&subject=Patient/p1"]
        );

        backend.emit(SubscriptionEvent::Connect).await;
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(CoreEvent::SubscriptionConnect)));

        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coordinator.connection_state().status, ConnectionStatus::Disconnected);
        assert!(backend.subscription_criteria().is_empty());
    }
}

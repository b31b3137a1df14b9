use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::search::{thread_messages_query, thread_query};
use crate::backend::{BackendError, FhirBackend, PatchBuilder, SearchResult};
use crate::constants::resource_types;
use crate::error::ChatError;
use crate::events::SharedListener;
use crate::models::{Attachment, Communication, CommunicationStatus, Payload, Profile, Reference};
use crate::reconcile::{merge_into, MergeOutcome};
use crate::store::views::{self, ThreadView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NoProfile,
    LoadingThreads,
    Ready,
}

/// Point-in-time copy of the store, for hosts that render from plain data
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub profile: Option<Profile>,
    pub phase: SessionPhase,
    pub loading: bool,
    pub threads: Vec<Communication>,
    pub messages_by_thread: HashMap<String, Vec<Communication>>,
}

struct StoreState {
    profile: Option<Profile>,
    /// Bumped on every profile change; work started under an older
    /// generation is discarded.
    generation: u64,
    phase: SessionPhase,
    loading: bool,
    threads: Vec<Communication>,
    messages_by_thread: HashMap<String, Vec<Communication>>,
    /// In-flight `receive_thread` calls per thread id
    loading_threads: HashMap<String, usize>,
    cancel_tx: watch::Sender<bool>,
}

impl StoreState {
    fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            profile: None,
            generation: 0,
            phase: SessionPhase::NoProfile,
            loading: false,
            threads: Vec::new(),
            messages_by_thread: HashMap::new(),
            loading_threads: HashMap::new(),
            cancel_tx,
        }
    }
}

/// The profile session an operation started under
#[derive(Clone)]
struct Session {
    generation: u64,
    profile: Profile,
    cancel_rx: watch::Receiver<bool>,
}

/// Resolves once the session is cancelled (flag set or sender replaced)
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run a backend call, abandoning it if the session is cancelled first
async fn guarded<T>(
    session: &Session,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, ChatError> {
    let mut cancel_rx = session.cancel_rx.clone();
    tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => Err(ChatError::Cancelled),
        result = call => result.map_err(ChatError::from),
    }
}

fn fhir_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Threads and their messages for the active profile.
///
/// Cheap to clone; clones share state. The lock is only taken for
/// synchronous read-modify-write sections and listener callbacks always run
/// after it is released.
#[derive(Clone)]
pub struct ThreadStore {
    backend: Arc<dyn FhirBackend>,
    listener: SharedListener,
    page_size: u32,
    state: Arc<Mutex<StoreState>>,
}

impl ThreadStore {
    pub fn new(backend: Arc<dyn FhirBackend>, listener: SharedListener, page_size: u32) -> Self {
        Self {
            backend,
            listener,
            page_size,
            state: Arc::new(Mutex::new(StoreState::new())),
        }
    }

    /// Switch the active identity. A different identity (including none)
    /// drops all threads and messages, cancels in-flight work and starts a
    /// new session. Returns false when the identity is unchanged.
    pub fn set_profile(&self, profile: Option<Profile>) -> bool {
        let mut state = self.state.lock();
        let current = state.profile.as_ref().map(|p| p.reference.as_str());
        let next = profile.as_ref().map(|p| p.reference.as_str());
        if current == next {
            return false;
        }

        let _ = state.cancel_tx.send(true);
        let (cancel_tx, _) = watch::channel(false);
        state.cancel_tx = cancel_tx;
        state.generation += 1;
        state.threads.clear();
        state.messages_by_thread.clear();
        state.loading_threads.clear();
        state.phase = if profile.is_some() {
            SessionPhase::LoadingThreads
        } else {
            SessionPhase::NoProfile
        };
        state.loading = profile.is_some();
        debug!(
            "Profile session {} started for {:?}",
            state.generation,
            next.unwrap_or("<none>")
        );
        state.profile = profile;
        true
    }

    fn session(&self) -> Option<Session> {
        let state = self.state.lock();
        let profile = state.profile.clone()?;
        Some(Session {
            generation: state.generation,
            profile,
            cancel_rx: state.cancel_tx.subscribe(),
        })
    }

    /// Cancellation signal of the current session; flips (or closes) on the
    /// next profile change.
    pub fn session_cancellation(&self) -> watch::Receiver<bool> {
        self.state.lock().cancel_tx.subscribe()
    }

    pub(crate) fn report(&self, error: ChatError) {
        if matches!(error, ChatError::Cancelled) {
            debug!("Dropped result of a cancelled session");
            return;
        }
        warn!("{}", error);
        self.listener.on_error(&error);
    }

    /// Load thread roots and their messages in one query, replacing the
    /// current collections. On failure the previous collections stay.
    pub async fn refresh_threads(&self) {
        let Some(session) = self.session() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.generation != session.generation {
                return;
            }
            state.loading = true;
        }

        let params = thread_query(&session.profile, self.page_size);
        let result = guarded(
            &session,
            self.backend.search(resource_types::COMMUNICATION, &params),
        )
        .await
        .and_then(|bundle| bundle.into_communications().map_err(ChatError::from));

        let failure = {
            let mut state = self.state.lock();
            if state.generation != session.generation {
                debug!("Discarding thread refresh from session {}", session.generation);
                return;
            }
            state.loading = false;
            state.phase = SessionPhase::Ready;
            match result {
                Ok(SearchResult { matches, includes }) => {
                    let mut threads = Vec::with_capacity(matches.len());
                    for root in matches {
                        merge_into(&mut threads, root);
                    }
                    let mut messages_by_thread: HashMap<String, Vec<Communication>> = HashMap::new();
                    for message in includes {
                        let Some(thread_id) = message.thread_id().map(String::from) else {
                            continue;
                        };
                        merge_into(messages_by_thread.entry(thread_id).or_default(), message);
                    }
                    debug!(
                        "Loaded {} threads, {} with messages",
                        threads.len(),
                        messages_by_thread.len()
                    );
                    state.threads = threads;
                    state.messages_by_thread = messages_by_thread;
                    None
                }
                Err(e) => Some(e),
            }
        };

        if let Some(e) = failure {
            self.report(e);
        }
    }

    /// Re-pull every message of `thread_id`, stamp `received` on incoming
    /// messages seeing it for the first time, and merge the results.
    pub async fn receive_thread(&self, thread_id: &str) {
        let Some(session) = self.session() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.generation != session.generation {
                return;
            }
            *state.loading_threads.entry(thread_id.to_string()).or_default() += 1;
        }

        let result = self.fetch_and_mark_received(&session, thread_id).await;

        let mut received = Vec::new();
        let mut updated = Vec::new();
        let mut errors = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != session.generation {
                debug!("Discarding messages of {} from session {}", thread_id, session.generation);
                return;
            }
            if let Some(count) = state.loading_threads.get_mut(thread_id) {
                *count -= 1;
                if *count == 0 {
                    state.loading_threads.remove(thread_id);
                }
            }
            match result {
                Ok((messages, patch_errors)) => {
                    let slot = state
                        .messages_by_thread
                        .entry(thread_id.to_string())
                        .or_default();
                    for message in messages {
                        match merge_into(slot, message.clone()) {
                            MergeOutcome::Appended => received.push(message),
                            MergeOutcome::Replaced => updated.push(message),
                            MergeOutcome::Kept => {}
                        }
                    }
                    errors = patch_errors;
                }
                Err(e) => errors.push(e),
            }
        }

        for message in &received {
            self.listener.on_message_received(message);
        }
        for message in &updated {
            self.listener.on_message_updated(message);
        }
        for e in errors {
            self.report(e);
        }
    }

    async fn fetch_and_mark_received(
        &self,
        session: &Session,
        thread_id: &str,
    ) -> Result<(Vec<Communication>, Vec<ChatError>), ChatError> {
        let thread = Reference::to(resource_types::COMMUNICATION, thread_id);
        let bundle = guarded(
            session,
            self.backend
                .search(resource_types::COMMUNICATION, &thread_messages_query(&thread)),
        )
        .await?;
        let messages = bundle.into_communications()?.matches;

        let local = &session.profile.reference;
        let received_at = json!(fhir_instant(Utc::now()));
        let marks = messages.into_iter().map(|message| {
            let received_at = received_at.clone();
            async move {
                let needs_receipt = message.received.is_none() && !views::is_outgoing(&message, local);
                let Some(id) = message.id().filter(|_| needs_receipt).map(String::from) else {
                    return (message, None);
                };
                let stamp = PatchBuilder::new()
                    .expect_version(message.version_id())
                    .add("/received", received_at);
                let patched = match self.patch_communication(session, &id, stamp).await {
                    // stamped elsewhere since the query; the server copy wins
                    Err(ChatError::Backend(BackendError::Conflict(_))) => {
                        self.read_communication(session, &id).await
                    }
                    other => other,
                };
                match patched {
                    Ok(marked) => (marked, None),
                    // keep the unmarked copy so the message still shows
                    Err(e) => (message, Some(e)),
                }
            }
        });

        let mut merged = Vec::new();
        let mut errors = Vec::new();
        for (message, error) in join_all(marks).await {
            merged.push(message);
            errors.extend(error);
        }
        Ok((merged, errors))
    }

    /// Create a thread root owned by the active Patient. Only Patient
    /// profiles may create threads; a blank topic is a silent no-op.
    pub async fn create_thread(&self, topic: &str) -> Result<Option<String>, ChatError> {
        let session = self.session().ok_or(ChatError::NoProfile)?;
        if !session.profile.is_patient() {
            return Err(ChatError::NotPermitted {
                kind: session.profile.kind(),
                action: "create threads",
            });
        }
        let topic = topic.trim();
        if topic.is_empty() {
            return Ok(None);
        }

        let root = Communication::thread_root(session.profile.reference.clone(), topic, Utc::now());
        match self.create_communication(&session, &root).await {
            Ok(created) => {
                let id = created.id().map(String::from);
                self.merge_into_threads(&session, created);
                Ok(id)
            }
            Err(e) => {
                self.report(e);
                Ok(None)
            }
        }
    }

    pub async fn send_message(&self, thread_id: &str, text: &str) -> Result<Option<String>, ChatError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.send_payload(thread_id, vec![Payload::text(text)]).await
    }

    /// Send a message carrying an attachment reference and an optional
    /// caption. The attachment must already be hosted (`url` set).
    pub async fn send_attachment(
        &self,
        thread_id: &str,
        attachment: Attachment,
        caption: Option<&str>,
    ) -> Result<Option<String>, ChatError> {
        if attachment.url.as_deref().map_or(true, |url| url.trim().is_empty()) {
            return Ok(None);
        }
        let mut payload = vec![Payload::attachment(attachment)];
        if let Some(caption) = caption.filter(|c| !c.trim().is_empty()) {
            payload.push(Payload::text(caption));
        }
        self.send_payload(thread_id, payload).await
    }

    /// Create the message, merge it, then touch its thread.
    ///
    /// Every send must touch the parent thread root. Subscribers only watch
    /// thread roots, so the touch is what makes the new message visible to
    /// the other party in real time.
    async fn send_payload(&self, thread_id: &str, payload: Vec<Payload>) -> Result<Option<String>, ChatError> {
        let session = self.session().ok_or(ChatError::NoProfile)?;
        let now = Utc::now();

        let mut message = Communication::message(thread_id, session.profile.reference.clone(), Payload::default(), now);
        message.payload = payload;
        message.status = CommunicationStatus::InProgress;
        message.subject = self.thread(thread_id).and_then(|root| root.subject);

        let created = match self.create_communication(&session, &message).await {
            Ok(created) => created,
            Err(e) => {
                self.report(e);
                return Ok(None);
            }
        };
        let id = created.id().map(String::from);
        self.merge_into_messages(&session, thread_id, created);

        if let Err(e) = self.touch_thread(&session, thread_id, now).await {
            self.report(e);
        }
        Ok(id)
    }

    /// Refresh the thread's last-activity marker so the change reaches
    /// thread-level subscriptions, then merge the touched root.
    ///
    /// The extension array is rebuilt from the server's root, never from
    /// nothing, and the write is guarded by the root's version so other
    /// extensions survive.
    async fn touch_thread(&self, session: &Session, thread_id: &str, at: DateTime<Utc>) -> Result<(), ChatError> {
        let mut root = match self.thread(thread_id) {
            Some(root) => root,
            None => self.read_communication(session, thread_id).await?,
        };
        let mut reloaded = false;
        let touched = loop {
            root.set_last_activity_at(at);
            let touch = PatchBuilder::new()
                .expect_version(root.version_id())
                .add("/extension", serde_json::to_value(&root.extension)?);
            match self.patch_communication(session, thread_id, touch).await {
                Err(ChatError::Backend(BackendError::Conflict(_))) if !reloaded => {
                    debug!("Thread {} changed remotely, reloading before touch", thread_id);
                    reloaded = true;
                    root = self.read_communication(session, thread_id).await?;
                }
                result => break result?,
            }
        };
        self.merge_into_threads(session, touched);
        Ok(())
    }

    /// Flip an incoming unread message to read. Returns whether a write
    /// happened.
    pub async fn mark_message_as_read(&self, thread_id: &str, message_id: &str) -> Result<bool, ChatError> {
        let session = self.session().ok_or(ChatError::NoProfile)?;
        let Some(message) = self.message(thread_id, message_id) else {
            return Ok(false);
        };
        if message.is_read() || views::is_outgoing(&message, &session.profile.reference) {
            return Ok(false);
        }

        let read = PatchBuilder::new().replace("/status", json!(CommunicationStatus::Completed.as_code()));
        let patched = self.patch_communication(&session, message_id, read).await;

        match patched {
            Ok(updated) => {
                if self.merge_into_messages(&session, thread_id, updated.clone()) == Some(MergeOutcome::Replaced) {
                    self.listener.on_message_updated(&updated);
                }
                Ok(true)
            }
            Err(e) => {
                self.report(e);
                Ok(false)
            }
        }
    }

    /// Merge a thread root delivered by the live feed
    pub fn merge_thread(&self, root: Communication) -> Option<MergeOutcome> {
        let session = self.session()?;
        self.merge_into_threads(&session, root)
    }

    fn merge_into_threads(&self, session: &Session, root: Communication) -> Option<MergeOutcome> {
        let mut state = self.state.lock();
        if state.generation != session.generation {
            return None;
        }
        Some(merge_into(&mut state.threads, root))
    }

    fn merge_into_messages(&self, session: &Session, thread_id: &str, message: Communication) -> Option<MergeOutcome> {
        let mut state = self.state.lock();
        if state.generation != session.generation {
            return None;
        }
        let slot = state
            .messages_by_thread
            .entry(thread_id.to_string())
            .or_default();
        Some(merge_into(slot, message))
    }

    async fn create_communication(&self, session: &Session, resource: &Communication) -> Result<Communication, ChatError> {
        let created = guarded(session, self.backend.create(resource.to_value()?)).await?;
        Ok(Communication::from_value(created)?)
    }

    async fn patch_communication(&self, session: &Session, id: &str, patch: PatchBuilder) -> Result<Communication, ChatError> {
        let patched = guarded(
            session,
            self.backend.patch(resource_types::COMMUNICATION, id, patch.build()?),
        )
        .await?;
        Ok(Communication::from_value(patched)?)
    }

    async fn read_communication(&self, session: &Session, id: &str) -> Result<Communication, ChatError> {
        let resource = guarded(session, self.backend.read(resource_types::COMMUNICATION, id)).await?;
        Ok(Communication::from_value(resource)?)
    }

    pub fn profile(&self) -> Option<Profile> {
        self.state.lock().profile.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    pub fn is_thread_loading(&self, thread_id: &str) -> bool {
        self.state.lock().loading_threads.contains_key(thread_id)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            profile: state.profile.clone(),
            phase: state.phase,
            loading: state.loading,
            threads: state.threads.clone(),
            messages_by_thread: state.messages_by_thread.clone(),
        }
    }

    pub fn threads(&self) -> Vec<Communication> {
        self.state.lock().threads.clone()
    }

    pub fn thread(&self, thread_id: &str) -> Option<Communication> {
        self.state
            .lock()
            .threads
            .iter()
            .find(|t| t.id() == Some(thread_id))
            .cloned()
    }

    pub fn messages(&self, thread_id: &str) -> Vec<Communication> {
        self.state
            .lock()
            .messages_by_thread
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    fn message(&self, thread_id: &str, message_id: &str) -> Option<Communication> {
        self.state
            .lock()
            .messages_by_thread
            .get(thread_id)?
            .iter()
            .find(|m| m.id() == Some(message_id))
            .cloned()
    }

    /// Thread views for the active profile, most recently active first
    pub fn thread_views(&self) -> Vec<ThreadView> {
        let state = self.state.lock();
        let Some(profile) = &state.profile else {
            return Vec::new();
        };
        views::thread_views(&state.threads, &state.messages_by_thread, &profile.reference)
    }

    pub fn thread_view(&self, thread_id: &str) -> Option<ThreadView> {
        let state = self.state.lock();
        let profile = state.profile.as_ref()?;
        let root = state.threads.iter().find(|t| t.id() == Some(thread_id))?;
        let messages = state
            .messages_by_thread
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Some(views::thread_view(root, messages, &profile.reference))
    }

    /// Unread incoming messages across all threads
    pub fn unread_total(&self) -> usize {
        self.thread_views().iter().map(|v| v.unread_count).sum()
    }
}

//! In-process FHIR store implementing [`FhirBackend`].
//!
//! Supports the search shapes the chat core issues against `Communication`
//! (reference equality, `:missing`, `_sort`, `_count`, `_revinclude`),
//! records every write for inspection, and lets callers inject failures and
//! push subscription events by hand.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use json_patch::PatchErrorKind;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::bundle::{Bundle, BundleEntry, EntrySearch, SearchMode};
use super::search::{SearchFilter, SearchParams};
use super::{id_of, resource_type_of, BackendError, FhirBackend, Patch, SubscriptionEvent, SubscriptionStream};

/// A write the backend accepted (or rejected through failure injection)
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Create {
        resource_type: String,
        resource: Value,
    },
    Update {
        resource_type: String,
        id: String,
    },
    Patch {
        resource_type: String,
        id: String,
        patch: Patch,
    },
}

#[derive(Default)]
struct MemoryState {
    resources: Vec<Value>,
    last_timestamp: Option<DateTime<Utc>>,
    version: u64,
    writes: Vec<WriteRecord>,
    searches: Vec<(String, SearchParams)>,
    reads: Vec<String>,
    subscriptions: Vec<(String, mpsc::Sender<SubscriptionEvent>)>,
    fail_searches: bool,
    fail_creates: bool,
    fail_patch_ids: HashSet<String>,
}

impl MemoryState {
    /// Strictly increasing `lastUpdated`, so back-to-back writes always
    /// produce a newer revision.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(next);
        next
    }

    fn stamp(&mut self, resource: &mut Value) {
        self.version += 1;
        let last_updated = self
            .next_timestamp()
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Some(obj) = resource.as_object_mut() {
            obj.insert(
                "meta".to_string(),
                json!({ "versionId": self.version.to_string(), "lastUpdated": last_updated }),
            );
        }
    }

    fn position(&self, resource_type: &str, id: &str) -> Option<usize> {
        self.resources.iter().position(|r| {
            r.get("resourceType").and_then(Value::as_str) == Some(resource_type)
                && r.get("id").and_then(Value::as_str) == Some(id)
        })
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a resource without recording a write. Assigns an id when
    /// missing and stamps `meta`.
    pub fn insert(&self, mut resource: Value) -> Value {
        let mut state = self.state.lock();
        if id_of(&resource).is_none() {
            if let Some(obj) = resource.as_object_mut() {
                obj.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
            }
        }
        state.stamp(&mut resource);
        state.resources.push(resource.clone());
        resource
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<Value> {
        let state = self.state.lock();
        state
            .position(resource_type, id)
            .map(|i| state.resources[i].clone())
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Every search issued so far, in order
    pub fn searches(&self) -> Vec<(String, SearchParams)> {
        self.state.lock().searches.clone()
    }

    /// References of every `read` issued so far
    pub fn reads(&self) -> Vec<String> {
        self.state.lock().reads.clone()
    }

    pub fn subscription_criteria(&self) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(criteria, _)| criteria.clone())
            .collect()
    }

    pub fn set_fail_searches(&self, fail: bool) {
        self.state.lock().fail_searches = fail;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    /// Make every patch of resource `id` fail
    pub fn fail_patches_for(&self, id: &str) {
        self.state.lock().fail_patch_ids.insert(id.to_string());
    }

    /// Deliver `event` to every open subscription
    pub async fn emit(&self, event: SubscriptionEvent) {
        let senders: Vec<_> = {
            let mut state = self.state.lock();
            state.subscriptions.retain(|(_, tx)| !tx.is_closed());
            state.subscriptions.iter().map(|(_, tx)| tx.clone()).collect()
        };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Emit a notification bundle carrying the stored copy of a resource
    pub async fn notify(&self, resource_type: &str, id: &str) {
        let Some(resource) = self.get(resource_type, id) else {
            return;
        };
        let status = json!({ "resourceType": "SubscriptionStatus", "type": "event-notification" });
        self.emit(SubscriptionEvent::Message(Bundle::notification(status, resource)))
            .await;
    }
}

fn field_references(resource: &Value, param: &str) -> Vec<String> {
    let field = match param {
        "part-of" => "partOf",
        other => other,
    };
    match resource.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|r| r.get("reference").and_then(Value::as_str))
            .map(String::from)
            .collect(),
        Some(Value::Object(_)) => resource[field]
            .get("reference")
            .and_then(Value::as_str)
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn field_is_missing(resource: &Value, param: &str) -> bool {
    let field = match param {
        "part-of" => "partOf",
        other => other,
    };
    match resource.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn matches_filters(resource: &Value, filters: &[SearchFilter]) -> bool {
    filters.iter().all(|filter| match filter {
        SearchFilter::ReferenceEquals { param, reference } => field_references(resource, param)
            .iter()
            .any(|r| r == reference),
        SearchFilter::Missing { param, missing } => field_is_missing(resource, param) == *missing,
    })
}

fn sort_key(resource: &Value, param: &str) -> Option<DateTime<Utc>> {
    resource
        .get(param)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl FhirBackend for MemoryBackend {
    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
    ) -> Result<Bundle, BackendError> {
        let mut state = self.state.lock();
        state
            .searches
            .push((resource_type.to_string(), params.clone()));
        if state.fail_searches {
            return Err(BackendError::Status {
                status: 503,
                body: "search unavailable".to_string(),
            });
        }

        let mut matches: Vec<Value> = state
            .resources
            .iter()
            .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some(resource_type))
            .filter(|r| matches_filters(r, &params.filters))
            .cloned()
            .collect();

        if let Some(sort) = &params.sort {
            // stable sort keeps insertion order for equal keys
            matches.sort_by(|a, b| {
                let ordering = sort_key(a, &sort.param).cmp(&sort_key(b, &sort.param));
                if sort.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(count) = params.count {
            matches.truncate(count as usize);
        }

        let mut includes = Vec::new();
        for target in &params.revinclude {
            let Some((source_type, param)) = target.split_once(':') else {
                continue;
            };
            for matched in &matches {
                let Some(id) = id_of(matched) else {
                    continue;
                };
                let reference = format!("{}/{}", resource_type, id);
                includes.extend(
                    state
                        .resources
                        .iter()
                        .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some(source_type))
                        .filter(|r| field_references(r, param).contains(&reference))
                        .cloned(),
                );
            }
        }

        let entry = matches
            .into_iter()
            .map(|r| (r, SearchMode::Match))
            .chain(includes.into_iter().map(|r| (r, SearchMode::Include)))
            .map(|(resource, mode)| BundleEntry {
                full_url: None,
                resource: Some(resource),
                search: Some(EntrySearch { mode }),
            })
            .collect();
        Ok(Bundle::searchset(entry))
    }

    async fn create(&self, mut resource: Value) -> Result<Value, BackendError> {
        let resource_type = resource_type_of(&resource)?;
        let mut state = self.state.lock();
        state.writes.push(WriteRecord::Create {
            resource_type,
            resource: resource.clone(),
        });
        if state.fail_creates {
            return Err(BackendError::Status {
                status: 500,
                body: "create failed".to_string(),
            });
        }
        if let Some(obj) = resource.as_object_mut() {
            obj.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        state.stamp(&mut resource);
        state.resources.push(resource.clone());
        Ok(resource)
    }

    async fn update(&self, mut resource: Value) -> Result<Value, BackendError> {
        let resource_type = resource_type_of(&resource)?;
        let id = id_of(&resource)
            .ok_or_else(|| BackendError::InvalidResource("update requires an id".to_string()))?;
        let mut state = self.state.lock();
        state.writes.push(WriteRecord::Update {
            resource_type: resource_type.clone(),
            id: id.clone(),
        });
        let index = state
            .position(&resource_type, &id)
            .ok_or_else(|| BackendError::NotFound(format!("{}/{}", resource_type, id)))?;
        state.stamp(&mut resource);
        state.resources[index] = resource.clone();
        Ok(resource)
    }

    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: Patch,
    ) -> Result<Value, BackendError> {
        let mut state = self.state.lock();
        state.writes.push(WriteRecord::Patch {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            patch: patch.clone(),
        });
        if state.fail_patch_ids.contains(id) {
            return Err(BackendError::Status {
                status: 500,
                body: format!("patch rejected for {}", id),
            });
        }
        let index = state
            .position(resource_type, id)
            .ok_or_else(|| BackendError::NotFound(format!("{}/{}", resource_type, id)))?;

        let mut patched = state.resources[index].clone();
        json_patch::patch(&mut patched, &patch).map_err(|e| match e.kind {
            PatchErrorKind::TestFailed => BackendError::Conflict(e.to_string()),
            _ => BackendError::InvalidResource(e.to_string()),
        })?;
        state.stamp(&mut patched);
        state.resources[index] = patched.clone();
        Ok(patched)
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<Value, BackendError> {
        self.state
            .lock()
            .reads
            .push(format!("{}/{}", resource_type, id));
        self.get(resource_type, id)
            .ok_or_else(|| BackendError::NotFound(format!("{}/{}", resource_type, id)))
    }

    async fn subscribe(&self, criteria: &str) -> Result<SubscriptionStream, BackendError> {
        let (stream, event_tx, _cancel_rx) = SubscriptionStream::channel(64);
        self.state
            .lock()
            .subscriptions
            .push((criteria.to_string(), event_tx));
        Ok(stream)
    }
}

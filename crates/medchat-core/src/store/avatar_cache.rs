use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::FhirBackend;
use crate::models::Reference;

/// Avatar URLs by identity reference (`Patient/1`, `Practitioner/2`).
///
/// Shared as `Arc<AvatarCache>` for the life of the process. Entries are
/// write-once: the first stored value, including "no avatar", is kept and
/// nothing is ever invalidated. Failed fetches are not cached.
#[derive(Debug, Default)]
pub struct AvatarCache {
    entries: RwLock<HashMap<String, Option<String>>>,
}

impl AvatarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the reference was never resolved, `Some(None)` when it
    /// resolved to a resource without a photo.
    pub fn get(&self, reference: &str) -> Option<Option<String>> {
        self.entries.read().get(reference).cloned()
    }

    /// Store `url` unless the reference already has an entry. Returns
    /// whether this call stored the value.
    pub fn insert(&self, reference: &str, url: Option<String>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(reference) {
            return false;
        }
        entries.insert(reference.to_string(), url);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Cached avatar for `reference`, reading the Patient/Practitioner
    /// resource on first use.
    pub async fn get_or_fetch(&self, backend: &dyn FhirBackend, reference: &Reference) -> Option<String> {
        let key = reference.as_str();
        if let Some(cached) = self.get(key) {
            return cached;
        }
        let (Some(resource_type), Some(id)) = (reference.resource_type(), reference.id()) else {
            self.insert(key, None);
            return None;
        };

        match backend.read(resource_type, id).await {
            Ok(resource) => {
                let url = photo_url(&resource);
                debug!("Resolved avatar for {}: {:?}", key, url);
                self.insert(key, url);
                self.get(key).flatten()
            }
            Err(e) => {
                warn!("Failed to fetch avatar for {}: {}", key, e);
                None
            }
        }
    }
}

/// `photo[0].url` of a Patient or Practitioner
pub fn photo_url(resource: &Value) -> Option<String> {
    resource
        .get("photo")?
        .get(0)?
        .get("url")?
        .as_str()
        .map(String::from)
}

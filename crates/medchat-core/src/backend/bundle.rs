use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::Communication;

/// `Bundle.entry.search.mode`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Match,
    Include,
    Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntrySearch {
    #[serde(default)]
    pub mode: SearchMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<EntrySearch>,
}

impl BundleEntry {
    pub fn search_mode(&self) -> SearchMode {
        self.search.as_ref().map(|s| s.mode).unwrap_or_default()
    }
}

/// FHIR `Bundle`, used both for search results and subscription notifications
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub bundle_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<BundleEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Bundle {
    pub fn searchset(entry: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: Some("Bundle".to_string()),
            bundle_type: Some("searchset".to_string()),
            entry,
            extra: Map::new(),
        }
    }

    /// Subscription notification: entry[0] is the status, entry[1] the
    /// changed resource.
    pub fn notification(status: Value, focus: Value) -> Self {
        Self {
            resource_type: Some("Bundle".to_string()),
            bundle_type: Some("history".to_string()),
            entry: vec![
                BundleEntry {
                    resource: Some(status),
                    ..Default::default()
                },
                BundleEntry {
                    resource: Some(focus),
                    ..Default::default()
                },
            ],
            extra: Map::new(),
        }
    }

    /// `SubscriptionStatus.type` of a notification bundle
    /// (`handshake`, `heartbeat`, `event-notification`, ...)
    pub fn notification_type(&self) -> Option<&str> {
        let status = self.entry.first()?.resource.as_ref()?;
        if status.get("resourceType").and_then(Value::as_str) != Some("SubscriptionStatus") {
            return None;
        }
        status.get("type").and_then(Value::as_str)
    }

    /// The changed resource carried by a notification bundle
    pub fn focus_resource(&self) -> Option<&Value> {
        self.entry.get(1)?.resource.as_ref()
    }
}

/// Typed split of a search result into direct matches and included resources
#[derive(Debug, Clone, Default)]
pub struct SearchResult<R> {
    pub matches: Vec<R>,
    pub includes: Vec<R>,
}

impl Bundle {
    /// Partition entries by search mode and decode them as `Communication`.
    /// Outcome entries and entries of other resource types are skipped.
    pub fn into_communications(self) -> Result<SearchResult<Communication>, serde_json::Error> {
        let mut result = SearchResult::default();
        for entry in self.entry {
            let mode = entry.search_mode();
            let Some(resource) = entry.resource else {
                continue;
            };
            if resource.get("resourceType").and_then(Value::as_str) != Some("Communication") {
                continue;
            }
            let communication = Communication::from_value(resource)?;
            match mode {
                SearchMode::Match => result.matches.push(communication),
                SearchMode::Include => result.includes.push(communication),
                SearchMode::Outcome => {}
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_by_search_mode() {
        let bundle: Bundle = serde_json::from_value(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [
                { "resource": { "resourceType": "Communication", "id": "t1" }, "search": { "mode": "match" } },
                { "resource": { "resourceType": "Communication", "id": "m1", "partOf": [{ "reference": "Communication/t1" }] }, "search": { "mode": "include" } },
                { "resource": { "resourceType": "OperationOutcome" }, "search": { "mode": "outcome" } },
                { "resource": { "resourceType": "Communication", "id": "t2" } }
            ]
        }))
        .unwrap();

        let result = bundle.into_communications().unwrap();
        let match_ids: Vec<_> = result.matches.iter().filter_map(|c| c.id()).collect();
        let include_ids: Vec<_> = result.includes.iter().filter_map(|c| c.id()).collect();
        assert_eq!(match_ids, vec!["t1", "t2"], "missing mode defaults to match");
        assert_eq!(include_ids, vec!["m1"]);
    }

    #[test]
    fn test_notification_accessors() {
        let bundle = Bundle::notification(
            json!({ "resourceType": "SubscriptionStatus", "type": "event-notification" }),
            json!({ "resourceType": "Communication", "id": "t1" }),
        );
        assert_eq!(bundle.notification_type(), Some("event-notification"));
        assert_eq!(bundle.focus_resource().unwrap()["id"], "t1");

        let empty = Bundle::default();
        assert_eq!(empty.notification_type(), None);
        assert!(empty.focus_resource().is_none());
    }
}

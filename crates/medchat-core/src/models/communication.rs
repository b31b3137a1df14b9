use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::reference::Reference;
use crate::constants::{resource_types, LAST_ACTIVITY_EXTENSION_URL};

fn communication_resource_type() -> String {
    resource_types::COMMUNICATION.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// FHIR `Communication.status`. Only `InProgress` (not read) and `Completed`
/// (read) are written by this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommunicationStatus {
    Preparation,
    #[default]
    InProgress,
    NotDone,
    OnHold,
    Stopped,
    Completed,
    EnteredInError,
    Unknown,
}

impl CommunicationStatus {
    pub fn as_code(&self) -> &'static str {
        match self {
            CommunicationStatus::Preparation => "preparation",
            CommunicationStatus::InProgress => "in-progress",
            CommunicationStatus::NotDone => "not-done",
            CommunicationStatus::OnHold => "on-hold",
            CommunicationStatus::Stopped => "stopped",
            CommunicationStatus::Completed => "completed",
            CommunicationStatus::EnteredInError => "entered-in-error",
            CommunicationStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_date_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A FHIR `Communication`. Thread roots and messages share this shape:
/// a root has no `partOf`, a message points at its root through `partOf`.
///
/// Unknown elements are kept in `extra` so a record can be written back
/// without dropping data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Communication {
    #[serde(default = "communication_resource_type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default)]
    pub status: CommunicationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_of: Vec<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<CodeableConcept>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Reference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Communication {
    fn default() -> Self {
        Self {
            resource_type: communication_resource_type(),
            id: None,
            meta: None,
            status: CommunicationStatus::InProgress,
            part_of: Vec::new(),
            subject: None,
            topic: None,
            sender: None,
            recipient: Vec::new(),
            payload: Vec::new(),
            sent: None,
            received: None,
            extension: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Communication {
    /// New thread root: no `partOf`, no sender, touched at creation time.
    pub fn thread_root(subject: Reference, topic: &str, now: DateTime<Utc>) -> Self {
        let mut root = Self {
            subject: Some(subject),
            topic: Some(CodeableConcept {
                text: Some(topic.to_string()),
                extra: Map::new(),
            }),
            sent: Some(now),
            ..Self::default()
        };
        root.set_last_activity_at(now);
        root
    }

    /// New unread message inside `thread_id`.
    pub fn message(thread_id: &str, sender: Reference, payload: Payload, now: DateTime<Utc>) -> Self {
        Self {
            part_of: vec![Reference::to(resource_types::COMMUNICATION, thread_id)],
            sender: Some(sender),
            payload: vec![payload],
            sent: Some(now),
            ..Self::default()
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta.as_ref().and_then(|m| m.last_updated)
    }

    pub fn version_id(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.version_id.as_deref())
    }

    pub fn is_thread_root(&self) -> bool {
        self.part_of.is_empty()
    }

    /// Id of the owning thread, from the first `Communication/<id>` in `partOf`
    pub fn thread_id(&self) -> Option<&str> {
        self.part_of
            .iter()
            .find(|r| r.resource_type() == Some(resource_types::COMMUNICATION))
            .and_then(|r| r.id())
    }

    pub fn is_read(&self) -> bool {
        self.status == CommunicationStatus::Completed
    }

    /// First text payload, empty when there is none
    pub fn text(&self) -> &str {
        self.payload
            .iter()
            .find_map(|p| p.content_string.as_deref())
            .unwrap_or("")
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.payload.iter().find_map(|p| p.content_attachment.as_ref())
    }

    pub fn topic_text(&self) -> Option<&str> {
        self.topic.as_ref().and_then(|t| t.text.as_deref())
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.extension
            .iter()
            .find(|e| e.url == LAST_ACTIVITY_EXTENSION_URL)
            .and_then(|e| e.value_date_time)
    }

    pub fn set_last_activity_at(&mut self, at: DateTime<Utc>) {
        if let Some(existing) = self
            .extension
            .iter_mut()
            .find(|e| e.url == LAST_ACTIVITY_EXTENSION_URL)
        {
            existing.value_date_time = Some(at);
            return;
        }
        self.extension.push(Extension {
            url: LAST_ACTIVITY_EXTENSION_URL.to_string(),
            value_date_time: Some(at),
            extra: Map::new(),
        });
    }
}

impl Payload {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            content_string: Some(text.into()),
            content_attachment: None,
        }
    }

    pub fn attachment(attachment: Attachment) -> Self {
        Self {
            content_string: None,
            content_attachment: Some(attachment),
        }
    }
}

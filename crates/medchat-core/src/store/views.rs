//! Presentation records derived from raw `Communication`s.
//!
//! Everything here is a pure function of its inputs; views are rebuilt on
//! every read and never stored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::constants::resource_types;
use crate::models::{Attachment, Communication, Reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SenderType {
    Patient,
    Practitioner,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub sender_type: SenderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub received: bool,
    pub read: bool,
    pub outgoing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub id: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Ascending by `sent`
    pub messages: Vec<ChatMessage>,
    pub last_message: Option<String>,
    pub last_message_sent_at: Option<DateTime<Utc>>,
    /// Sort key for thread lists: max(last message sent, thread sent)
    pub thread_order: Option<DateTime<Utc>>,
    pub unread_count: usize,
}

/// Classifies by a substring match on the sender reference, so absolute
/// references (`https://.../Patient/1`) count as well.
pub fn sender_type(message: &Communication) -> SenderType {
    let patient_marker = format!("{}/", resource_types::PATIENT);
    match message.sender.as_ref().and_then(|s| s.reference.as_deref()) {
        None => SenderType::Unknown,
        Some(reference) if reference.contains(&patient_marker) => SenderType::Patient,
        Some(_) => SenderType::Practitioner,
    }
}

/// True when `message` was authored by `local`
pub fn is_outgoing(message: &Communication, local: &Reference) -> bool {
    message
        .sender
        .as_ref()
        .is_some_and(|sender| sender.same_target(local))
}

pub fn chat_message(message: &Communication, local: &Reference) -> ChatMessage {
    ChatMessage {
        id: message.id().unwrap_or_default().to_string(),
        text: message.text().to_string(),
        attachment: message.attachment().cloned(),
        sender_type: sender_type(message),
        sender: message.sender.as_ref().and_then(|s| s.reference.clone()),
        sent_at: message.sent,
        received_at: message.received,
        received: message.received.is_some(),
        read: message.is_read(),
        outgoing: is_outgoing(message, local),
    }
}

pub fn thread_view(root: &Communication, messages: &[Communication], local: &Reference) -> ThreadView {
    let mut ordered: Vec<&Communication> = messages.iter().collect();
    // stable: equal timestamps keep collection order, so the last one wins ties
    ordered.sort_by_key(|m| m.sent);

    let messages: Vec<ChatMessage> = ordered.iter().map(|m| chat_message(m, local)).collect();
    let last = messages.last();
    let last_message_sent_at = last.and_then(|m| m.sent_at);
    let unread_count = messages.iter().filter(|m| !m.outgoing && !m.read).count();

    ThreadView {
        id: root.id().unwrap_or_default().to_string(),
        topic: root.topic_text().unwrap_or_default().to_string(),
        subject: root.subject.as_ref().and_then(|s| s.reference.clone()),
        sent_at: root.sent,
        last_activity_at: root.last_activity_at(),
        last_message: last.map(|m| m.text.clone()),
        last_message_sent_at,
        thread_order: last_message_sent_at.max(root.sent),
        unread_count,
        messages,
    }
}

/// Views for every root, most recently active first
pub fn thread_views(
    roots: &[Communication],
    messages: &HashMap<String, Vec<Communication>>,
    local: &Reference,
) -> Vec<ThreadView> {
    let mut views: Vec<ThreadView> = roots
        .iter()
        .map(|root| {
            let thread_messages = root
                .id()
                .and_then(|id| messages.get(id))
                .map(Vec::as_slice)
                .unwrap_or_default();
            thread_view(root, thread_messages, local)
        })
        .collect();
    views.sort_by(|a, b| b.thread_order.cmp(&a.thread_order));
    views
}

//! Last-write-wins merge of one incoming resource into an ordered collection.
//!
//! Identity is the resource id. A known id is only replaced when both the
//! stored and the incoming copy carry a revision timestamp and the incoming
//! one is strictly newer. Nothing is ever removed, and a replaced element
//! keeps its index.

use chrono::{DateTime, Utc};

use crate::models::Communication;

pub trait Revisioned {
    fn resource_id(&self) -> Option<&str>;
    fn revision_at(&self) -> Option<DateTime<Utc>>;
}

impl Revisioned for Communication {
    fn resource_id(&self) -> Option<&str> {
        self.id()
    }

    fn revision_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New identity, pushed to the end
    Appended,
    /// Existing identity replaced in place by a newer revision
    Replaced,
    /// Existing copy kept (incoming older, equal, or missing a revision)
    Kept,
}

/// Merge `incoming` into `collection` in place.
pub fn merge_into<R: Revisioned>(collection: &mut Vec<R>, incoming: R) -> MergeOutcome {
    let position = incoming.resource_id().and_then(|id| {
        collection
            .iter()
            .position(|existing| existing.resource_id() == Some(id))
    });

    let Some(index) = position else {
        collection.push(incoming);
        return MergeOutcome::Appended;
    };

    match (collection[index].revision_at(), incoming.revision_at()) {
        (Some(current), Some(next)) if next > current => {
            collection[index] = incoming;
            MergeOutcome::Replaced
        }
        _ => MergeOutcome::Kept,
    }
}

/// Pure form of [`merge_into`]: returns the merged copy of `collection`.
pub fn sync<R: Revisioned + Clone>(collection: &[R], incoming: R) -> Vec<R> {
    let mut merged = collection.to_vec();
    merge_into(&mut merged, incoming);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec {
        id: Option<&'static str>,
        rev: Option<DateTime<Utc>>,
        body: &'static str,
    }

    impl Revisioned for Rec {
        fn resource_id(&self) -> Option<&str> {
            self.id
        }

        fn revision_at(&self) -> Option<DateTime<Utc>> {
            self.rev
        }
    }

    fn rec(id: &'static str, rev: Option<DateTime<Utc>>, body: &'static str) -> Rec {
        Rec {
            id: Some(id),
            rev,
            body,
        }
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_append_new_identity() {
        let t = base();
        let c = vec![rec("a", Some(t), "a"), rec("b", Some(t), "b")];
        let r = rec("c", Some(t), "c");

        let mut expected = c.clone();
        expected.push(r.clone());
        assert_eq!(sync(&c, r), expected);
    }

    #[test]
    fn test_newer_revision_replaces_in_place() {
        let t = base();
        let c = vec![
            rec("a", Some(t), "a"),
            rec("b", Some(t), "old"),
            rec("c", Some(t), "c"),
        ];
        let newer = rec("b", Some(t + Duration::seconds(1)), "new");

        let merged = sync(&c, newer.clone());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1], newer);
        assert_eq!(merged[0], c[0]);
        assert_eq!(merged[2], c[2]);
    }

    #[test]
    fn test_stale_or_unrevisioned_incoming_is_rejected() {
        let t = base();
        let existing = rec("a", Some(t), "existing");

        for incoming in [
            rec("a", Some(t), "equal"),
            rec("a", Some(t - Duration::seconds(1)), "older"),
            rec("a", None, "no revision"),
        ] {
            assert_eq!(sync(std::slice::from_ref(&existing), incoming), vec![existing.clone()]);
        }

        let unrevisioned = rec("a", None, "existing");
        let newer = rec("a", Some(t), "incoming");
        assert_eq!(
            sync(std::slice::from_ref(&unrevisioned), newer),
            vec![unrevisioned.clone()]
        );
    }

    #[test]
    fn test_sync_is_idempotent() {
        let t = base();
        let c = vec![rec("a", Some(t), "a"), rec("b", Some(t), "b")];

        for r in [
            rec("b", Some(t + Duration::seconds(3)), "b2"),
            rec("z", None, "z"),
            rec("a", Some(t - Duration::seconds(3)), "stale"),
        ] {
            let once = sync(&c, r.clone());
            let twice = sync(&once, r);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_merge_into_reports_outcome() {
        let t = base();
        let mut c = vec![rec("a", Some(t), "a")];
        assert_eq!(merge_into(&mut c, rec("b", Some(t), "b")), MergeOutcome::Appended);
        assert_eq!(
            merge_into(&mut c, rec("a", Some(t + Duration::seconds(1)), "a2")),
            MergeOutcome::Replaced
        );
        assert_eq!(merge_into(&mut c, rec("a", Some(t), "a3")), MergeOutcome::Kept);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].body, "a2");
    }

    #[test]
    fn test_id_less_incoming_is_appended() {
        let t = base();
        let mut c = vec![rec("a", Some(t), "a")];
        let anonymous = Rec {
            id: None,
            rev: Some(t),
            body: "draft",
        };
        assert_eq!(merge_into(&mut c, anonymous), MergeOutcome::Appended);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_communication_uses_meta_last_updated() {
        let msg = Communication::from_value(serde_json::json!({
            "resourceType": "Communication",
            "id": "m1",
            "meta": { "lastUpdated": "2024-01-01T00:00:00Z" }
        }))
        .unwrap();
        assert_eq!(msg.resource_id(), Some("m1"));
        assert_eq!(msg.revision_at(), Some(base()));
    }
}

use serde::{Deserialize, Serialize};

use crate::constants::resource_types;

/// FHIR `Reference`, e.g. `{"reference": "Patient/123"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    pub fn new<S: Into<String>>(reference: S) -> Self {
        Self {
            reference: Some(reference.into()),
            display: None,
        }
    }

    /// Build a relative reference `<resource_type>/<id>`
    pub fn to(resource_type: &str, id: &str) -> Self {
        Self::new(format!("{}/{}", resource_type, id))
    }

    pub fn as_str(&self) -> &str {
        self.reference.as_deref().unwrap_or("")
    }

    /// Resource type segment of a relative or absolute reference
    pub fn resource_type(&self) -> Option<&str> {
        let mut segments = self.reference.as_deref()?.rsplit('/');
        let _id = segments.next()?;
        segments.next().filter(|s| !s.is_empty())
    }

    /// Id segment of a relative or absolute reference
    pub fn id(&self) -> Option<&str> {
        let reference = self.reference.as_deref()?;
        if !reference.contains('/') {
            return None;
        }
        reference.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// Same target, ignoring `display`
    pub fn same_target(&self, other: &Reference) -> bool {
        match (&self.reference, &other.reference) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileKind {
    Patient,
    Practitioner,
    Other(String),
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKind::Patient => write!(f, "{}", resource_types::PATIENT),
            ProfileKind::Practitioner => write!(f, "{}", resource_types::PRACTITIONER),
            ProfileKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// The signed-in identity the chat core acts as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub reference: Reference,
}

impl Profile {
    pub fn new(reference: Reference) -> Self {
        Self { reference }
    }

    pub fn patient(id: &str) -> Self {
        Self::new(Reference::to(resource_types::PATIENT, id))
    }

    pub fn practitioner(id: &str) -> Self {
        Self::new(Reference::to(resource_types::PRACTITIONER, id))
    }

    /// Parse `Patient/123` style strings
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = Reference::new(reference.trim());
        reference.id()?;
        Some(Self::new(reference))
    }

    pub fn kind(&self) -> ProfileKind {
        match self.reference.resource_type() {
            Some(resource_types::PATIENT) => ProfileKind::Patient,
            Some(resource_types::PRACTITIONER) => ProfileKind::Practitioner,
            Some(other) => ProfileKind::Other(other.to_string()),
            None => ProfileKind::Other(String::new()),
        }
    }

    pub fn is_patient(&self) -> bool {
        self.kind() == ProfileKind::Patient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_segments() {
        let r = Reference::new("Patient/123");
        assert_eq!(r.resource_type(), Some("Patient"));
        assert_eq!(r.id(), Some("123"));

        let absolute = Reference::new("https://example.test/fhir/R4/Practitioner/abc");
        assert_eq!(absolute.resource_type(), Some("Practitioner"));
        assert_eq!(absolute.id(), Some("abc"));

        let bare = Reference::new("123");
        assert_eq!(bare.id(), None);
        assert_eq!(bare.resource_type(), None);
    }

    #[test]
    fn test_same_target_ignores_display() {
        let mut a = Reference::new("Patient/1");
        a.display = Some("Alice".to_string());
        assert!(a.same_target(&Reference::new("Patient/1")));
        assert!(!a.same_target(&Reference::new("Patient/2")));
        assert!(!Reference::default().same_target(&Reference::default()));
    }

    #[test]
    fn test_profile_kind() {
        assert_eq!(Profile::patient("1").kind(), ProfileKind::Patient);
        assert_eq!(Profile::practitioner("1").kind(), ProfileKind::Practitioner);
        assert_eq!(
            Profile::parse("RelatedPerson/9").unwrap().kind(),
            ProfileKind::Other("RelatedPerson".to_string())
        );
        assert!(Profile::parse("nonsense").is_none());
    }
}

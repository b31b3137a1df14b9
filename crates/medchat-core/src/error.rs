use crate::backend::BackendError;
use crate::models::ProfileKind;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("No active profile")]
    NoProfile,

    /// Role policy violation, surfaced to the caller
    #[error("{kind} profiles are not permitted to {action}")]
    NotPermitted { kind: ProfileKind, action: &'static str },

    /// The session changed while the operation was in flight
    #[error("Operation cancelled by profile change")]
    Cancelled,

    /// Error reported by the live subscription channel
    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::InvalidResource(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_permitted_names_the_role() {
        let err = ChatError::NotPermitted {
            kind: ProfileKind::Practitioner,
            action: "create threads",
        };
        assert_eq!(
            err.to_string(),
            "Practitioner profiles are not permitted to create threads"
        );
    }
}

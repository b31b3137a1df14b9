//! Application-wide constants
//!
//! Centralized location for FHIR codes, search parameter names and defaults
//! that are used across multiple modules.

/// Default Medplum API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.medplum.com/";

/// FHIR REST path appended to the base URL
pub const DEFAULT_FHIR_PATH: &str = "fhir/R4/";

/// Websocket path for Medplum subscription notifications
pub const DEFAULT_WEBSOCKET_PATH: &str = "ws/subscriptions-r4";

/// Number of thread roots requested per refresh
pub const DEFAULT_THREAD_PAGE_SIZE: u32 = 100;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Delay before the websocket adapter retries after a dropped socket
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;

/// Extension carrying the thread activity marker ("touch").
pub const LAST_ACTIVITY_EXTENSION_URL: &str =
    "https://medchat.dev/fhir/StructureDefinition/last-activity";

pub mod resource_types {
    pub const COMMUNICATION: &str = "Communication";
    pub const PATIENT: &str = "Patient";
    pub const PRACTITIONER: &str = "Practitioner";
    pub const SUBSCRIPTION: &str = "Subscription";
    pub const BUNDLE: &str = "Bundle";
}

/// Search parameter names used against `Communication`
pub mod search_params {
    pub const PART_OF: &str = "part-of";
    pub const SUBJECT: &str = "subject";
    pub const SENT: &str = "sent";
    /// `_revinclude` target pulling message children alongside thread roots
    pub const REVINCLUDE_PART_OF: &str = "Communication:part-of";
}

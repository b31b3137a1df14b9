use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BASE_URL, DEFAULT_FHIR_PATH, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_THREAD_PAGE_SIZE, DEFAULT_WEBSOCKET_PATH,
};

pub const ENV_BASE_URL: &str = "MEDCHAT_BASE_URL";
pub const ENV_ACCESS_TOKEN: &str = "MEDCHAT_ACCESS_TOKEN";
pub const ENV_WEBSOCKET_URL: &str = "MEDCHAT_WEBSOCKET_URL";

/// Connection and sync settings for the chat core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub base_url: String,
    pub fhir_path: String,
    /// Overrides the websocket endpoint returned by the binding-token operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub thread_page_size: u32,
    pub request_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            fhir_path: DEFAULT_FHIR_PATH.to_string(),
            websocket_url: None,
            access_token: None,
            thread_page_size: DEFAULT_THREAD_PAGE_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl CoreConfig {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Load config from a JSON file. Missing fields fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Default config location: `<config_dir>/medchat/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("medchat").join("config.json"))
    }

    /// Override fields from `MEDCHAT_*` environment variables
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = base_url;
        }
        if let Some(token) = lookup(ENV_ACCESS_TOKEN).filter(|v| !v.is_empty()) {
            self.access_token = Some(token);
        }
        if let Some(ws) = lookup(ENV_WEBSOCKET_URL).filter(|v| !v.is_empty()) {
            self.websocket_url = Some(ws);
        }
    }

    /// Base URL for FHIR REST calls, always ending in `/`
    pub fn fhir_base_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.fhir_path.trim_matches('/');
        format!("{}/{}/", base, path)
    }

    /// Websocket endpoint used when the server does not return one
    pub fn default_websocket_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{}", rest))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{}", rest)))
            .unwrap_or_else(|| base.to_string());
        format!("{}/{}", base, DEFAULT_WEBSOCKET_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config_minimal() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_parse_config_camel_case_fields() {
        let json = r#"{
            "baseUrl": "http://localhost:8103",
            "accessToken": "abc",
            "threadPageSize": 20
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.base_url, "http://localhost:8103");
        assert_eq!(config.access_token.as_deref(), Some("abc"));
        assert_eq!(config.thread_page_size, 20);
        assert_eq!(config.fhir_path, DEFAULT_FHIR_PATH);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"baseUrl": "http://example.test"}"#).unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.base_url, "http://example.test");
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = CoreConfig::load("/nonexistent/medchat.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/medchat.json"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BASE_URL, "http://override.test"),
            (ENV_ACCESS_TOKEN, "token-1"),
            (ENV_WEBSOCKET_URL, ""),
        ]
        .into_iter()
        .collect();

        let mut config = CoreConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.base_url, "http://override.test");
        assert_eq!(config.access_token.as_deref(), Some("token-1"));
        assert!(config.websocket_url.is_none(), "empty values are ignored");
    }

    #[test]
    fn test_url_helpers() {
        let config = CoreConfig::new("http://localhost:8103/");
        assert_eq!(config.fhir_base_url(), "http://localhost:8103/fhir/R4/");
        assert_eq!(
            config.default_websocket_url(),
            "ws://localhost:8103/ws/subscriptions-r4"
        );

        let config = CoreConfig::default();
        assert_eq!(
            config.default_websocket_url(),
            "wss://api.medplum.com/ws/subscriptions-r4"
        );
    }
}

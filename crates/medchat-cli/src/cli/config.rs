use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use medchat_core::{CoreConfig, Profile};
use serde::{Deserialize, Serialize};

pub const ENV_PROFILE: &str = "MEDCHAT_PROFILE";

/// CLI configuration loaded from a JSON file: the core connection settings
/// plus the identity to act as.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    #[serde(flatten)]
    pub core: CoreConfig,

    /// Local identity, e.g. `Patient/123` or `Practitioner/456`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl CliConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// `<config_dir>/medchat/config.json`
    pub fn default_path() -> Option<PathBuf> {
        CoreConfig::default_path()
    }

    /// Explicit path, else the default location if it exists, else
    /// defaults. Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => Self::load(&default)?,
                None => Self::default(),
            },
        };
        Ok(config.apply_env())
    }

    pub fn apply_env(mut self) -> Self {
        self.core = self.core.apply_env();
        if let Some(profile) = std::env::var(ENV_PROFILE).ok().filter(|p| !p.is_empty()) {
            self.profile = Some(profile);
        }
        self
    }

    /// The configured identity, validated
    pub fn profile(&self) -> Result<Profile> {
        let raw = self
            .profile
            .as_deref()
            .context("No profile configured (set \"profile\" or MEDCHAT_PROFILE)")?;
        Profile::parse(raw).with_context(|| format!("Invalid profile reference: {}", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medchat_core::models::ProfileKind;

    #[test]
    fn test_parse_config_with_profile() {
        let json = r#"{
            "baseUrl": "http://localhost:8103",
            "accessToken": "secret",
            "profile": "Practitioner/dr-1"
        }"#;
        let config: CliConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.core.base_url, "http://localhost:8103");
        assert_eq!(config.core.access_token.as_deref(), Some("secret"));
        assert_eq!(config.profile().unwrap().kind(), ProfileKind::Practitioner);
    }

    #[test]
    fn test_parse_config_minimal() {
        let config: CliConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.core, CoreConfig::default());
        assert!(config.profile.is_none());
        assert!(config.profile().is_err());
    }

    #[test]
    fn test_invalid_profile_is_rejected() {
        let config = CliConfig {
            profile: Some("not-a-reference".to_string()),
            ..CliConfig::default()
        };
        let err = config.profile().unwrap_err();
        assert!(err.to_string().contains("not-a-reference"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"profile": "Patient/p1", "threadPageSize": 10}"#).unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.core.thread_page_size, 10);
        assert_eq!(config.profile.as_deref(), Some("Patient/p1"));
    }
}

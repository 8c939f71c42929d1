use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::licensing::types::LicenseError;

/// License server URL
pub const LICENSE_SERVER_URL: &str = "https://licensing.example.com/api/license";

/// Trial server URL
pub const TRIAL_SERVER_URL: &str = "https://licensing.example.com/api/trial/v1";

/// Application identifier sent to the trial service
pub const DEFAULT_APP_ID: &str = "com.example.eligibility";

/// Trial configuration
pub const DEFAULT_TRIAL_DAYS: i64 = 10;
pub const TRIAL_MAX_ATTEMPTS: u32 = 2;
pub const TRIAL_RETRY_BACKOFF_MS: u64 = 1_000;

/// Upper bound accepted for any server-supplied day count
pub const MAX_VALIDITY_DAYS: i64 = 36_500;

/// Per-call timeouts (race-with-timeout budget, not the HTTP client's)
pub const TRIAL_TIMEOUT_MS: u64 = 3_000;
pub const LICENSE_TIMEOUT_MS: u64 = 5_000;
pub const CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Revalidate once a day by default
pub const REVALIDATE_THRESHOLD_MINUTES: i64 = 24 * 60;

/// Storage configuration
pub const APP_DATA_DIR_NAME: &str = "eligibility-engine";
pub const LICENSE_RECORD_FILE: &str = "license_record.json";
pub const TRIAL_ANCHOR_FILE: &str = "trial_anchor.bin";
pub const DEVICE_ID_FILE: &str = ".device_id";

/// Prefix of the environment variables read by `with_env_overrides`
pub const ENV_PREFIX: &str = "ELIGIBILITY_";

/// API endpoints
pub mod endpoints {
    fn join(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    pub fn license_validate(base: &str) -> String {
        join(base, "validate")
    }

    pub fn license_activate(base: &str) -> String {
        join(base, "activate")
    }

    pub fn license_details(base: &str) -> String {
        join(base, "details")
    }

    pub fn trial_start(base: &str) -> String {
        join(base, "start")
    }

    pub fn trial_verify(base: &str) -> String {
        join(base, "verify")
    }
}

/// Runtime configuration for the licensing engine
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LicensingConfig {
    pub license_server_url: String,
    pub trial_server_url: String,
    pub api_key: String,
    pub app_id: String,
    pub data_dir: Option<PathBuf>,
    pub default_trial_days: i64,
    pub trial_max_attempts: u32,
    pub trial_retry_backoff_ms: u64,
    pub trial_timeout_ms: u64,
    pub license_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub revalidate_threshold_minutes: i64,
}

impl Default for LicensingConfig {
    fn default() -> Self {
        Self {
            license_server_url: LICENSE_SERVER_URL.to_string(),
            trial_server_url: TRIAL_SERVER_URL.to_string(),
            api_key: String::new(),
            app_id: DEFAULT_APP_ID.to_string(),
            data_dir: None,
            default_trial_days: DEFAULT_TRIAL_DAYS,
            trial_max_attempts: TRIAL_MAX_ATTEMPTS,
            trial_retry_backoff_ms: TRIAL_RETRY_BACKOFF_MS,
            trial_timeout_ms: TRIAL_TIMEOUT_MS,
            license_timeout_ms: LICENSE_TIMEOUT_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            revalidate_threshold_minutes: REVALIDATE_THRESHOLD_MINUTES,
        }
    }
}

impl LicensingConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, LicenseError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LicenseError::Storage(format!("Failed to read config {}: {}", path.display(), e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| LicenseError::Parse(format!("Failed to parse config {}: {}", path.display(), e)))
    }

    /// Apply `ELIGIBILITY_*` environment variables on top of this config
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("LICENSE_URL") {
            self.license_server_url = v;
        }
        if let Some(v) = lookup("TRIAL_URL") {
            self.trial_server_url = v;
        }
        if let Some(v) = lookup("API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = lookup("APP_ID") {
            self.app_id = v;
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("TRIAL_DAYS").and_then(|v| v.parse().ok()) {
            self.default_trial_days = v;
        }
        if let Some(v) = lookup("REVALIDATE_MINUTES").and_then(|v| v.parse().ok()) {
            self.revalidate_threshold_minutes = v;
        }
        self
    }

    /// Directory holding the stores; falls back to the platform data dir
    pub fn resolve_data_dir(&self) -> Result<PathBuf, LicenseError> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .ok_or_else(|| LicenseError::Storage("Could not get local data directory".to_string()))?
                .join(APP_DATA_DIR_NAME),
        };

        std::fs::create_dir_all(&dir)
            .map_err(|e| LicenseError::Storage(format!("Failed to create data dir: {}", e)))?;

        Ok(dir)
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }

    pub fn license_timeout(&self) -> Duration {
        Duration::from_millis(self.license_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn trial_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.trial_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_endpoints_trim_trailing_slash() {
        assert_eq!(endpoints::license_validate("https://a.test/"), "https://a.test/validate");
        assert_eq!(endpoints::trial_verify("https://a.test/trial"), "https://a.test/trial/verify");
    }

    #[test]
    fn test_defaults_match_constants() {
        let config = LicensingConfig::default();
        assert_eq!(config.default_trial_days, 10);
        assert_eq!(config.trial_timeout(), Duration::from_secs(3));
        assert_eq!(config.license_timeout(), Duration::from_secs(5));
        assert_eq!(config.trial_max_attempts, 2);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [("API_KEY", "ck_123"), ("TRIAL_DAYS", "14"), ("REVALIDATE_MINUTES", "oops")]
            .into_iter()
            .collect();
        let config = LicensingConfig::default().with_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.api_key, "ck_123");
        assert_eq!(config.default_trial_days, 14);
        // Unparseable values are ignored
        assert_eq!(config.revalidate_threshold_minutes, REVALIDATE_THRESHOLD_MINUTES);
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_key": "k", "license_timeout_ms": 100}"#).unwrap();

        let config = LicensingConfig::from_json_file(&path).unwrap();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.license_timeout_ms, 100);
        assert_eq!(config.trial_timeout_ms, TRIAL_TIMEOUT_MS);
    }

    #[test]
    fn test_resolve_data_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LicensingConfig {
            data_dir: Some(dir.path().join("nested")),
            ..Default::default()
        };
        let resolved = config.resolve_data_dir().unwrap();
        assert!(resolved.is_dir());
    }
}

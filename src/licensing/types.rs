use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::licensing::config::DEFAULT_TRIAL_DAYS;
use crate::licensing::license_store::calculate_end_date;

/// Verification state of the license pipeline
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseStatus {
    #[default]
    Unverified,  // Nothing checked yet in this process
    Verifying,   // A verification cycle is running
    Valid,       // License confirmed by the server
    Invalid,     // Neither license nor trial is usable
    Timeout,     // Inconclusive, treated as a transient failure
    Trial,       // Trial period active
}

/// Snapshot of the license state machine
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LicenseInfo {
    pub status: LicenseStatus,
    pub activation_date: String,
    pub validity_days: i64,
    pub edition: String,
    pub capabilities: String,
    pub licensed_to: String,
    pub last_verified_time: Option<DateTime<Utc>>,
    pub message: String,
}

/// Unified allow/deny decision exposed to the rest of the application
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilityStatus {
    Eligible,
    Ineligible,
    Checking,
    #[default]
    Unknown,
}

/// Which data source granted (or denied) eligibility
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilitySource {
    License,
    Trial,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EligibilityInfo {
    pub status: EligibilityStatus,
    pub is_licensed: bool,
    pub is_trial_active: bool,
    pub trial_days_remaining: i64,
    pub license_end_date: String,
    pub display_message: String,
    pub source: EligibilitySource,
}

/// Final outcome of a verification cycle
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Eligible,
    Ineligible,
}

/// Three-valued view of eligibility.
///
/// `Unknown` means nothing has been verified yet and the optimistic default is
/// in effect; `Checking` means a cycle is running. Both still allow use.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(tag = "state", content = "decision", rename_all = "snake_case")]
pub enum Resolution {
    Unknown,
    Checking,
    Resolved(Decision),
}

impl EligibilityInfo {
    /// Derive eligibility from a license snapshot.
    ///
    /// `trial_days` is the latest remaining-days snapshot and is only consulted
    /// for trial-backed states.
    pub fn derive(license: &LicenseInfo, trial_days: Option<i64>) -> Self {
        let days = trial_days.unwrap_or(DEFAULT_TRIAL_DAYS);

        match license.status {
            LicenseStatus::Valid => {
                let end_date = calculate_end_date(&license.activation_date, license.validity_days);
                EligibilityInfo {
                    status: EligibilityStatus::Eligible,
                    is_licensed: true,
                    is_trial_active: false,
                    trial_days_remaining: 0,
                    display_message: format!("License valid (expires: {})", end_date),
                    license_end_date: end_date,
                    source: EligibilitySource::License,
                }
            }
            LicenseStatus::Trial => EligibilityInfo {
                status: EligibilityStatus::Eligible,
                is_licensed: false,
                is_trial_active: true,
                trial_days_remaining: days,
                license_end_date: String::new(),
                display_message: format!("Trial active ({} days remaining)", days),
                source: EligibilitySource::Trial,
            },
            LicenseStatus::Unverified => EligibilityInfo {
                status: EligibilityStatus::Eligible,
                is_licensed: false,
                is_trial_active: true,
                trial_days_remaining: days,
                license_end_date: String::new(),
                display_message: "Default trial active, verifying in background".to_string(),
                source: EligibilitySource::Trial,
            },
            // Fields describe whatever the cycle started from
            LicenseStatus::Verifying if !license.activation_date.is_empty() => EligibilityInfo {
                status: EligibilityStatus::Checking,
                is_licensed: true,
                is_trial_active: false,
                trial_days_remaining: 0,
                license_end_date: calculate_end_date(&license.activation_date, license.validity_days),
                display_message: "Verifying license, features remain available".to_string(),
                source: EligibilitySource::License,
            },
            LicenseStatus::Verifying => EligibilityInfo {
                status: EligibilityStatus::Checking,
                is_licensed: false,
                is_trial_active: trial_days.is_some(),
                trial_days_remaining: trial_days.unwrap_or(0),
                license_end_date: String::new(),
                display_message: "Verifying entitlement, features remain available".to_string(),
                source: if trial_days.is_some() {
                    EligibilitySource::Trial
                } else {
                    EligibilitySource::Unknown
                },
            },
            LicenseStatus::Timeout => EligibilityInfo {
                status: EligibilityStatus::Eligible,
                is_licensed: false,
                is_trial_active: false,
                trial_days_remaining: 0,
                license_end_date: String::new(),
                display_message: "Verification inconclusive, access allowed until the next check".to_string(),
                source: EligibilitySource::Unknown,
            },
            LicenseStatus::Invalid => EligibilityInfo {
                status: EligibilityStatus::Ineligible,
                is_licensed: false,
                is_trial_active: false,
                trial_days_remaining: 0,
                license_end_date: String::new(),
                display_message: "License and trial have both expired, please activate a license".to_string(),
                source: EligibilitySource::Unknown,
            },
        }
    }

    /// Only an explicit `Ineligible` denies access
    pub fn allows_use(&self) -> bool {
        self.status != EligibilityStatus::Ineligible
    }
}

/// License fields cached on disk
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LicenseRecord {
    pub is_licensed: bool,
    pub start_date: String,  // yyyy-MM-dd
    pub end_date: String,    // yyyy-MM-dd, valid through 23:59:59
    pub license_key: String,
    pub edition: String,
    pub capabilities: String,
    pub licensed_to: String,
    pub user_email: String,
}

/// Persisted trial state
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrialAnchor {
    /// Epoch millis; the server-reported value wins over the local one
    pub first_launch_time: Option<i64>,
    pub trial_token: Option<String>,
    pub trial_signature: Option<String>,
    pub trial_duration_days: Option<i64>,
    pub expired: bool,
}

impl TrialAnchor {
    pub fn has_token(&self) -> bool {
        self.trial_token.is_some() && self.trial_signature.is_some()
    }
}

/// Error types for licensing operations
#[derive(thiserror::Error, Debug)]
pub enum LicenseError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Server returned an HTML page instead of JSON ({endpoint}); check the endpoint configuration")]
    HtmlResponse { endpoint: String },

    #[error("Invalid response: {0}")]
    Parse(String),

    #[error("License expired on {0}")]
    Expired(String),

    #[error("No license key configured")]
    NotConfigured,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl LicenseError {
    /// Errors that say nothing definitive about entitlement
    pub fn is_inconclusive(&self) -> bool {
        matches!(
            self,
            LicenseError::Network(_)
                | LicenseError::Timeout(_)
                | LicenseError::Server(_)
                | LicenseError::HtmlResponse { .. }
                | LicenseError::Parse(_)
        )
    }
}

impl Serialize for LicenseError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<reqwest::Error> for LicenseError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LicenseError::Parse(e.to_string())
        } else if e.is_status() {
            LicenseError::Server(e.to_string())
        } else {
            LicenseError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: LicenseStatus) -> LicenseInfo {
        LicenseInfo {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_license_info_is_unverified() {
        let info = LicenseInfo::default();
        assert_eq!(info.status, LicenseStatus::Unverified);
        assert!(info.last_verified_time.is_none());
    }

    #[test]
    fn test_unverified_is_optimistic_trial() {
        let eligibility = EligibilityInfo::derive(&info(LicenseStatus::Unverified), None);
        assert_eq!(eligibility.status, EligibilityStatus::Eligible);
        assert_eq!(eligibility.source, EligibilitySource::Trial);
        assert_eq!(eligibility.trial_days_remaining, DEFAULT_TRIAL_DAYS);
    }

    #[test]
    fn test_valid_carries_end_date() {
        let eligibility = EligibilityInfo::derive(
            &LicenseInfo {
                status: LicenseStatus::Valid,
                activation_date: "2025-01-01".to_string(),
                validity_days: 365,
                ..Default::default()
            },
            None,
        );
        assert_eq!(eligibility.source, EligibilitySource::License);
        assert!(eligibility.is_licensed);
        assert_eq!(eligibility.license_end_date, "2026-01-01");
        assert!(eligibility.display_message.contains("2026-01-01"));
    }

    #[test]
    fn test_verifying_keeps_license_fields() {
        let eligibility = EligibilityInfo::derive(
            &LicenseInfo {
                status: LicenseStatus::Verifying,
                activation_date: "2025-01-01".to_string(),
                validity_days: 365,
                ..Default::default()
            },
            None,
        );
        assert_eq!(eligibility.status, EligibilityStatus::Checking);
        assert_eq!(eligibility.source, EligibilitySource::License);
        assert!(eligibility.is_licensed);
        assert!(!eligibility.is_trial_active);
        assert_eq!(eligibility.trial_days_remaining, 0);
        assert_eq!(eligibility.license_end_date, "2026-01-01");
    }

    #[test]
    fn test_verifying_without_trial_days_invents_none() {
        let from_trial = EligibilityInfo::derive(&info(LicenseStatus::Verifying), Some(4));
        assert_eq!(from_trial.source, EligibilitySource::Trial);
        assert_eq!(from_trial.trial_days_remaining, 4);

        let from_timeout = EligibilityInfo::derive(&info(LicenseStatus::Verifying), None);
        assert_eq!(from_timeout.source, EligibilitySource::Unknown);
        assert!(!from_timeout.is_trial_active);
        assert_eq!(from_timeout.trial_days_remaining, 0);
    }

    #[test]
    fn test_trial_uses_days_snapshot() {
        let eligibility = EligibilityInfo::derive(&info(LicenseStatus::Trial), Some(3));
        assert_eq!(eligibility.trial_days_remaining, 3);
        assert!(eligibility.is_trial_active);
    }

    #[test]
    fn test_only_invalid_denies_use() {
        for status in [
            LicenseStatus::Unverified,
            LicenseStatus::Verifying,
            LicenseStatus::Valid,
            LicenseStatus::Timeout,
            LicenseStatus::Trial,
        ] {
            assert!(EligibilityInfo::derive(&info(status), None).allows_use(), "{:?}", status);
        }

        let denied = EligibilityInfo::derive(&info(LicenseStatus::Invalid), None);
        assert_eq!(denied.status, EligibilityStatus::Ineligible);
        assert!(!denied.allows_use());
        assert!(!denied.display_message.is_empty());
    }

    #[test]
    fn test_inconclusive_classification() {
        assert!(LicenseError::Timeout(5000).is_inconclusive());
        assert!(LicenseError::HtmlResponse { endpoint: "x".into() }.is_inconclusive());
        assert!(!LicenseError::NotConfigured.is_inconclusive());
        assert!(!LicenseError::Storage("disk".into()).is_inconclusive());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&LicenseStatus::Unverified).unwrap();
        assert_eq!(json, "\"UNVERIFIED\"");
    }
}

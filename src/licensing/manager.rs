//! Eligibility orchestration.
//!
//! `EligibilityManager` owns the published `LicenseInfo` / `EligibilityInfo`
//! pair and runs the verification pipeline: license first, trial as the
//! fallback, fail-open whenever a path is inconclusive.
//!
//! Verification cycles are not serialized against each other. Two cycles
//! started concurrently both run to completion and the last one to publish
//! wins.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::licensing::api::{mask_key, LicenseApiClient, LicenseDetails, LicenseDetailsResult, LicenseService, LicenseValidationResult};
use crate::licensing::clock::{Clock, SystemClock};
use crate::licensing::config::LicensingConfig;
use crate::licensing::device::DeviceContext;
use crate::licensing::license_store::{calculate_end_date, days_between, LicenseRecordStore};
use crate::licensing::trial::{with_timeout, TrialManager, TrialSettings, TrialVerdict};
use crate::licensing::trial_api::{HostProbe, TrialApiClient};
use crate::licensing::trial_store::TrialAnchorStore;
use crate::licensing::types::{
    Decision, EligibilityInfo, LicenseError, LicenseInfo, LicenseRecord, LicenseStatus, Resolution,
};

// ============================================================================
// Published State
// ============================================================================

/// One consistent view of license and eligibility, replaced as a whole
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct EntitlementSnapshot {
    pub license: LicenseInfo,
    pub eligibility: EligibilityInfo,
}

impl EntitlementSnapshot {
    pub fn new(license: LicenseInfo, trial_days: Option<i64>) -> Self {
        let eligibility = EligibilityInfo::derive(&license, trial_days);
        Self { license, eligibility }
    }

    /// Optimistic state before anything was verified
    pub fn initial() -> Self {
        Self::new(LicenseInfo::default(), None)
    }

    /// Distinguishes "assumed allowed" from "confirmed"
    pub fn resolution(&self) -> Resolution {
        match self.license.status {
            LicenseStatus::Unverified | LicenseStatus::Timeout => Resolution::Unknown,
            LicenseStatus::Verifying => Resolution::Checking,
            LicenseStatus::Valid | LicenseStatus::Trial => Resolution::Resolved(Decision::Eligible),
            LicenseStatus::Invalid => Resolution::Resolved(Decision::Ineligible),
        }
    }

    fn trial_days(&self) -> Option<i64> {
        self.eligibility
            .is_trial_active
            .then_some(self.eligibility.trial_days_remaining)
    }
}

// ============================================================================
// Gate Interface
// ============================================================================

/// What the rest of the application sees of the entitlement engine
#[async_trait]
pub trait EntitlementGate: Send + Sync {
    fn license_info(&self) -> LicenseInfo;

    fn eligibility_info(&self) -> EligibilityInfo;

    fn is_license_valid(&self) -> bool;

    fn has_eligibility(&self) -> bool;

    async fn verify_license(&self, force: bool) -> bool;

    async fn force_revalidate_and_sync(&self) -> bool;

    fn should_revalidate(&self, threshold_minutes: i64) -> bool;
}

// ============================================================================
// Path Outcomes
// ============================================================================

enum LicensePath {
    Absent,
    Valid(LicenseDetails),
    Rejected(String),
    Inconclusive(String),
}

enum TrialPath {
    Active(i64),
    Expired,
    Inconclusive(String),
}

// ============================================================================
// Manager
// ============================================================================

pub struct EligibilityManager {
    device: DeviceContext,
    records: LicenseRecordStore,
    license_service: Arc<dyn LicenseService>,
    trial: Arc<TrialManager>,
    clock: Arc<dyn Clock>,
    license_timeout: Duration,
    state: watch::Sender<EntitlementSnapshot>,
}

impl EligibilityManager {
    pub fn new(
        device: DeviceContext,
        records: LicenseRecordStore,
        license_service: Arc<dyn LicenseService>,
        trial: Arc<TrialManager>,
        clock: Arc<dyn Clock>,
        license_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(EntitlementSnapshot::initial());
        Self {
            device,
            records,
            license_service,
            trial,
            clock,
            license_timeout,
            state,
        }
    }

    /// Wire up the production stores, HTTP clients and wall clock
    pub fn from_config(config: &LicensingConfig) -> Result<Self, LicenseError> {
        let data_dir = config.resolve_data_dir()?;
        let device = DeviceContext::detect(config)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let trial = TrialManager::new(
            TrialAnchorStore::open(&data_dir, &device.device_id, &device.app_id),
            Arc::new(TrialApiClient::new(config)?),
            Arc::new(HostProbe::for_url(&config.trial_server_url, config.connect_timeout())?),
            clock.clone(),
            TrialSettings::from(config),
        );

        Ok(Self::new(
            device,
            LicenseRecordStore::open(&data_dir),
            Arc::new(LicenseApiClient::new(config)?),
            Arc::new(trial),
            clock,
            config.license_timeout(),
        ))
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn trial(&self) -> &Arc<TrialManager> {
        &self.trial
    }

    /// Receiver notified on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<EntitlementSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> EntitlementSnapshot {
        self.state.borrow().clone()
    }

    pub fn license_info(&self) -> LicenseInfo {
        self.state.borrow().license.clone()
    }

    pub fn eligibility_info(&self) -> EligibilityInfo {
        self.state.borrow().eligibility.clone()
    }

    pub fn resolution(&self) -> Resolution {
        self.state.borrow().resolution()
    }

    /// Confirmed by a license or a running trial; optimistic states do not count
    pub fn is_license_valid(&self) -> bool {
        matches!(self.state.borrow().license.status, LicenseStatus::Valid | LicenseStatus::Trial)
    }

    /// Fail-open: `Checking` still counts as eligible
    pub fn has_eligibility(&self) -> bool {
        self.state.borrow().eligibility.allows_use()
    }

    fn publish(&self, license: LicenseInfo, trial_days: Option<i64>) {
        let snapshot = EntitlementSnapshot::new(license, trial_days);
        log::info!(
            "Entitlement: license={:?}, eligibility={:?} ({})",
            snapshot.license.status,
            snapshot.eligibility.status,
            snapshot.eligibility.display_message
        );
        self.state.send_replace(snapshot);
    }

    /// Run one verification cycle and return the resulting `has_eligibility`.
    ///
    /// `force` drops the trial manager's cached validity first.
    pub async fn verify_license(&self, force: bool) -> bool {
        let previous = self.snapshot();
        self.publish(
            LicenseInfo {
                status: LicenseStatus::Verifying,
                ..previous.license.clone()
            },
            previous.trial_days(),
        );

        let license_path = match self.check_license().await {
            LicensePath::Valid(details) => {
                self.accept_license(details);
                return self.has_eligibility();
            }
            other => other,
        };

        if force {
            self.trial.invalidate_cache();
        }
        let trial_path = self.check_trial().await;

        self.decide(license_path, trial_path, &previous.license);
        self.has_eligibility()
    }

    /// Run `verify_license` in the background and report the outcome
    pub fn spawn_verify<F>(self: &Arc<Self>, force: bool, on_complete: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let eligible = manager.verify_license(force).await;
            on_complete(eligible);
        })
    }

    /// Full resync: honor a server-side trial revocation, then decide from scratch
    pub async fn force_revalidate_and_sync(&self) -> bool {
        match self.trial.anchor() {
            Ok(anchor) if anchor.has_token() => {
                match self
                    .trial
                    .verify_trial_with_server(&self.device.device_id, &self.device.app_id)
                    .await
                {
                    Ok(TrialVerdict::Invalid) => log::info!("Trial revoked by server"),
                    Ok(verdict) => log::debug!("Trial server check: {:?}", verdict),
                    Err(e) => log::warn!("Trial server check failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not read trial state: {}", e),
        }

        self.verify_license(true).await
    }

    /// True when never verified, when invalid, or when the last verification
    /// is at least `threshold_minutes` old
    pub fn should_revalidate(&self, threshold_minutes: i64) -> bool {
        let status = self.state.borrow().license.status;
        if matches!(status, LicenseStatus::Unverified | LicenseStatus::Invalid) {
            return true;
        }
        match self.minutes_since_last_verification() {
            Some(minutes) => minutes >= threshold_minutes,
            None => true,
        }
    }

    pub fn minutes_since_last_verification(&self) -> Option<i64> {
        let last = self.state.borrow().license.last_verified_time?;
        Some((self.clock.now() - last).num_minutes())
    }

    /// Activate `license_key` on this device; on success store it and resync
    pub async fn activate_license(&self, license_key: &str) -> Result<LicenseValidationResult, LicenseError> {
        let license_key = license_key.trim();
        if license_key.is_empty() {
            return Err(LicenseError::NotConfigured);
        }

        log::info!("Activating license {}", mask_key(license_key));
        let result = with_timeout(
            self.license_timeout,
            self.license_service.activate(license_key, &self.device.device_id),
        )
        .await?;

        if result.success {
            self.records.save_license_key(license_key)?;
            self.force_revalidate_and_sync().await;
        } else {
            log::warn!("Activation rejected: {}", result.message);
        }
        Ok(result)
    }

    /// Back to the optimistic initial snapshot
    pub fn reset_license_status(&self) {
        self.publish(LicenseInfo::default(), None);
    }

    // ------------------------------------------------------------------------
    // Pipeline steps
    // ------------------------------------------------------------------------

    async fn check_license(&self) -> LicensePath {
        let license_key = match self.records.license_key() {
            Ok(Some(key)) => key,
            Ok(None) => return LicensePath::Absent,
            Err(e) => return LicensePath::Inconclusive(e.to_string()),
        };

        let validation = with_timeout(
            self.license_timeout,
            self.license_service.validate(&license_key, &self.device.device_id),
        )
        .await;

        match validation {
            Ok(result) if result.success => {}
            Ok(result) => {
                log::warn!("License {} rejected: {}", mask_key(&license_key), result.message);
                return LicensePath::Rejected(result.message);
            }
            Err(e) => {
                log::warn!("License validation inconclusive, falling back to trial: {}", e);
                return LicensePath::Inconclusive(e.to_string());
            }
        }

        match with_timeout(self.license_timeout, self.license_service.details(&license_key)).await {
            Ok(LicenseDetailsResult::Success(details)) => LicensePath::Valid(details),
            Ok(LicenseDetailsResult::Error { message }) => {
                log::warn!("License details rejected: {}", message);
                LicensePath::Rejected(message)
            }
            Err(e) => {
                log::warn!("License details inconclusive, falling back to trial: {}", e);
                LicensePath::Inconclusive(e.to_string())
            }
        }
    }

    async fn check_trial(&self) -> TrialPath {
        let (device_id, app_id) = (&self.device.device_id, &self.device.app_id);

        match self.trial.is_trial_valid(device_id, app_id).await {
            Ok(true) => match self.trial.get_remaining_days(device_id, app_id).await {
                Ok(0) => {
                    self.trial.invalidate_cache();
                    TrialPath::Expired
                }
                Ok(days) => TrialPath::Active(days),
                Err(e) => TrialPath::Inconclusive(e.to_string()),
            },
            Ok(false) => TrialPath::Expired,
            Err(e) => {
                log::warn!("Trial check inconclusive: {}", e);
                TrialPath::Inconclusive(e.to_string())
            }
        }
    }

    /// Publish VALID from the server's answer and refresh the local record
    fn accept_license(&self, details: LicenseDetails) {
        let end_date = calculate_end_date(&details.activation_date, details.validity_days);

        let record = LicenseRecord {
            is_licensed: true,
            start_date: details.activation_date.clone(),
            end_date,
            license_key: self.records.license_key().ok().flatten().unwrap_or_default(),
            edition: details.edition.clone(),
            capabilities: details.capabilities.clone(),
            licensed_to: details.licensed_to.clone(),
            user_email: details.email.clone(),
        };
        if let Err(e) = self.records.save_record(&record) {
            log::error!("Failed to persist license record: {}", e);
        }

        self.publish(
            LicenseInfo {
                status: LicenseStatus::Valid,
                activation_date: details.activation_date,
                validity_days: details.validity_days,
                edition: details.edition,
                capabilities: details.capabilities,
                licensed_to: details.licensed_to,
                last_verified_time: Some(self.clock.now()),
                message: "License valid".to_string(),
            },
            None,
        );
    }

    fn decide(&self, license_path: LicensePath, trial_path: TrialPath, previous: &LicenseInfo) {
        let now = self.clock.now();

        if let LicensePath::Rejected(_) = &license_path {
            if let Err(e) = self.records.set_licensed(false) {
                log::error!("Failed to clear licensed flag: {}", e);
            }
        }

        match (license_path, trial_path) {
            (_, TrialPath::Active(days)) => self.publish(
                LicenseInfo {
                    status: LicenseStatus::Trial,
                    last_verified_time: Some(now),
                    message: format!("Trial active ({} days remaining)", days),
                    ..Default::default()
                },
                Some(days),
            ),
            (_, TrialPath::Inconclusive(reason)) => {
                log::warn!("Trial status unknown, allowing use until the next check");
                self.publish(
                    LicenseInfo {
                        status: LicenseStatus::Timeout,
                        last_verified_time: previous.last_verified_time,
                        message: format!("Verification inconclusive: {}", reason),
                        ..Default::default()
                    },
                    None,
                );
            }
            (LicensePath::Inconclusive(reason), TrialPath::Expired) => {
                match self.records.require_active(&self.clock.now_local()) {
                    Ok(record) => {
                        log::warn!("License server unreachable, using stored license valid through {}", record.end_date);
                        self.publish(
                            LicenseInfo {
                                status: LicenseStatus::Valid,
                                validity_days: days_between(&record.start_date, &record.end_date).unwrap_or(0),
                                activation_date: record.start_date,
                                edition: record.edition,
                                capabilities: record.capabilities,
                                licensed_to: record.licensed_to,
                                last_verified_time: previous.last_verified_time,
                                message: "License valid (stored copy, server unreachable)".to_string(),
                            },
                            None,
                        );
                    }
                    Err(e) => {
                        log::warn!("License check inconclusive ({}), stored license unusable ({}), allowing use", reason, e);
                        self.publish(
                            LicenseInfo {
                                status: LicenseStatus::Timeout,
                                last_verified_time: previous.last_verified_time,
                                message: format!("License verification inconclusive: {}", reason),
                                ..Default::default()
                            },
                            None,
                        );
                    }
                }
            }
            (license_path, TrialPath::Expired) => {
                let message = match license_path {
                    LicensePath::Rejected(reason) => format!("License rejected ({}) and trial expired", reason),
                    _ => "No license key and trial expired".to_string(),
                };
                self.publish(
                    LicenseInfo {
                        status: LicenseStatus::Invalid,
                        last_verified_time: Some(now),
                        message,
                        ..Default::default()
                    },
                    None,
                );
            }
        }
    }
}

#[async_trait]
impl EntitlementGate for EligibilityManager {
    fn license_info(&self) -> LicenseInfo {
        EligibilityManager::license_info(self)
    }

    fn eligibility_info(&self) -> EligibilityInfo {
        EligibilityManager::eligibility_info(self)
    }

    fn is_license_valid(&self) -> bool {
        EligibilityManager::is_license_valid(self)
    }

    fn has_eligibility(&self) -> bool {
        EligibilityManager::has_eligibility(self)
    }

    async fn verify_license(&self, force: bool) -> bool {
        EligibilityManager::verify_license(self, force).await
    }

    async fn force_revalidate_and_sync(&self) -> bool {
        EligibilityManager::force_revalidate_and_sync(self).await
    }

    fn should_revalidate(&self, threshold_minutes: i64) -> bool {
        EligibilityManager::should_revalidate(self, threshold_minutes)
    }
}

//! Trial lifecycle: anchoring, token acquisition, remaining days.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::licensing::clock::Clock;
use crate::licensing::config::{LicensingConfig, MAX_VALIDITY_DAYS};
use crate::licensing::trial_api::{Connectivity, TrialCredentials, TrialService, TrialStartResponse};
use crate::licensing::trial_store::TrialAnchorStore;
use crate::licensing::types::{LicenseError, TrialAnchor};

const MILLIS_PER_DAY: i64 = 86_400_000;

const CACHE_UNKNOWN: u8 = 0;
const CACHE_INVALID: u8 = 1;
const CACHE_VALID: u8 = 2;

/// How `request_trial_if_needed` concluded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrialAcquisition {
    AlreadyInitialized,  // Another caller already did the work in this process
    Issued,              // Server issued (or re-issued) a token
    DefaultOffline,      // No network, default trial length applied
    DefaultAfterRetries, // Server unreachable or failing, default trial length applied
}

/// Result of the explicit server re-check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrialVerdict {
    Valid,
    Invalid,
    Inconclusive,
}

#[derive(Clone, Debug)]
pub struct TrialSettings {
    pub default_days: i64,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub call_timeout: Duration,
}

impl From<&LicensingConfig> for TrialSettings {
    fn from(config: &LicensingConfig) -> Self {
        Self {
            default_days: config.default_trial_days,
            max_attempts: config.trial_max_attempts.max(1),
            retry_backoff: config.trial_retry_backoff(),
            call_timeout: config.trial_timeout(),
        }
    }
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self::from(&LicensingConfig::default())
    }
}

/// Race `call` against `limit`, mapping expiry to `LicenseError::Timeout`
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, LicenseError>
where
    F: Future<Output = Result<T, LicenseError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LicenseError::Timeout(limit.as_millis() as u64)),
    }
}

/// Reject day counts no real trial would carry
fn check_start_response(response: TrialStartResponse) -> Result<TrialStartResponse, LicenseError> {
    if (1..=MAX_VALIDITY_DAYS).contains(&response.expires_in_days) {
        Ok(response)
    } else {
        Err(LicenseError::Parse(format!(
            "trial length out of range: {} days",
            response.expires_in_days
        )))
    }
}

pub struct TrialManager {
    store: TrialAnchorStore,
    service: Arc<dyn TrialService>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    settings: TrialSettings,
    acquire_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    valid_cache: AtomicU8,
    valid_until: AtomicI64,
}

impl TrialManager {
    pub fn new(
        store: TrialAnchorStore,
        service: Arc<dyn TrialService>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
        settings: TrialSettings,
    ) -> Self {
        Self {
            store,
            service,
            connectivity,
            clock,
            settings,
            acquire_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            valid_cache: AtomicU8::new(CACHE_UNKNOWN),
            valid_until: AtomicI64::new(i64::MIN),
        }
    }

    pub fn anchor(&self) -> Result<TrialAnchor, LicenseError> {
        self.store.load()
    }

    /// Forget the in-process validity; the next check recomputes from the store
    pub fn invalidate_cache(&self) {
        self.valid_cache.store(CACHE_UNKNOWN, Ordering::Release);
    }

    /// Acquire or refresh the trial token, at most once per process.
    ///
    /// Concurrent callers wait on the same lock; only the first one talks to
    /// the server. Network failures never surface here: they fall back to the
    /// default trial length.
    pub async fn request_trial_if_needed(&self, device_id: &str, app_id: &str) -> Result<TrialAcquisition, LicenseError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(TrialAcquisition::AlreadyInitialized);
        }

        let _guard = self.acquire_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(TrialAcquisition::AlreadyInitialized);
        }

        let outcome = self.acquire(device_id, app_id).await?;
        self.invalidate_cache();
        self.initialized.store(true, Ordering::Release);
        Ok(outcome)
    }

    async fn acquire(&self, device_id: &str, app_id: &str) -> Result<TrialAcquisition, LicenseError> {
        let anchor = self.store.load()?;

        if let (Some(token), Some(signature)) = (&anchor.trial_token, &anchor.trial_signature) {
            let credentials = TrialCredentials {
                device_id,
                app_id,
                trial_token: token,
                signature,
            };
            if !self.check_cached_token(credentials).await {
                log::warn!("Server rejected cached trial token, continuing with local state");
            }
        }

        let first_launch = self.store.get_or_init_first_launch(self.clock.now_millis())?;

        if !self.connectivity.is_network_available().await {
            log::warn!(
                "Network unavailable, using default trial period of {} days",
                self.settings.default_days
            );
            self.apply_default_trial()?;
            return Ok(TrialAcquisition::DefaultOffline);
        }

        match self.start_with_retry(device_id, app_id).await {
            Some(response) => {
                self.store
                    .save_token(&response.trial_token, &response.signature, response.expires_in_days)?;
                if let Some(server_anchor) = response.first_launch_time {
                    if self.store.commit_server_first_launch(server_anchor)? {
                        log::debug!("Server first launch {} replaces local {}", server_anchor, first_launch);
                    }
                }
                Ok(TrialAcquisition::Issued)
            }
            None => {
                log::warn!(
                    "Trial server failed after {} attempts, using default trial period of {} days",
                    self.settings.max_attempts,
                    self.settings.default_days
                );
                self.apply_default_trial()?;
                Ok(TrialAcquisition::DefaultAfterRetries)
            }
        }
    }

    /// Opportunistic re-check; anything but an explicit rejection counts as valid
    async fn check_cached_token(&self, credentials: TrialCredentials<'_>) -> bool {
        match with_timeout(self.settings.call_timeout, self.service.verify(credentials, false)).await {
            Ok(response) => response.valid.unwrap_or(true),
            Err(e) => {
                log::debug!("Cached token check inconclusive: {}", e);
                true
            }
        }
    }

    async fn start_with_retry(&self, device_id: &str, app_id: &str) -> Option<TrialStartResponse> {
        for attempt in 1..=self.settings.max_attempts {
            let call = with_timeout(self.settings.call_timeout, self.service.start(device_id, app_id));
            match call.await.and_then(check_start_response) {
                Ok(response) => return Some(response),
                Err(e) => {
                    log::warn!("Trial start attempt {}/{} failed: {}", attempt, self.settings.max_attempts, e);
                    if attempt < self.settings.max_attempts {
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }
        None
    }

    /// Commit the default length unless a length is already stored
    fn apply_default_trial(&self) -> Result<(), LicenseError> {
        if self.store.trial_duration_days()?.is_none() {
            self.store.set_trial_duration_days(self.settings.default_days)?;
        }
        Ok(())
    }

    /// A cached "valid" holds only until the trial's end instant
    pub async fn is_trial_valid(&self, device_id: &str, app_id: &str) -> Result<bool, LicenseError> {
        match self.valid_cache.load(Ordering::Acquire) {
            CACHE_VALID if self.clock.now_millis() < self.valid_until.load(Ordering::Acquire) => return Ok(true),
            CACHE_INVALID => return Ok(false),
            _ => {}
        }

        self.request_trial_if_needed(device_id, app_id).await?;
        let valid = self.get_remaining_days(device_id, app_id).await? > 0;
        if valid {
            self.valid_until.store(self.trial_end_millis()?, Ordering::Release);
            self.valid_cache.store(CACHE_VALID, Ordering::Release);
        } else {
            self.valid_cache.store(CACHE_INVALID, Ordering::Release);
        }
        Ok(valid)
    }

    fn trial_end_millis(&self) -> Result<i64, LicenseError> {
        let days = self.store.trial_duration_days()?.unwrap_or(self.settings.default_days);
        let first_launch = self.store.get_or_init_first_launch(self.clock.now_millis())?;
        Ok(first_launch.saturating_add(days.saturating_mul(MILLIS_PER_DAY)))
    }

    /// Whole days left, rounded up and never negative
    pub async fn get_remaining_days(&self, device_id: &str, app_id: &str) -> Result<i64, LicenseError> {
        if !self.store.has_trial_data()? {
            log::debug!("No trial data found, initializing trial");
            self.request_trial_if_needed(device_id, app_id).await?;
        }

        if self.store.is_expired()? {
            return Ok(0);
        }

        let duration_days = self.store.trial_duration_days()?.unwrap_or(self.settings.default_days);
        let now = self.clock.now_millis();
        let first_launch = self.store.get_or_init_first_launch(now)?;

        if now < first_launch {
            log::warn!("Device time is earlier than first launch time, assuming trial is valid");
            return Ok(duration_days.max(0));
        }

        let remaining_millis = self.trial_end_millis()?.saturating_sub(now);
        if remaining_millis <= 0 {
            log::debug!("Trial expired (first_launch={}, days={})", first_launch, duration_days);
            return Ok(0);
        }

        Ok(remaining_millis / MILLIS_PER_DAY + i64::from(remaining_millis % MILLIS_PER_DAY != 0))
    }

    /// Explicit server re-check; a definitive rejection expires the local trial
    pub async fn verify_trial_with_server(&self, device_id: &str, app_id: &str) -> Result<TrialVerdict, LicenseError> {
        let anchor = self.store.load()?;
        let (Some(token), Some(signature)) = (&anchor.trial_token, &anchor.trial_signature) else {
            log::debug!("No cached trial token to verify");
            return Ok(TrialVerdict::Inconclusive);
        };

        let credentials = TrialCredentials {
            device_id,
            app_id,
            trial_token: token,
            signature,
        };

        match with_timeout(self.settings.call_timeout, self.service.verify(credentials, true)).await {
            Ok(response) => match response.valid {
                Some(true) => Ok(TrialVerdict::Valid),
                Some(false) => {
                    log::warn!(
                        "Server reports trial invalid ({}), expiring local trial",
                        response.message.as_deref().unwrap_or("no message")
                    );
                    self.force_expire_trial()?;
                    Ok(TrialVerdict::Invalid)
                }
                None => Ok(TrialVerdict::Inconclusive),
            },
            Err(e) if e.is_inconclusive() => {
                log::warn!("Trial verification inconclusive: {}", e);
                Ok(TrialVerdict::Inconclusive)
            }
            Err(e) => Err(e),
        }
    }

    pub fn force_expire_trial(&self) -> Result<(), LicenseError> {
        self.store.set_expired(true)?;
        self.valid_cache.store(CACHE_INVALID, Ordering::Release);
        log::info!("Trial force-expired");
        Ok(())
    }

    pub fn clear_trial_data(&self) -> Result<(), LicenseError> {
        self.store.clear()?;
        self.invalidate_cache();
        self.initialized.store(false, Ordering::Release);
        log::info!("Cleared trial data");
        Ok(())
    }
}

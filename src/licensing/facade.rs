//! Adapter for call sites that predate `EligibilityManager` injection.
//!
//! Holds no state of its own; everything forwards to the wrapped manager.

#![allow(deprecated)]

use async_trait::async_trait;
use std::sync::Arc;

use crate::licensing::manager::{EligibilityManager, EntitlementGate};
use crate::licensing::types::{EligibilityInfo, LicenseInfo};

#[deprecated(note = "inject `EligibilityManager` or `Arc<dyn EntitlementGate>` directly")]
#[derive(Clone)]
pub struct LicenseVerificationFacade {
    manager: Arc<EligibilityManager>,
}

impl LicenseVerificationFacade {
    pub fn new(manager: Arc<EligibilityManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<EligibilityManager> {
        &self.manager
    }

    /// Startup check: runs a verification cycle, then one of the callbacks
    pub async fn verify_on_start<S, I>(&self, on_success: S, on_invalid: I) -> bool
    where
        S: FnOnce(),
        I: FnOnce(&EligibilityInfo),
    {
        let eligible = self.manager.verify_license(false).await;
        if eligible {
            on_success();
        } else {
            on_invalid(&self.manager.eligibility_info());
        }
        eligible
    }

    /// Same as `verify_on_start` but bypasses cached trial validity
    pub async fn force_server_validation<S, I>(&self, on_success: S, on_invalid: I) -> bool
    where
        S: FnOnce(),
        I: FnOnce(&EligibilityInfo),
    {
        let eligible = self.manager.verify_license(true).await;
        if eligible {
            on_success();
        } else {
            on_invalid(&self.manager.eligibility_info());
        }
        eligible
    }
}

#[async_trait]
impl EntitlementGate for LicenseVerificationFacade {
    fn license_info(&self) -> LicenseInfo {
        self.manager.license_info()
    }

    fn eligibility_info(&self) -> EligibilityInfo {
        self.manager.eligibility_info()
    }

    fn is_license_valid(&self) -> bool {
        self.manager.is_license_valid()
    }

    fn has_eligibility(&self) -> bool {
        self.manager.has_eligibility()
    }

    async fn verify_license(&self, force: bool) -> bool {
        self.manager.verify_license(force).await
    }

    async fn force_revalidate_and_sync(&self) -> bool {
        self.manager.force_revalidate_and_sync().await
    }

    fn should_revalidate(&self, threshold_minutes: i64) -> bool {
        self.manager.should_revalidate(threshold_minutes)
    }
}

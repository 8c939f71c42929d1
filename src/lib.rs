//! Entitlement engine: decides whether this installation may use the
//! product, blending a time-boxed local trial with a remotely validated
//! license.
//!
//! ```no_run
//! use eligibility_engine::{EligibilityManager, LicensingConfig};
//!
//! # async fn run() -> Result<(), eligibility_engine::LicenseError> {
//! let config = LicensingConfig::default().with_env_overrides();
//! let manager = EligibilityManager::from_config(&config)?;
//!
//! if manager.should_revalidate(config.revalidate_threshold_minutes) {
//!     manager.verify_license(false).await;
//! }
//! assert!(manager.has_eligibility());
//! # Ok(())
//! # }
//! ```

pub mod licensing;

pub use licensing::*;

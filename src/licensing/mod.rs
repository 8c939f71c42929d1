// Licensing system module
// License first, trial as the fallback, one published eligibility status

pub mod types;
pub mod config;
pub mod clock;
pub mod device;
pub mod crypto;
pub mod storage;
pub mod license_store;
pub mod trial_store;
pub mod api;
pub mod trial_api;
pub mod trial;
pub mod manager;
pub mod facade;

pub use types::*;
pub use config::LicensingConfig;
pub use clock::{Clock, SystemClock};
pub use device::DeviceContext;
pub use license_store::LicenseRecordStore;
pub use trial_store::TrialAnchorStore;
pub use api::{LicenseApiClient, LicenseService};
pub use trial_api::{Connectivity, HostProbe, TrialApiClient, TrialService};
pub use trial::{TrialAcquisition, TrialManager, TrialSettings, TrialVerdict};
pub use manager::{EligibilityManager, EntitlementGate, EntitlementSnapshot};
#[allow(deprecated)]
pub use facade::LicenseVerificationFacade;

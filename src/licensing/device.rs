use std::path::Path;

use crate::licensing::config::{LicensingConfig, DEVICE_ID_FILE};
use crate::licensing::types::LicenseError;

/// Salt for the hashed hardware id, so the raw id never leaves the machine
#[cfg(not(any(target_os = "ios", target_os = "android")))]
const HWID_KEY: &str = "eligibility-engine";

/// Identity sent with every trial and license request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceContext {
    pub device_id: String,
    pub app_id: String,
}

impl DeviceContext {
    pub fn new(device_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            app_id: app_id.into(),
        }
    }

    pub fn detect(config: &LicensingConfig) -> Result<Self, LicenseError> {
        let data_dir = config.resolve_data_dir()?;
        Ok(Self::new(get_device_id(&data_dir)?, config.app_id.clone()))
    }
}

/// Get platform-specific device ID
///
/// Desktop platforms use the hashed machine id; elsewhere, or when the
/// machine id is unavailable, a UUID stored in `data_dir` is reused.
pub fn get_device_id(data_dir: &Path) -> Result<String, LicenseError> {
    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        if let Some(id) = hardware_device_id() {
            return Ok(id);
        }
    }

    get_or_create_stored_device_id(data_dir)
}

#[cfg(not(any(target_os = "ios", target_os = "android")))]
fn hardware_device_id() -> Option<String> {
    use machineid_rs::{Encryption, HWIDComponent, IdBuilder};

    match IdBuilder::new(Encryption::SHA256)
        .add_component(HWIDComponent::SystemID)
        .build(HWID_KEY)
    {
        Ok(id) if !id.is_empty() => Some(id),
        Ok(_) => None,
        Err(e) => {
            log::debug!("Machine id unavailable, using stored device id: {}", e);
            None
        }
    }
}

fn get_or_create_stored_device_id(data_dir: &Path) -> Result<String, LicenseError> {
    let path = data_dir.join(DEVICE_ID_FILE);

    if let Ok(id) = std::fs::read_to_string(&path) {
        let id = id.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let device_id = uuid::Uuid::new_v4().to_string();

    std::fs::create_dir_all(data_dir)
        .map_err(|e| LicenseError::Storage(format!("Failed to create {}: {}", data_dir.display(), e)))?;
    std::fs::write(&path, &device_id)
        .map_err(|e| LicenseError::Storage(format!("Failed to write {}: {}", path.display(), e)))?;

    log::info!("Generated new device id");
    Ok(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let first = get_device_id(dir.path()).unwrap();
        assert!(!first.is_empty());
        assert_eq!(get_device_id(dir.path()).unwrap(), first);
    }

    #[test]
    fn test_stored_id_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let id = get_or_create_stored_device_id(dir.path()).unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(get_or_create_stored_device_id(dir.path()).unwrap(), id);
    }

    #[test]
    fn test_blank_stored_id_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICE_ID_FILE), "  \n").unwrap();

        let id = get_or_create_stored_device_id(dir.path()).unwrap();
        assert!(!id.trim().is_empty());
        assert_eq!(std::fs::read_to_string(dir.path().join(DEVICE_ID_FILE)).unwrap(), id);
    }

    #[test]
    fn test_detect_uses_configured_app_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = LicensingConfig {
            data_dir: Some(dir.path().join("data")),
            app_id: "com.example.test".to_string(),
            ..Default::default()
        };

        let context = DeviceContext::detect(&config).unwrap();
        assert_eq!(context.app_id, "com.example.test");
        assert!(!context.device_id.is_empty());
    }
}

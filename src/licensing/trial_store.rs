use serde_json::Value;
use std::path::Path;

use crate::licensing::config::TRIAL_ANCHOR_FILE;
use crate::licensing::crypto::{StoreCipher, StoreKey};
use crate::licensing::storage::FileStore;
use crate::licensing::types::{LicenseError, TrialAnchor};

const KEY_FIRST_LAUNCH: &str = "first_launch_time";
const KEY_SERVER_FIRST_LAUNCH: &str = "server_first_launch_time";
const KEY_TOKEN: &str = "trial_token";
const KEY_SIGNATURE: &str = "signature";
const KEY_EXPIRES_IN_DAYS: &str = "expires_in_days";
const KEY_EXPIRED: &str = "trial_expired";

/// Encrypted storage of the trial anchor and issued token.
///
/// No defaults are invented here: I/O and decryption failures are returned
/// to the caller.
pub struct TrialAnchorStore {
    store: FileStore,
}

impl TrialAnchorStore {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    /// Open the store in `data_dir`, keyed to this device and app
    pub fn open(data_dir: &Path, device_id: &str, app_id: &str) -> Self {
        let cipher = StoreCipher::new(&StoreKey::derive(device_id, app_id));
        Self::new(FileStore::encrypted(data_dir.join(TRIAL_ANCHOR_FILE), cipher))
    }

    pub fn load(&self) -> Result<TrialAnchor, LicenseError> {
        Ok(TrialAnchor {
            first_launch_time: self.first_launch_time()?,
            trial_token: self.store.get_str(KEY_TOKEN)?,
            trial_signature: self.store.get_str(KEY_SIGNATURE)?,
            trial_duration_days: self.trial_duration_days()?,
            expired: self.is_expired()?,
        })
    }

    /// Server-reported anchor if any, else the local one
    pub fn first_launch_time(&self) -> Result<Option<i64>, LicenseError> {
        let server = self.store.get_i64(KEY_SERVER_FIRST_LAUNCH)?.filter(|t| *t != 0);
        if server.is_some() {
            return Ok(server);
        }
        Ok(self.store.get_i64(KEY_FIRST_LAUNCH)?.filter(|t| *t != 0))
    }

    /// Return the committed anchor, committing `now_millis` if there is none
    pub fn get_or_init_first_launch(&self, now_millis: i64) -> Result<i64, LicenseError> {
        if let Some(anchor) = self.first_launch_time()? {
            return Ok(anchor);
        }
        self.store.set(KEY_FIRST_LAUNCH, now_millis)?;
        log::debug!("Initialized first launch time: {}", now_millis);
        Ok(now_millis)
    }

    /// Record the server's anchor unless one was already committed.
    ///
    /// Returns whether the value was written.
    pub fn commit_server_first_launch(&self, millis: i64) -> Result<bool, LicenseError> {
        if millis == 0 || self.store.get_i64(KEY_SERVER_FIRST_LAUNCH)?.unwrap_or(0) != 0 {
            return Ok(false);
        }
        self.store.set(KEY_SERVER_FIRST_LAUNCH, millis)?;
        Ok(true)
    }

    pub fn save_token(&self, token: &str, signature: &str, duration_days: i64) -> Result<(), LicenseError> {
        self.store.update(|entries| {
            entries.insert(KEY_TOKEN.into(), Value::from(token));
            entries.insert(KEY_SIGNATURE.into(), Value::from(signature));
            entries.insert(KEY_EXPIRES_IN_DAYS.into(), Value::from(duration_days));
        })
    }

    pub fn set_trial_duration_days(&self, days: i64) -> Result<(), LicenseError> {
        self.store.set(KEY_EXPIRES_IN_DAYS, days)
    }

    pub fn trial_duration_days(&self) -> Result<Option<i64>, LicenseError> {
        self.store.get_i64(KEY_EXPIRES_IN_DAYS)
    }

    pub fn has_trial_data(&self) -> Result<bool, LicenseError> {
        Ok(self.trial_duration_days()?.is_some())
    }

    pub fn set_expired(&self, expired: bool) -> Result<(), LicenseError> {
        self.store.set(KEY_EXPIRED, expired)
    }

    pub fn is_expired(&self) -> Result<bool, LicenseError> {
        Ok(self.store.get_bool(KEY_EXPIRED)?.unwrap_or(false))
    }

    pub fn clear(&self) -> Result<(), LicenseError> {
        self.store.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> TrialAnchorStore {
        TrialAnchorStore::open(dir.path(), "device-1", "app")
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let anchor = store(&dir).load().unwrap();
        assert_eq!(anchor, TrialAnchor::default());
        assert!(!store(&dir).has_trial_data().unwrap());
    }

    #[test]
    fn test_local_anchor_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert_eq!(store.get_or_init_first_launch(1_000).unwrap(), 1_000);
        assert_eq!(store.get_or_init_first_launch(5_000).unwrap(), 1_000);
    }

    #[test]
    fn test_server_anchor_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store.get_or_init_first_launch(2_000).unwrap();
        assert!(store.commit_server_first_launch(1_500).unwrap());
        assert_eq!(store.first_launch_time().unwrap(), Some(1_500));
        assert_eq!(store.get_or_init_first_launch(9_000).unwrap(), 1_500);

        // Second server value is ignored
        assert!(!store.commit_server_first_launch(1_800).unwrap());
        assert_eq!(store.first_launch_time().unwrap(), Some(1_500));
    }

    #[test]
    fn test_zero_server_anchor_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(!store.commit_server_first_launch(0).unwrap());
        assert_eq!(store.first_launch_time().unwrap(), None);
    }

    #[test]
    fn test_token_and_flags_persist_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).save_token("tok_1", "sig_1", 14).unwrap();
        store(&dir).set_expired(true).unwrap();

        let anchor = store(&dir).load().unwrap();
        assert_eq!(anchor.trial_token.as_deref(), Some("tok_1"));
        assert_eq!(anchor.trial_signature.as_deref(), Some("sig_1"));
        assert_eq!(anchor.trial_duration_days, Some(14));
        assert!(anchor.expired);
        assert!(anchor.has_token());

        let raw = std::fs::read_to_string(dir.path().join(TRIAL_ANCHOR_FILE)).unwrap();
        assert!(!raw.contains("tok_1"));
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save_token("tok", "sig", 14).unwrap();
        store.get_or_init_first_launch(1).unwrap();

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), TrialAnchor::default());
    }

    #[test]
    fn test_foreign_device_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).save_token("tok", "sig", 14).unwrap();

        let other = TrialAnchorStore::open(dir.path(), "device-2", "app");
        assert!(other.load().is_err());
    }
}

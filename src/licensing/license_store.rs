//! Locally cached license fields and the date arithmetic around them.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use serde_json::Value;
use std::path::Path;

use crate::licensing::config::LICENSE_RECORD_FILE;
use crate::licensing::storage::FileStore;
use crate::licensing::types::{LicenseError, LicenseRecord};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

const KEY_IS_LICENSED: &str = "is_licensed";
const KEY_START_DATE: &str = "license_start_date";
const KEY_END_DATE: &str = "license_end_date";
const KEY_LICENSE_KEY: &str = "license_key";
const KEY_EDITION: &str = "license_edition";
const KEY_CAPABILITIES: &str = "capabilities";
const KEY_LICENSED_TO: &str = "licensed_to";
const KEY_USER_EMAIL: &str = "user_email";

const ALL_KEYS: [&str; 8] = [
    KEY_IS_LICENSED,
    KEY_START_DATE,
    KEY_END_DATE,
    KEY_LICENSE_KEY,
    KEY_EDITION,
    KEY_CAPABILITIES,
    KEY_LICENSED_TO,
    KEY_USER_EMAIL,
];

pub fn parse_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), DATE_FORMAT).ok()
}

/// Normalize a date string to `yyyy-MM-dd`, empty when unparseable
pub fn format_date(date: &str) -> String {
    parse_date(date)
        .map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

/// `start_date + validity_days`, formatted `yyyy-MM-dd`.
///
/// An unparseable start date, or an end date outside chrono's range, returns
/// the input unchanged.
pub fn calculate_end_date(start_date: &str, validity_days: i64) -> String {
    let end = parse_date(start_date)
        .zip(TimeDelta::try_days(validity_days))
        .and_then(|(start, validity)| start.checked_add_signed(validity));
    match end {
        Some(end) => end.format(DATE_FORMAT).to_string(),
        None => {
            if !start_date.is_empty() {
                log::warn!(
                    "calculate_end_date: cannot add {} days to {:?}",
                    validity_days,
                    start_date
                );
            }
            start_date.to_string()
        }
    }
}

/// Whole days between two `yyyy-MM-dd` dates
pub fn days_between(start_date: &str, end_date: &str) -> Option<i64> {
    Some((parse_date(end_date)? - parse_date(start_date)?).num_days())
}

/// 23:59:59 of `date` in the timezone `tz`
pub fn end_of_day<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<DateTime<Tz>> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59)?;
    tz.from_local_datetime(&date.and_time(last_second)).latest()
}

/// A license ending on `end_date` is usable through 23:59:59 of that day,
/// evaluated in `now`'s timezone
pub fn is_valid_through<Tz: TimeZone>(end_date: &str, now: &DateTime<Tz>) -> bool {
    let Some(date) = parse_date(end_date) else {
        return false;
    };
    match end_of_day(date, &now.timezone()) {
        Some(end) => end > *now,
        None => false,
    }
}

/// Durable storage of `LicenseRecord` fields
pub struct LicenseRecordStore {
    store: FileStore,
}

impl LicenseRecordStore {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    pub fn open(data_dir: &Path) -> Self {
        Self::new(FileStore::plain(data_dir.join(LICENSE_RECORD_FILE)))
    }

    pub fn load_record(&self) -> Result<LicenseRecord, LicenseError> {
        let text = |key: &str| -> Result<String, LicenseError> { Ok(self.store.get_str(key)?.unwrap_or_default()) };

        Ok(LicenseRecord {
            is_licensed: self.store.get_bool(KEY_IS_LICENSED)?.unwrap_or(false),
            start_date: text(KEY_START_DATE)?,
            end_date: text(KEY_END_DATE)?,
            license_key: text(KEY_LICENSE_KEY)?,
            edition: text(KEY_EDITION)?,
            capabilities: text(KEY_CAPABILITIES)?,
            licensed_to: text(KEY_LICENSED_TO)?,
            user_email: text(KEY_USER_EMAIL)?,
        })
    }

    pub fn save_record(&self, record: &LicenseRecord) -> Result<(), LicenseError> {
        log::debug!(
            "Saving license record: is_licensed={}, end_date={}, edition={}",
            record.is_licensed,
            record.end_date,
            record.edition
        );
        self.store.update(|entries| {
            entries.insert(KEY_IS_LICENSED.into(), Value::Bool(record.is_licensed));
            entries.insert(KEY_START_DATE.into(), record.start_date.clone().into());
            entries.insert(KEY_END_DATE.into(), record.end_date.clone().into());
            entries.insert(KEY_LICENSE_KEY.into(), record.license_key.clone().into());
            entries.insert(KEY_EDITION.into(), record.edition.clone().into());
            entries.insert(KEY_CAPABILITIES.into(), record.capabilities.clone().into());
            entries.insert(KEY_LICENSED_TO.into(), record.licensed_to.clone().into());
            entries.insert(KEY_USER_EMAIL.into(), record.user_email.clone().into());
        })
    }

    pub fn set_licensed(&self, is_licensed: bool) -> Result<(), LicenseError> {
        self.store.set(KEY_IS_LICENSED, is_licensed)
    }

    pub fn save_license_key(&self, license_key: &str) -> Result<(), LicenseError> {
        self.store.set(KEY_LICENSE_KEY, license_key.trim())
    }

    /// Stored key, `None` when absent or blank
    pub fn license_key(&self) -> Result<Option<String>, LicenseError> {
        Ok(self
            .store
            .get_str(KEY_LICENSE_KEY)?
            .filter(|key| !key.trim().is_empty()))
    }

    /// Stored flag AND end date not yet past (end-of-day semantics)
    pub fn is_licensed<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<bool, LicenseError> {
        if !self.store.get_bool(KEY_IS_LICENSED)?.unwrap_or(false) {
            return Ok(false);
        }
        let Some(end_date) = self.store.get_str(KEY_END_DATE)? else {
            return Ok(false);
        };
        Ok(is_valid_through(&end_date, now))
    }

    /// Fails with `Expired` / `NotConfigured` when the cached license is unusable
    pub fn require_active<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<LicenseRecord, LicenseError> {
        let record = self.load_record()?;
        if record.license_key.is_empty() {
            return Err(LicenseError::NotConfigured);
        }
        if !record.is_licensed || !is_valid_through(&record.end_date, now) {
            return Err(LicenseError::Expired(record.end_date));
        }
        Ok(record)
    }

    pub fn clear(&self) -> Result<(), LicenseError> {
        log::debug!("Clearing license record");
        self.store.update(|entries| {
            for key in ALL_KEYS {
                entries.remove(key);
            }
        })
    }
}

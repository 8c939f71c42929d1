use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::licensing::crypto::StoreCipher;
use crate::licensing::types::LicenseError;

type Entries = Map<String, Value>;

/// Durable key/value file.
///
/// The whole map is rewritten on every update (temp file + rename) and kept
/// cached in memory. With a cipher the file holds base64 of the sealed JSON.
pub struct FileStore {
    path: PathBuf,
    cipher: Option<StoreCipher>,
    cache: Mutex<Option<Entries>>,
}

impl FileStore {
    pub fn plain(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cipher: None,
            cache: Mutex::new(None),
        }
    }

    pub fn encrypted(path: impl Into<PathBuf>, cipher: StoreCipher) -> Self {
        Self {
            path: path.into(),
            cipher: Some(cipher),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, LicenseError> {
        let mut cache = self.lock()?;
        let entries = self.loaded(&mut cache)?;
        Ok(entries.get(key).cloned())
    }

    pub fn get_str(&self, key: &str) -> Result<Option<String>, LicenseError> {
        Ok(self.get(key)?.and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, LicenseError> {
        Ok(self.get(key)?.and_then(|v| v.as_i64()))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, LicenseError> {
        Ok(self.get(key)?.and_then(|v| v.as_bool()))
    }

    /// Apply several edits as one write
    pub fn update<F>(&self, edit: F) -> Result<(), LicenseError>
    where
        F: FnOnce(&mut Entries),
    {
        let mut cache = self.lock()?;
        let mut entries = self.loaded(&mut cache)?.clone();
        edit(&mut entries);
        self.write_file(&entries)?;
        *cache = Some(entries);
        Ok(())
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), LicenseError> {
        let value = value.into();
        self.update(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    /// Delete the file and forget the cache
    pub fn clear(&self) -> Result<(), LicenseError> {
        let mut cache = self.lock()?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .map_err(|e| LicenseError::Storage(format!("Failed to delete {}: {}", self.path.display(), e)))?;
        }
        *cache = Some(Entries::new());
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Entries>>, LicenseError> {
        self.cache
            .lock()
            .map_err(|_| LicenseError::Storage("store cache lock poisoned".to_string()))
    }

    fn loaded<'a>(&self, cache: &'a mut Option<Entries>) -> Result<&'a Entries, LicenseError> {
        if cache.is_none() {
            *cache = Some(self.read_file()?);
        }
        Ok(cache.get_or_insert_with(Entries::new))
    }

    fn read_file(&self) -> Result<Entries, LicenseError> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }

        let contents = std::fs::read(&self.path)
            .map_err(|e| LicenseError::Storage(format!("Failed to read {}: {}", self.path.display(), e)))?;

        let json = match &self.cipher {
            Some(cipher) => {
                let sealed = STANDARD
                    .decode(contents.trim_ascii())
                    .map_err(|e| LicenseError::Storage(format!("Corrupt store {}: {}", self.path.display(), e)))?;
                cipher.open(&sealed)?
            }
            None => contents,
        };

        serde_json::from_slice(&json)
            .map_err(|e| LicenseError::Storage(format!("Failed to parse {}: {}", self.path.display(), e)))
    }

    fn write_file(&self, entries: &Entries) -> Result<(), LicenseError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LicenseError::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| LicenseError::Storage(format!("Failed to serialize store: {}", e)))?;

        let bytes = match &self.cipher {
            Some(cipher) => STANDARD.encode(cipher.seal(&json)?).into_bytes(),
            None => json,
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)
            .map_err(|e| LicenseError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| LicenseError::Storage(format!("Failed to replace {}: {}", self.path.display(), e)))?;

        Ok(())
    }
}

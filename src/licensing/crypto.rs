//! At-rest encryption for the trial store.
//!
//! ChaCha20-Poly1305 with a key derived from device-bound material. This
//! keeps casual edits out of the trial file; it is not a defence against a
//! privileged attacker who can read the same inputs.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::licensing::types::LicenseError;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_CONTEXT: &[u8] = b"eligibility-trial-store-v1";

/// 256-bit store key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey {
    bytes: [u8; 32],
}

impl StoreKey {
    /// Derive a key from device id and app id
    pub fn derive(device_id: &str, app_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(device_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(app_id.as_bytes());

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self { bytes }
    }
}

pub struct StoreCipher {
    cipher: ChaCha20Poly1305,
}

impl StoreCipher {
    pub fn new(key: &StoreKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.bytes)),
        }
    }

    /// Encrypt to `nonce || ciphertext+tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, LicenseError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| LicenseError::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, LicenseError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(LicenseError::Crypto("invalid encrypted data format".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LicenseError::Crypto("decryption failed: authentication tag mismatch".to_string()))
    }
}

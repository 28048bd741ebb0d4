//! Database encryption key

use crate::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Length in bytes of a store encryption key
pub const KEY_LENGTH: usize = 32;

/// Encryption key for the store file.
///
/// Never written anywhere but the credential store; dropped (and zeroed)
/// once the store connections are open.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LENGTH]>);

impl EncryptionKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Create from raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Create from raw key bytes slice
    pub fn from_bytes_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::Encryption(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// SQLCipher raw-key literal (`x'…'`), bypassing its passphrase KDF
    pub(crate) fn sqlcipher_literal(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("x'{}'", hex::encode(&self.0[..])))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

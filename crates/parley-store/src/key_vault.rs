//! Store key lifecycle on top of a [`CredentialStore`]

use crate::encryption::{EncryptionKey, KEY_LENGTH};
use crate::identity::Identity;
use crate::keystore::{Accessibility, CredentialRead, CredentialStore};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Whether the key for an identity can be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAccess {
    /// Key present and readable
    Unlocked,
    /// Credential store is locked; retry after device unlock
    Locked,
    /// No key stored for this identity
    Absent,
}

/// Derives, stores and retrieves store encryption keys.
///
/// Never touches store files; every operation goes through the credential
/// store only.
#[derive(Clone)]
pub struct KeyVault {
    credentials: Arc<dyn CredentialStore>,
    generation: Arc<Mutex<()>>,
}

impl KeyVault {
    /// Create a vault over a credential store
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            generation: Arc::new(Mutex::new(())),
        }
    }

    /// Capability check that treats a locked device as data.
    ///
    /// A corrupted entry reports `Err`; locked reports `Ok(KeyAccess::Locked)`.
    pub fn access(&self, identity: &Identity) -> Result<KeyAccess> {
        Ok(match self.credentials.read(&identity.key_name())? {
            CredentialRead::Found(_) => KeyAccess::Unlocked,
            CredentialRead::Locked => KeyAccess::Locked,
            CredentialRead::Missing => KeyAccess::Absent,
        })
    }

    /// Same as [`access`](Self::access), for the key kept with a backup.
    /// A malformed entry also reports `Err`.
    pub fn archived_access(&self, identity: &Identity) -> Result<KeyAccess> {
        let backup_name = identity.backup_key_name();
        Ok(match self.credentials.read(&backup_name)? {
            CredentialRead::Found(bytes) => {
                decode_key(&backup_name, &bytes)?;
                KeyAccess::Unlocked
            }
            CredentialRead::Locked => KeyAccess::Locked,
            CredentialRead::Missing => KeyAccess::Absent,
        })
    }

    /// True iff a key exists and is readable now
    pub fn is_key_accessible(&self, identity: &Identity) -> bool {
        match self.access(identity) {
            Ok(KeyAccess::Unlocked) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Key for {} not accessible: {}", identity, e);
                false
            }
        }
    }

    /// Return the identity's key, generating and persisting one if absent.
    ///
    /// A generated key is read back before it is returned, so a caller never
    /// opens a store with a key the credential store did not keep.
    pub fn key_for(&self, identity: &Identity) -> Result<EncryptionKey> {
        let _generation = self.generation.lock();
        let name = identity.key_name();

        match self.credentials.read(&name)? {
            CredentialRead::Found(bytes) => return decode_key(&name, &bytes),
            CredentialRead::Locked => {
                return Err(Error::KeyLocked(format!("key for {} unavailable until unlock", identity)))
            }
            CredentialRead::Missing => {}
        }

        tracing::info!("Generating new store key for {}", identity);
        let key = EncryptionKey::generate();
        self.credentials
            .write(&name, key.as_bytes(), Accessibility::AfterFirstUnlockThisDeviceOnly)
            .map_err(|e| match e {
                Error::KeyLocked(_) | Error::KeyStoreUnwritable(_) => e,
                other => Error::KeyStoreUnwritable(other.to_string()),
            })?;

        match self.credentials.read(&name)? {
            CredentialRead::Found(bytes) if bytes.as_slice() == key.as_bytes() => Ok(key),
            _ => Err(Error::KeyStoreUnwritable(format!(
                "key for {} did not persist",
                identity
            ))),
        }
    }

    /// Remove the identity's live key
    pub fn delete_key(&self, identity: &Identity) -> Result<()> {
        let _generation = self.generation.lock();
        self.credentials.delete(&identity.key_name())
    }

    /// Discard the current (possibly corrupted) key and generate a new one.
    ///
    /// Data encrypted under the old key becomes unreadable.
    pub fn regenerate_key(&self, identity: &Identity) -> Result<EncryptionKey> {
        tracing::warn!("Regenerating store key for {}", identity);
        self.delete_key(identity)?;
        self.key_for(identity)
    }

    /// Move the live key into the backup slot and delete the live entry
    pub fn archive_key(&self, identity: &Identity) -> Result<()> {
        let _generation = self.generation.lock();
        let name = identity.key_name();
        match self.credentials.read(&name)? {
            CredentialRead::Found(bytes) => {
                self.credentials.write(
                    &identity.backup_key_name(),
                    &bytes,
                    Accessibility::AfterFirstUnlockThisDeviceOnly,
                )?;
                self.credentials.delete(&name)
            }
            CredentialRead::Missing => Err(Error::NotFound(format!("no key for {}", identity))),
            CredentialRead::Locked => Err(Error::KeyLocked(format!("key for {} unavailable", identity))),
        }
    }

    /// Move a backup key back into the live slot.
    ///
    /// Returns `false` when no backup key exists.
    pub fn restore_archived_key(&self, identity: &Identity) -> Result<bool> {
        let _generation = self.generation.lock();
        let backup_name = identity.backup_key_name();
        match self.credentials.read(&backup_name)? {
            CredentialRead::Found(bytes) => {
                decode_key(&backup_name, &bytes)?;
                self.credentials.write(
                    &identity.key_name(),
                    &bytes,
                    Accessibility::AfterFirstUnlockThisDeviceOnly,
                )?;
                self.credentials.delete(&backup_name)?;
                Ok(true)
            }
            CredentialRead::Missing => Ok(false),
            CredentialRead::Locked => Err(Error::KeyLocked(format!(
                "backup key for {} unavailable",
                identity
            ))),
        }
    }

    /// Remove the backup key, if any
    pub fn delete_archived_key(&self, identity: &Identity) -> Result<()> {
        self.credentials.delete(&identity.backup_key_name())
    }
}

fn decode_key(name: &str, bytes: &[u8]) -> Result<EncryptionKey> {
    if bytes.len() != KEY_LENGTH {
        return Err(Error::KeyStoreCorrupted(format!(
            "entry '{}' holds {} bytes, expected {}",
            name,
            bytes.len(),
            KEY_LENGTH
        )));
    }
    EncryptionKey::from_bytes_slice(bytes)
}

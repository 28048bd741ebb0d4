//! Platform credential store integration
//!
//! The store encryption key lives only in a platform-secured credential
//! store (Keychain, Android Keystore, libsecret, DPAPI). This module defines
//! the seam those bridges implement plus two in-crate backends:
//! - [`MemoryCredentialStore`]: process-local, with a simulated device lock
//! - [`FileCredentialStore`]: sealed entries on disk, unlocked by passphrase

use crate::security::{generate_salt, hash_sha256, KdfParams, SealingAlgorithm, SealingKey};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// When a stored credential may be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessibility {
    /// Readable once the device has been unlocked after boot; never synced
    /// or migrated to another device
    AfterFirstUnlockThisDeviceOnly,
    /// Readable only while the device is unlocked
    WhenUnlocked,
}

/// Device lock state as seen by the credential store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLockState {
    /// Not unlocked since boot; no credentials readable
    BeforeFirstUnlock,
    /// Unlocked at least once, currently locked
    Locked,
    /// Unlocked
    Unlocked,
}

impl DeviceLockState {
    /// Whether a credential with `accessibility` is readable in this state
    pub fn permits(self, accessibility: Accessibility) -> bool {
        match (self, accessibility) {
            (DeviceLockState::BeforeFirstUnlock, _) => false,
            (DeviceLockState::Locked, Accessibility::AfterFirstUnlockThisDeviceOnly) => true,
            (DeviceLockState::Locked, Accessibility::WhenUnlocked) => false,
            (DeviceLockState::Unlocked, _) => true,
        }
    }
}

/// Outcome of reading a credential
pub enum CredentialRead {
    /// Credential present and readable
    Found(Zeroizing<Vec<u8>>),
    /// No credential under that name
    Missing,
    /// Credential may exist but the device lock state hides it
    Locked,
}

impl std::fmt::Debug for CredentialRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialRead::Found(secret) => write!(f, "Found(<{} bytes>)", secret.len()),
            CredentialRead::Missing => f.write_str("Missing"),
            CredentialRead::Locked => f.write_str("Locked"),
        }
    }
}

/// Platform credential store abstraction.
///
/// Implementations report "not readable because locked" as
/// [`CredentialRead::Locked`], never as an error. Errors are reserved for
/// hard failures: a corrupted entry is [`Error::KeyStoreCorrupted`], a
/// rejected write is [`Error::KeyStoreUnwritable`].
pub trait CredentialStore: Send + Sync {
    /// Current lock state
    fn lock_state(&self) -> DeviceLockState;

    /// Read a credential
    fn read(&self, name: &str) -> Result<CredentialRead>;

    /// Create or replace a credential
    fn write(&self, name: &str, secret: &[u8], accessibility: Accessibility) -> Result<()>;

    /// Delete a credential; deleting a missing credential is not an error
    fn delete(&self, name: &str) -> Result<()>;
}

struct MemoryEntry {
    secret: Zeroizing<Vec<u8>>,
    accessibility: Accessibility,
    corrupted: bool,
}

struct MemoryState {
    lock_state: DeviceLockState,
    writable: bool,
    entries: HashMap<String, MemoryEntry>,
}

/// In-memory credential store for tests and platforms without native integration
pub struct MemoryCredentialStore {
    state: RwLock<MemoryState>,
}

impl MemoryCredentialStore {
    /// Create an unlocked, empty store
    pub fn new() -> Self {
        Self::with_lock_state(DeviceLockState::Unlocked)
    }

    /// Create with a given lock state
    pub fn with_lock_state(lock_state: DeviceLockState) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                lock_state,
                writable: true,
                entries: HashMap::new(),
            }),
        }
    }

    /// Simulate the device changing lock state
    pub fn set_lock_state(&self, lock_state: DeviceLockState) {
        self.state.write().lock_state = lock_state;
    }

    /// Make subsequent writes fail
    pub fn set_writable(&self, writable: bool) {
        self.state.write().writable = writable;
    }

    /// Mark an entry as damaged; reads of it then fail
    pub fn corrupt(&self, name: &str) {
        if let Some(entry) = self.state.write().entries.get_mut(name) {
            entry.corrupted = true;
        }
    }

    /// Whether an entry exists, regardless of lock state
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().entries.contains_key(name)
    }

    /// Accessibility an entry was written with
    pub fn accessibility_of(&self, name: &str) -> Option<Accessibility> {
        self.state.read().entries.get(name).map(|e| e.accessibility)
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn lock_state(&self) -> DeviceLockState {
        self.state.read().lock_state
    }

    fn read(&self, name: &str) -> Result<CredentialRead> {
        let state = self.state.read();
        let Some(entry) = state.entries.get(name) else {
            return Ok(if state.lock_state == DeviceLockState::BeforeFirstUnlock {
                CredentialRead::Locked
            } else {
                CredentialRead::Missing
            });
        };
        if !state.lock_state.permits(entry.accessibility) {
            return Ok(CredentialRead::Locked);
        }
        if entry.corrupted {
            return Err(Error::KeyStoreCorrupted(format!("entry '{}' is unreadable", name)));
        }
        Ok(CredentialRead::Found(entry.secret.clone()))
    }

    fn write(&self, name: &str, secret: &[u8], accessibility: Accessibility) -> Result<()> {
        let mut state = self.state.write();
        if !state.writable {
            return Err(Error::KeyStoreUnwritable(format!("cannot store '{}'", name)));
        }
        if state.lock_state == DeviceLockState::BeforeFirstUnlock {
            return Err(Error::KeyLocked("device not unlocked since boot".to_string()));
        }
        state.entries.insert(
            name.to_string(),
            MemoryEntry {
                secret: Zeroizing::new(secret.to_vec()),
                accessibility,
                corrupted: false,
            },
        );
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.state.write().entries.remove(name);
        Ok(())
    }
}

/// File name of the salt used to derive the wrapping key
const SALT_FILE: &str = "vault.salt";

/// Extension of sealed credential files
const ENTRY_EXTENSION: &str = "sealed";

/// Credential store that keeps each secret sealed in its own file.
///
/// The wrapping key is derived from a device passphrase with Argon2id and
/// exists only in memory between [`FileCredentialStore::unlock`] and
/// [`FileCredentialStore::lock`]. Until then every read reports `Locked`.
pub struct FileCredentialStore {
    dir: PathBuf,
    params: KdfParams,
    algorithm: SealingAlgorithm,
    wrapping_key: RwLock<Option<SealingKey>>,
}

impl FileCredentialStore {
    /// Create a locked store rooted at `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self::with_params(dir, KdfParams::default(), SealingAlgorithm::ChaCha20Poly1305)
    }

    /// Create with explicit KDF cost and sealing algorithm
    pub fn with_params<P: AsRef<Path>>(dir: P, params: KdfParams, algorithm: SealingAlgorithm) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            params,
            algorithm,
            wrapping_key: RwLock::new(None),
        }
    }

    /// Derive the wrapping key from `passphrase`, creating the salt on first use
    pub fn unlock(&self, passphrase: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let salt_path = self.dir.join(SALT_FILE);
        let salt = match fs::read(&salt_path) {
            Ok(salt) if salt.len() == 32 => salt,
            Ok(salt) => {
                return Err(Error::KeyStoreCorrupted(format!(
                    "invalid salt length {} in {}",
                    salt.len(),
                    salt_path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let salt = generate_salt();
                fs::write(&salt_path, salt)
                    .map_err(|e| Error::KeyStoreUnwritable(format!("cannot write salt: {}", e)))?;
                salt.to_vec()
            }
            Err(e) => return Err(e.into()),
        };

        let key = SealingKey::from_passphrase(passphrase, &salt, self.params, self.algorithm)?;
        *self.wrapping_key.write() = Some(key);
        tracing::debug!("Credential store unlocked at {}", self.dir.display());
        Ok(())
    }

    /// Forget the wrapping key
    pub fn lock(&self) {
        *self.wrapping_key.write() = None;
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        let digest = hash_sha256(name.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(&digest[..16]), ENTRY_EXTENSION))
    }
}

impl CredentialStore for FileCredentialStore {
    fn lock_state(&self) -> DeviceLockState {
        if self.wrapping_key.read().is_some() {
            DeviceLockState::Unlocked
        } else {
            DeviceLockState::BeforeFirstUnlock
        }
    }

    fn read(&self, name: &str) -> Result<CredentialRead> {
        let guard = self.wrapping_key.read();
        let Some(key) = guard.as_ref() else {
            return Ok(CredentialRead::Locked);
        };
        let sealed = match fs::read(self.entry_path(name)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CredentialRead::Missing),
            Err(e) => return Err(e.into()),
        };
        // A wrong passphrase also lands here: the entry cannot be opened
        // with the current wrapping key.
        let secret = key
            .open(&sealed)
            .map_err(|e| Error::KeyStoreCorrupted(format!("entry '{}': {}", name, e)))?;
        Ok(CredentialRead::Found(secret))
    }

    fn write(&self, name: &str, secret: &[u8], _accessibility: Accessibility) -> Result<()> {
        let guard = self.wrapping_key.read();
        let Some(key) = guard.as_ref() else {
            return Err(Error::KeyLocked("credential store not unlocked".to_string()));
        };
        let sealed = key.seal(secret)?;
        let path = self.entry_path(name);
        let staging = path.with_extension(format!("{}.tmp", ENTRY_EXTENSION));
        fs::write(&staging, &sealed)
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|e| Error::KeyStoreUnwritable(format!("cannot persist '{}': {}", name, e)))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            m_cost: 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn test_lock_state_permits() {
        use Accessibility::*;
        assert!(!DeviceLockState::BeforeFirstUnlock.permits(AfterFirstUnlockThisDeviceOnly));
        assert!(DeviceLockState::Locked.permits(AfterFirstUnlockThisDeviceOnly));
        assert!(!DeviceLockState::Locked.permits(WhenUnlocked));
        assert!(DeviceLockState::Unlocked.permits(WhenUnlocked));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        store
            .write("k", b"secret", Accessibility::AfterFirstUnlockThisDeviceOnly)
            .unwrap();
        match store.read("k").unwrap() {
            CredentialRead::Found(secret) => assert_eq!(secret.as_slice(), b"secret"),
            other => panic!("unexpected read: {:?}", other),
        }
        store.delete("k").unwrap();
        assert!(matches!(store.read("k").unwrap(), CredentialRead::Missing));
    }

    #[test]
    fn test_memory_store_locked_before_first_unlock() {
        let store = MemoryCredentialStore::new();
        store
            .write("k", b"secret", Accessibility::AfterFirstUnlockThisDeviceOnly)
            .unwrap();
        store.set_lock_state(DeviceLockState::BeforeFirstUnlock);
        assert!(matches!(store.read("k").unwrap(), CredentialRead::Locked));
        store.set_lock_state(DeviceLockState::Locked);
        assert!(matches!(store.read("k").unwrap(), CredentialRead::Found(_)));
    }

    #[test]
    fn test_memory_store_corruption_is_error() {
        let store = MemoryCredentialStore::new();
        store.write("k", b"x", Accessibility::WhenUnlocked).unwrap();
        store.corrupt("k");
        assert!(matches!(store.read("k"), Err(Error::KeyStoreCorrupted(_))));
    }

    #[test]
    fn test_file_store_locked_until_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::with_params(dir.path(), fast_params(), SealingAlgorithm::AesGcm);
        assert!(matches!(store.read("k").unwrap(), CredentialRead::Locked));
        assert!(matches!(
            store.write("k", b"x", Accessibility::AfterFirstUnlockThisDeviceOnly),
            Err(Error::KeyLocked(_))
        ));

        store.unlock("device passphrase").unwrap();
        assert!(matches!(store.read("k").unwrap(), CredentialRead::Missing));
        store
            .write("k", b"sealed secret", Accessibility::AfterFirstUnlockThisDeviceOnly)
            .unwrap();

        let on_disk = fs::read(store.entry_path("k")).unwrap();
        assert!(!String::from_utf8_lossy(&on_disk).contains("sealed secret"));

        store.lock();
        assert!(matches!(store.read("k").unwrap(), CredentialRead::Locked));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCredentialStore::with_params(dir.path(), fast_params(), SealingAlgorithm::ChaCha20Poly1305);
            store.unlock("pw").unwrap();
            store.write("k", b"persisted", Accessibility::WhenUnlocked).unwrap();
        }
        let store = FileCredentialStore::with_params(dir.path(), fast_params(), SealingAlgorithm::ChaCha20Poly1305);
        store.unlock("pw").unwrap();
        match store.read("k").unwrap() {
            CredentialRead::Found(secret) => assert_eq!(secret.as_slice(), b"persisted"),
            other => panic!("unexpected read: {:?}", other),
        }
    }

    #[test]
    fn test_file_store_wrong_passphrase_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::with_params(dir.path(), fast_params(), SealingAlgorithm::ChaCha20Poly1305);
        store.unlock("right").unwrap();
        store.write("k", b"x", Accessibility::WhenUnlocked).unwrap();
        store.unlock("wrong").unwrap();
        assert!(matches!(store.read("k"), Err(Error::KeyStoreCorrupted(_))));
    }
}

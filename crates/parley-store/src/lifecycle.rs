//! Session lifecycle: open, backup, restore and wipe of the store file
//!
//! ```text
//! Uninitialized ──open_or_create──► Opening ──► Ready
//!                                      │
//!                                      └──────► Failed(reason)
//! ```
//!
//! The lifecycle is the only owner of the store file and its companions.
//! [`ObjectStore`] handles it produces never touch the filesystem.

use crate::config::StoreConfig;
use crate::database::{is_incompatible_store, Database};
use crate::files::{prepare_backup_dir, StoreFiles};
use crate::identity::Identity;
use crate::key_vault::{KeyAccess, KeyVault};
use crate::store::ObjectStore;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle state of the session store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// No store open
    Uninitialized,
    /// Open in progress
    Opening,
    /// Store open and writable
    Ready,
    /// Last open failed; the session is not initialized
    Failed(String),
}

/// Decides whether a session's identity has been confirmed.
///
/// Confirmed sessions are backed up on wipe; unconfirmed ones are deleted.
pub trait SessionVerifier: Send + Sync {
    /// Whether `identity` is verified
    fn is_confirmed(&self, identity: &Identity) -> bool;
}

impl<F> SessionVerifier for F
where
    F: Fn(&Identity) -> bool + Send + Sync,
{
    fn is_confirmed(&self, identity: &Identity) -> bool {
        self(identity)
    }
}

/// What `wipe_and_backup` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WipeOutcome {
    /// Store, companions and key deleted
    Deleted,
    /// Store moved to the backup directory; key archived with it
    BackedUp {
        /// Main backup file
        path: PathBuf,
    },
    /// Backup could not be made; store and key left in place
    BackupFailed {
        /// Why
        reason: String,
    },
}

struct Session {
    identity: Identity,
    store: ObjectStore,
}

/// Opens, backs up, restores and wipes the store for one installation
pub struct DatabaseLifecycle {
    config: StoreConfig,
    vault: KeyVault,
    verifier: Arc<dyn SessionVerifier>,
    state: RwLock<LifecycleState>,
    session: Mutex<Option<Session>>,
}

impl DatabaseLifecycle {
    /// Lifecycle over `config`'s directories
    pub fn new(config: StoreConfig, vault: KeyVault, verifier: Arc<dyn SessionVerifier>) -> Self {
        Self {
            config,
            vault,
            verifier,
            state: RwLock::new(LifecycleState::Uninitialized),
            session: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state.read().clone()
    }

    fn set_state(&self, state: LifecycleState) {
        tracing::debug!("Lifecycle state -> {:?}", state);
        *self.state.write() = state;
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Key vault used for store keys
    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    /// Open store, if the session is ready
    pub fn store(&self) -> Option<ObjectStore> {
        self.session.lock().as_ref().map(|s| s.store.clone())
    }

    fn live_files(&self) -> StoreFiles {
        StoreFiles::new(self.config.store_path())
    }

    fn backup_files(&self, identity: &Identity) -> StoreFiles {
        StoreFiles::new(
            self.config
                .backup_dir
                .join(format!("{}.sqlite", identity.file_stem())),
        )
    }

    /// Whether a backup exists for `identity`
    pub fn has_backup(&self, identity: &Identity) -> bool {
        self.backup_files(identity).exists()
    }

    /// Whether the live store file exists and belongs to `identity`
    pub fn owns_live_store(&self, identity: &Identity) -> Result<bool> {
        let live = self.live_files();
        Ok(live.exists() && live.owner_tag()?.as_deref() == Some(identity.owner_tag().as_str()))
    }

    /// Refuse to touch a live store that belongs to someone else.
    ///
    /// A missing store is free; a store without an owner record is treated
    /// as foreign.
    fn check_live_owner(&self, identity: &Identity) -> Result<()> {
        let live = self.live_files();
        if !live.exists() || self.owns_live_store(identity)? {
            return Ok(());
        }
        Err(Error::Lifecycle(format!(
            "store at {} does not belong to {}",
            live.main.display(),
            identity
        )))
    }

    /// Open the store for `identity`, creating it on first use.
    ///
    /// A backup for `identity` is restored first. Calling again for the
    /// identity that is already open returns the same store; a different
    /// identity must be wiped or closed first, and a live store file left by
    /// another identity is never opened or replaced. Failure leaves the
    /// state at [`LifecycleState::Failed`] and may be retried.
    pub fn open_or_create(&self, identity: &Identity) -> Result<ObjectStore> {
        let mut session = self.session.lock();
        if let Some(current) = session.as_ref() {
            if current.identity == *identity {
                return Ok(current.store.clone());
            }
            return Err(Error::Lifecycle(format!(
                "store is open for {}; close or wipe it before opening {}",
                current.identity, identity
            )));
        }

        self.set_state(LifecycleState::Opening);
        tracing::info!("Opening store for {}", identity);

        let opened = self.check_live_owner(identity).and_then(|()| {
            if self.has_backup(identity) {
                self.restore_backup(identity)?;
            }
            self.open_store(identity)
        });

        match opened {
            Ok(store) => {
                *session = Some(Session {
                    identity: identity.clone(),
                    store: store.clone(),
                });
                self.set_state(LifecycleState::Ready);
                tracing::info!("Store ready for {}", identity);
                Ok(store)
            }
            Err(e) => {
                tracing::error!("Failed to open store for {}: {}", identity, e);
                self.set_state(LifecycleState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Move the identity's backup into the live path and bring its key back.
    ///
    /// Nothing moves while the backup key is locked. If the key cannot be
    /// brought back after the move, the files go back to the backup path.
    fn restore_backup(&self, identity: &Identity) -> Result<()> {
        match self.vault.archived_access(identity) {
            Ok(KeyAccess::Locked) => {
                return Err(Error::KeyLocked(format!(
                    "backup key for {} unavailable until unlock",
                    identity
                )))
            }
            Ok(_) => {}
            Err(Error::KeyStoreCorrupted(reason)) => {
                // The backup can never be decrypted; let the open start fresh
                tracing::error!("Backup key for {} corrupted ({}), discarding it", identity, reason);
                self.vault.delete_archived_key(identity)?;
            }
            Err(e) => return Err(e),
        }

        tracing::info!("Restoring backup for {}", identity);
        let backup = self.backup_files(identity);
        let live = self.live_files();

        fs::create_dir_all(&self.config.data_dir)?;
        // Only stale companions or this identity's own store can be here
        live.remove()?;
        backup.move_to(&live)?;

        let restored = live
            .write_owner_tag(&identity.owner_tag())
            .and_then(|()| self.vault.restore_archived_key(identity));
        match restored {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!("Backup for {} has no archived key", identity);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Restore for {} failed, keeping the backup: {}", identity, e);
                if let Err(undo) = live.move_to(&backup) {
                    tracing::error!("Failed to move restored files back to backup: {}", undo);
                }
                Err(e)
            }
        }
    }

    fn open_store(&self, identity: &Identity) -> Result<ObjectStore> {
        let key = match self.vault.key_for(identity) {
            Ok(key) => key,
            Err(Error::KeyStoreCorrupted(reason)) => {
                tracing::warn!("Key for {} corrupted ({}), regenerating", identity, reason);
                self.vault.regenerate_key(identity)?
            }
            Err(e) => return Err(e),
        };

        fs::create_dir_all(&self.config.data_dir)?;
        let files = self.live_files();
        if !files.exists() {
            files.remove()?;
            files.write_owner_tag(&identity.owner_tag())?;
        }
        let options = &self.config.options;

        let database = match Database::open(&files.main, &key, options) {
            Ok(db) => db,
            Err(e) if is_incompatible_store(&e) => {
                // Owner already checked: this is the identity's own store,
                // unreadable with its current key
                tracing::warn!(
                    "Existing store at {} is unreadable ({}), creating a fresh one",
                    files.main.display(),
                    e
                );
                files.remove()?;
                files.write_owner_tag(&identity.owner_tag())?;
                Database::open(&files.main, &key, options)?
            }
            Err(Error::Database(e)) => {
                return Err(Error::StoreUnusable(format!(
                    "{}: {}",
                    files.main.display(),
                    e
                )))
            }
            Err(e) => return Err(e),
        };
        drop(key);

        ObjectStore::open(database, options)
    }

    fn shutdown_session(&self, session: Option<Session>) {
        if let Some(current) = &session {
            // Waits for the write in flight; queued writes are dropped
            if let Err(e) = current.store.shutdown() {
                tracing::warn!("Store for {} did not shut down cleanly: {}", current.identity, e);
            }
            tracing::info!("Closed store for {}", current.identity);
        }
        self.set_state(LifecycleState::Uninitialized);
    }

    /// Close the store without deleting anything
    pub fn close(&self) {
        let session = self.session.lock().take();
        self.shutdown_session(session);
    }

    /// Tear down the session for `identity`.
    ///
    /// Unconfirmed: delete the store, its companions and the key.
    /// Confirmed: move the store to the backup directory and archive the key
    /// with it, for a later [`open_or_create`](Self::open_or_create).
    /// Waits for any write in flight before touching files. A failed backup
    /// is logged and reported as [`WipeOutcome::BackupFailed`].
    ///
    /// Fails with [`Error::Lifecycle`], touching nothing, when the open
    /// session or the live store file belongs to another identity.
    pub fn wipe_and_backup(&self, identity: &Identity, confirmed: bool) -> Result<WipeOutcome> {
        let session = {
            let mut slot = self.session.lock();
            if let Some(current) = slot.as_ref() {
                if current.identity != *identity {
                    return Err(Error::Lifecycle(format!(
                        "store is open for {}, not {}",
                        current.identity, identity
                    )));
                }
            }
            self.check_live_owner(identity)?;
            slot.take()
        };
        self.shutdown_session(session);
        let live = self.live_files();

        if !confirmed {
            tracing::info!("Deleting unconfirmed session store for {}", identity);
            live.remove()?;
            self.vault.delete_key(identity)?;
            return Ok(WipeOutcome::Deleted);
        }

        let backup = self.backup_files(identity);
        match self.backup(identity, &live, &backup) {
            Ok(()) => {
                tracing::info!("Backed up store for {} to {}", identity, backup.main.display());
                Ok(WipeOutcome::BackedUp { path: backup.main })
            }
            Err(e) => {
                tracing::error!("Backup for {} failed, store left in place: {}", identity, e);
                Ok(WipeOutcome::BackupFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn backup(&self, identity: &Identity, live: &StoreFiles, backup: &StoreFiles) -> Result<()> {
        if !live.exists() {
            return Err(Error::NotFound(format!("no store file at {}", live.main.display())));
        }
        prepare_backup_dir(&self.config.backup_dir)?;
        backup.remove()?;
        live.move_to(backup)?;

        if let Err(e) = self.vault.archive_key(identity) {
            if let Err(undo) = backup.move_to(live) {
                tracing::error!("Failed to move backup back after key error: {}", undo);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Wipe the session, asking the injected verifier whether it is confirmed
    pub fn wipe_session(&self, identity: &Identity) -> Result<WipeOutcome> {
        let confirmed = self.verifier.is_confirmed(identity);
        self.wipe_and_backup(identity, confirmed)
    }
}

impl std::fmt::Debug for DatabaseLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseLifecycle")
            .field("store_path", &self.config.store_path())
            .field("state", &self.state())
            .finish()
    }
}

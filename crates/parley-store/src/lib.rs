//! Encrypted local document store for conversation state
//!
//! Collection-scoped key/value documents in a SQLCipher database, with
//! snapshot reads, serialized read-write transactions, and live ordered
//! views kept in sync through per-store change notifications.
//!
//! ## Components
//!
//! - **KeyVault**: store keys in a platform credential store, scoped to
//!   device-unlock state
//! - **DatabaseLifecycle**: open/create, backup-before-wipe and
//!   restore-before-open of the store file and its WAL/SHM companions
//! - **ObjectStore**: snapshots, read-write transactions, typed accessors
//! - **OrderedViewIndex**: grouped, sorted projections updated incrementally
//! - **ChangeNotifier**: commit-ordered change sets and observer cursors
//!
//! ## Security
//!
//! - **Database Encryption**: SQLCipher page encryption with a random 256-bit key
//! - **Key Storage**: keys never touch the store or backup files
//! - **Desktop Credentials**: ChaCha20-Poly1305 / AES-256-GCM sealed entries,
//!   Argon2id wrapping key (64 MiB, 3 iterations, 4 lanes)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod database;
pub mod document;
pub mod encryption;
pub mod error;
pub mod files;
pub mod identity;
pub mod key_vault;
pub mod keystore;
pub mod lifecycle;
pub mod migrations;
pub mod notifier;
pub mod retry;
pub mod security;
pub mod store;
pub mod view;

pub use config::{StoreConfig, StoreOptions, BACKUP_DIR_ENV, DATA_DIR_ENV};
pub use database::{is_incompatible_store, Database};
pub use document::{Decoded, Document};
pub use encryption::EncryptionKey;
pub use error::{Error, Result};
pub use files::StoreFiles;
pub use identity::{Identity, SINGLE_ACCOUNT_KEY_NAME};
pub use key_vault::{KeyAccess, KeyVault};
pub use keystore::{
    Accessibility, CredentialRead, CredentialStore, DeviceLockState, FileCredentialStore,
    MemoryCredentialStore,
};
pub use lifecycle::{DatabaseLifecycle, LifecycleState, SessionVerifier, WipeOutcome};
pub use notifier::{Change, ChangeKind, ChangeNotifier, ChangeSet, ObserverCursor};
pub use retry::{with_busy_retry, BASE_BACKOFF_MS, MAX_BACKOFF_MS, MAX_BUSY_RETRIES};
pub use security::{generate_salt, hash_sha256, KdfParams, SealingAlgorithm, SealingKey};
pub use store::{ObjectStore, QueuedWrite, Reader, Snapshot, WriteTransaction};
pub use view::{
    GroupSelection, MappingDefinition, MappingHandle, OrderedViewIndex, RowChange, RowMove,
    RowPosition, SectionChange, ViewChanges, ViewItem,
};

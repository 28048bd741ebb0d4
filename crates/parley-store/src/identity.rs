//! Account identity scoping keys, store files and backups

use crate::security::hash_sha256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential name used when no account identity is known
pub const SINGLE_ACCOUNT_KEY_NAME: &str = "parley.store.key";

/// Stable external identifier (e.g. an account address).
///
/// The store key, the store file and any backup artifact are all bound to
/// one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(Option<String>);

impl Identity {
    /// Identity for an account
    pub fn account(id: impl Into<String>) -> Self {
        Self(Some(id.into()))
    }

    /// Identity for single-account installs
    pub fn single_account() -> Self {
        Self(None)
    }

    /// Account id, if any
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Credential name of the live store key
    pub fn key_name(&self) -> String {
        match &self.0 {
            Some(id) => format!("{}.{}", SINGLE_ACCOUNT_KEY_NAME, id),
            None => SINGLE_ACCOUNT_KEY_NAME.to_string(),
        }
    }

    /// Credential name of the key kept alongside a backup
    pub fn backup_key_name(&self) -> String {
        format!("{}.backup", self.key_name())
    }

    /// Tag recorded next to a store file to bind it to this identity.
    ///
    /// A digest, so the account id itself never lands on disk.
    pub fn owner_tag(&self) -> String {
        let digest = hash_sha256(self.key_name().as_bytes());
        hex::encode(&digest[..16])
    }

    /// Filesystem-safe stem for per-identity artifacts
    pub fn file_stem(&self) -> String {
        format!("backup_{}", self.owner_tag())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => f.write_str(id),
            None => f.write_str("<single-account>"),
        }
    }
}

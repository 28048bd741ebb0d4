//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credential store cannot be read until the device is unlocked.
    /// Retry after unlock.
    #[error("Key store locked: {0}")]
    KeyLocked(String),

    /// Credential entry is unreadable or malformed. The key has to be
    /// regenerated, losing data that has no backup.
    #[error("Key store corrupted: {0}")]
    KeyStoreCorrupted(String),

    /// A freshly generated key could not be persisted
    #[error("Key store unwritable: {0}")]
    KeyStoreUnwritable(String),

    /// An existing store file could not be opened
    #[error("Store unusable: {0}")]
    StoreUnusable(String),

    /// The store handle was shut down
    #[error("Store closed")]
    Closed,

    /// Session lifecycle violation
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// True for errors that clear up on their own (device unlock, lock contention).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KeyLocked(_) => true,
            Error::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_is_transient() {
        assert!(Error::KeyLocked("device locked".into()).is_transient());
        assert!(!Error::KeyStoreCorrupted("bad entry".into()).is_transient());
        assert!(!Error::Closed.is_transient());
    }
}

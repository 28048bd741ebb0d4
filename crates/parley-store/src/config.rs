//! Store configuration
//!
//! Paths default to the platform's local data directory and can be
//! overridden through `PARLEY_DATA_DIR` / `PARLEY_BACKUP_DIR`.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "PARLEY_DATA_DIR";

/// Environment override for the backup directory
pub const BACKUP_DIR_ENV: &str = "PARLEY_BACKUP_DIR";

/// Default store file name
pub const DEFAULT_STORE_FILE: &str = "parley.sqlite";

/// Default number of pooled read connections
pub const DEFAULT_READER_CONNECTIONS: usize = 4;

/// Default number of change sets kept for incremental view updates
pub const DEFAULT_CHANGE_RETENTION: usize = 256;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the live store file and its companions
    pub data_dir: PathBuf,
    /// Directory holding per-identity backups
    pub backup_dir: PathBuf,
    /// Store file name inside `data_dir`
    pub store_file_name: String,
    /// Tuning for an open store
    pub options: StoreOptions,
}

/// Tuning for an open store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Read connections opened up front (the key is not kept after open)
    pub reader_connections: usize,
    /// SQLite busy timeout per connection
    pub busy_timeout: Duration,
    /// Change sets kept beyond what live observers still need
    pub change_retention: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reader_connections: DEFAULT_READER_CONNECTIONS,
            busy_timeout: Duration::from_secs(5),
            change_retention: DEFAULT_CHANGE_RETENTION,
        }
    }
}

impl StoreConfig {
    /// Resolve from environment, falling back to platform directories
    pub fn from_env() -> Self {
        let base = ProjectDirs::from("com", "Parley", "Parley")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let data_dir = std::env::var(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("store"));
        let backup_dir = std::env::var(BACKUP_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("backups"));

        Self {
            data_dir,
            backup_dir,
            store_file_name: DEFAULT_STORE_FILE.to_string(),
            options: StoreOptions::default(),
        }
    }

    /// Everything under one root directory
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("store"),
            backup_dir: root.join("backups"),
            store_file_name: DEFAULT_STORE_FILE.to_string(),
            options: StoreOptions::default(),
        }
    }

    /// Path of the live store file
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root_layout() {
        let config = StoreConfig::with_root("/tmp/parley");
        assert_eq!(config.store_path(), PathBuf::from("/tmp/parley/store/parley.sqlite"));
        assert_eq!(config.backup_dir, PathBuf::from("/tmp/parley/backups"));
        assert_eq!(config.options.reader_connections, DEFAULT_READER_CONNECTIONS);
    }
}

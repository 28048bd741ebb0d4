//! Store file, its write-ahead / shared-memory companions and its owner record
//!
//! The files are only ever moved or deleted together.

use crate::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker that tells backup and file-sync tools to skip a directory
const CACHEDIR_TAG: &str = "CACHEDIR.TAG";

const CACHEDIR_TAG_CONTENTS: &str = "Signature: 8a477f597d28d172789f06886806bc55\n\
# This file marks the Parley backup directory. Backups here are encrypted\n\
# store files tied to a device credential and must not be synced.\n";

/// Paths of a store file and its companions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFiles {
    /// Main database file
    pub main: PathBuf,
    /// Write-ahead log
    pub wal: PathBuf,
    /// Shared-memory index
    pub shm: PathBuf,
    /// Which identity the store belongs to
    pub owner: PathBuf,
}

impl StoreFiles {
    /// Companion paths for a main store file
    pub fn new<P: AsRef<Path>>(main: P) -> Self {
        let main = main.as_ref().to_path_buf();
        Self {
            wal: companion(&main, "-wal"),
            shm: companion(&main, "-shm"),
            owner: companion(&main, "-owner"),
            main,
        }
    }

    fn all(&self) -> [&PathBuf; 4] {
        [&self.main, &self.wal, &self.shm, &self.owner]
    }

    /// Whether the main file exists
    pub fn exists(&self) -> bool {
        self.main.exists()
    }

    /// Whether any of the files exists
    pub fn any_exists(&self) -> bool {
        self.all().iter().any(|p| p.exists())
    }

    /// Delete only the companions
    pub fn remove_companions(&self) -> Result<()> {
        remove_if_exists(&self.wal)?;
        remove_if_exists(&self.shm)?;
        remove_if_exists(&self.owner)?;
        Ok(())
    }

    /// Owner tag recorded for the store, if any
    pub fn owner_tag(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.owner) {
            Ok(tag) => Ok(Some(tag.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the owner tag next to the store
    pub fn write_owner_tag(&self, tag: &str) -> Result<()> {
        if let Some(parent) = self.owner.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.owner, tag)?;
        Ok(())
    }

    /// Delete all files
    pub fn remove(&self) -> Result<()> {
        for path in self.all() {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    /// Move the main file, any companions and the owner record to `dest`.
    ///
    /// Stale companions at `dest` are deleted first. If a later step fails,
    /// files already moved are moved back so the set is never split.
    pub fn move_to(&self, dest: &StoreFiles) -> Result<()> {
        if let Some(parent) = dest.main.parent() {
            fs::create_dir_all(parent)?;
        }
        dest.remove_companions()?;

        let mut moved: Vec<(&PathBuf, &PathBuf)> = Vec::new();
        for (from, to) in self.all().into_iter().zip(dest.all()) {
            if !from.exists() {
                continue;
            }
            if let Err(e) = move_file(from, to) {
                for (undo_from, undo_to) in moved.into_iter().rev() {
                    if let Err(undo) = move_file(undo_to, undo_from) {
                        tracing::error!(
                            "Failed to roll back {} -> {}: {}",
                            undo_to.display(),
                            undo_from.display(),
                            undo
                        );
                    }
                }
                return Err(e.into());
            }
            moved.push((from, to));
        }
        Ok(())
    }
}

fn companion(main: &Path, suffix: &str) -> PathBuf {
    let mut name = main.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Rename, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                "rename {} -> {} failed ({}), copying instead",
                from.display(),
                to.display(),
                rename_err
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Create the backup directory and mark it as excluded from sync/backup
pub fn prepare_backup_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tag = dir.join(CACHEDIR_TAG);
    if !tag.exists() {
        fs::write(tag, CACHEDIR_TAG_CONTENTS)?;
    }
    Ok(())
}

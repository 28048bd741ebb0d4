//! Encrypted database connections

use crate::config::StoreOptions;
use crate::{encryption::EncryptionKey, migrations, Error, Result};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};

/// Open connections to one encrypted store file.
///
/// Produced by the lifecycle and handed to
/// [`ObjectStore`](crate::store::ObjectStore); nothing else opens the file.
pub struct Database {
    path: PathBuf,
    writer: Connection,
    readers: Vec<Connection>,
    opener: ReaderOpener,
}

/// Opens extra reader connections once every pooled one is in use.
///
/// Holds its own copy of the key, zeroed when the store closes.
pub(crate) struct ReaderOpener {
    path: PathBuf,
    key: EncryptionKey,
    options: StoreOptions,
}

impl ReaderOpener {
    pub(crate) fn open(&self) -> Result<Connection> {
        open_connection(&self.path, &self.key, &self.options, false)
    }
}

impl Database {
    /// Open (or create) the store at `path` with `key`.
    ///
    /// Opens the writer and the pooled readers before returning. The
    /// caller's key can be dropped right after; the store keeps a zeroizing
    /// copy for readers opened on demand.
    pub fn open<P: AsRef<Path>>(path: P, key: &EncryptionKey, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db_exists = path.exists();

        let writer = open_connection(&path, key, options, true)?;

        // WAL lets readers keep their snapshot while the writer commits
        let journal_mode: String =
            writer.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(Error::StoreUnusable(format!(
                "journal_mode is '{}', WAL required",
                journal_mode
            )));
        }
        writer.execute_batch("PRAGMA synchronous=NORMAL;")?;

        if db_exists {
            tracing::debug!("Opening existing store at {}", path.display());
        } else {
            tracing::info!("Creating new store at {}", path.display());
        }

        migrations::run_migrations(&writer)?;
        probe_writable(&writer)?;

        let readers = (0..options.reader_connections.max(1))
            .map(|_| open_connection(&path, key, options, false))
            .collect::<Result<Vec<_>>>()?;

        let opener = ReaderOpener {
            path: path.clone(),
            key: key.clone(),
            options: options.clone(),
        };
        Ok(Self {
            path,
            writer,
            readers,
            opener,
        })
    }

    /// Path of the main store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Split into the writer, the pooled readers and the reader opener
    pub(crate) fn into_parts(self) -> (Connection, Vec<Connection>, ReaderOpener) {
        (self.writer, self.readers, self.opener)
    }
}

/// Open one connection and apply the key.
fn open_connection(path: &Path, key: &EncryptionKey, options: &StoreOptions, create: bool) -> Result<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;

    // PRAGMA key MUST be the first statement on the connection, otherwise
    // SQLCipher treats the file as plaintext.
    let literal = key.sqlcipher_literal();
    match conn.execute(&format!("PRAGMA key = \"{}\";", literal.as_str()), []) {
        Ok(_) | Err(rusqlite::Error::ExecuteReturnedResults) => {}
        Err(e) => {
            return Err(Error::Encryption(format!(
                "Failed to set database encryption key: {}",
                e
            )))
        }
    }

    let cipher_version: std::result::Result<String, rusqlite::Error> =
        conn.query_row("PRAGMA cipher_version", [], |row| row.get(0));
    match cipher_version {
        Ok(version) if !version.is_empty() => {
            tracing::trace!("SQLCipher version: {}", version);
        }
        _ => {
            return Err(Error::Encryption(
                "SQLCipher encryption verification failed. Database may not be encrypted.".to_string(),
            ))
        }
    }

    conn.busy_timeout(options.busy_timeout)?;

    // Forces the key to be checked against the file header
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;

    Ok(conn)
}

fn probe_writable(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE; COMMIT;")
        .map_err(|e| Error::StoreUnusable(format!("store is not writable: {}", e)))
}

/// Fold the WAL back into the main file and truncate it
pub(crate) fn checkpoint(conn: &Connection) -> Result<()> {
    let (busy, log, checkpointed): (i64, i64, i64) = conn.query_row(
        "PRAGMA wal_checkpoint(TRUNCATE)",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    if busy != 0 {
        tracing::warn!(
            "WAL checkpoint incomplete: {} of {} frames (reader still active)",
            checkpointed,
            log
        );
    }
    Ok(())
}

/// Whether an open failure means "not a store we can read" rather than an
/// I/O fault: wrong key, foreign file, or damaged header.
pub fn is_incompatible_store(err: &Error) -> bool {
    match err {
        Error::Database(e) => matches!(
            e.sqlite_error_code(),
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt)
        ),
        _ => false,
    }
}

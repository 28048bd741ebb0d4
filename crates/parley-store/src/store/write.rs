//! Write side: the exclusive read-write transaction

use super::snapshot::{read_commit_seq, Reader};
use crate::document::{date_to_epoch, encode};
use crate::migrations::COMMIT_SEQ;
use crate::notifier::{Change, ChangeKind, ChangeSet};
use crate::retry::with_busy_retry;
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

/// Exclusive read-write transaction.
///
/// Sees its own writes. Everything it does becomes visible to other
/// readers at once when the enclosing `read_write` body returns `Ok`; an
/// `Err` (or a panic) rolls all of it back.
pub struct WriteTransaction<'c> {
    conn: &'c Connection,
    changes: Vec<Change>,
    finished: bool,
}

impl<'c> WriteTransaction<'c> {
    pub(crate) fn begin(conn: &'c Connection) -> Result<Self> {
        with_busy_retry(|| Ok(conn.execute_batch("BEGIN IMMEDIATE")?))?;
        Ok(Self {
            conn,
            changes: Vec::new(),
            finished: false,
        })
    }

    /// Bump the commit counter, commit, and hand back what changed
    pub(crate) fn commit(mut self) -> Result<ChangeSet> {
        self.conn.execute(
            "UPDATE store_meta SET value = value + 1 WHERE name = ?1",
            [COMMIT_SEQ],
        )?;
        let seq = read_commit_seq(self.conn)?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(ChangeSet {
            seq,
            changes: std::mem::take(&mut self.changes),
        })
    }

    fn record(&mut self, key: &str, collection: &str, kind: ChangeKind) {
        self.changes.push(Change {
            collection: collection.to_string(),
            key: key.to_string(),
            kind,
        });
    }

    /// Mutations recorded so far
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Store `payload` under `key`, clearing any metadata.
    ///
    /// `None` removes the document.
    pub fn set(&mut self, payload: Option<&[u8]>, key: &str, collection: &str) -> Result<()> {
        self.set_with_metadata(payload, key, collection, None)
    }

    /// Store `payload` and `metadata` under `key`; a `None` payload removes
    /// the document
    pub fn set_with_metadata(
        &mut self,
        payload: Option<&[u8]>,
        key: &str,
        collection: &str,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        let Some(payload) = payload else {
            self.remove(key, collection)?;
            return Ok(());
        };

        let existed = self.has(key, collection)?;
        self.conn
            .prepare_cached(
                "INSERT INTO documents (collection, key, data, metadata)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(collection, key) DO UPDATE SET
                     data = excluded.data,
                     metadata = excluded.metadata",
            )?
            .execute(params![collection, key, payload, metadata])?;

        let kind = if existed {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.record(key, collection, kind);
        Ok(())
    }

    /// Replace only the metadata of an existing document.
    ///
    /// Returns `false` when the document does not exist.
    pub fn set_metadata(&mut self, metadata: Option<&[u8]>, key: &str, collection: &str) -> Result<bool> {
        let updated = self
            .conn
            .prepare_cached("UPDATE documents SET metadata = ?3 WHERE collection = ?1 AND key = ?2")?
            .execute(params![collection, key, metadata])?;
        if updated > 0 {
            self.record(key, collection, ChangeKind::Update);
        }
        Ok(updated > 0)
    }

    /// Remove a document; `false` when it did not exist
    pub fn remove(&mut self, key: &str, collection: &str) -> Result<bool> {
        let removed = self
            .conn
            .prepare_cached("DELETE FROM documents WHERE collection = ?1 AND key = ?2")?
            .execute(params![collection, key])?;
        if removed > 0 {
            self.record(key, collection, ChangeKind::Delete);
        }
        Ok(removed > 0)
    }

    /// Remove several documents, returning how many existed
    pub fn remove_many<I, S>(&mut self, keys: I, collection: &str) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for key in keys {
            if self.remove(key.as_ref(), collection)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Empty a collection
    pub fn remove_all(&mut self, collection: &str) -> Result<usize> {
        let keys = self.keys(collection)?;
        self.conn
            .prepare_cached("DELETE FROM documents WHERE collection = ?1")?
            .execute([collection])?;
        for key in &keys {
            self.record(key, collection, ChangeKind::Delete);
        }
        Ok(keys.len())
    }

    /// Report an update for an existing document without changing it
    pub fn touch(&mut self, key: &str, collection: &str) -> Result<bool> {
        let exists = self.has(key, collection)?;
        if exists {
            self.record(key, collection, ChangeKind::Update);
        }
        Ok(exists)
    }

    /// Store a structured value
    pub fn set_object<T: Serialize + ?Sized>(&mut self, value: &T, key: &str, collection: &str) -> Result<()> {
        let bytes = encode(value)?;
        self.set(Some(&bytes), key, collection)
    }

    /// Store a string
    pub fn set_string(&mut self, value: &str, key: &str, collection: &str) -> Result<()> {
        self.set_object(value, key, collection)
    }

    /// Store an integer
    pub fn set_int(&mut self, value: i64, key: &str, collection: &str) -> Result<()> {
        self.set_object(&value, key, collection)
    }

    /// Store a boolean
    pub fn set_bool(&mut self, value: bool, key: &str, collection: &str) -> Result<()> {
        self.set_object(&value, key, collection)
    }

    /// Store a date as epoch seconds
    pub fn set_date(&mut self, value: &DateTime<Utc>, key: &str, collection: &str) -> Result<()> {
        self.set_object(&date_to_epoch(value), key, collection)
    }

    /// Store raw bytes
    pub fn set_bytes(&mut self, value: &[u8], key: &str, collection: &str) -> Result<()> {
        self.set(Some(value), key, collection)
    }

    /// Add `by` to the integer under `key` and return the new value.
    ///
    /// A missing or undecodable value counts as 0.
    pub fn increment_int(&mut self, by: i64, key: &str, collection: &str) -> Result<i64> {
        let current = self.get_int(key, collection)?.unwrap_or(0);
        let next = current.wrapping_add(by);
        self.set_int(next, key, collection)?;
        Ok(next)
    }
}

impl Reader for WriteTransaction<'_> {
    fn connection(&self) -> &Connection {
        self.conn
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished || self.conn.is_autocommit() {
            return;
        }
        tracing::debug!("Rolling back write transaction ({} changes)", self.changes.len());
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::error!("Rollback failed: {}", e);
        }
    }
}

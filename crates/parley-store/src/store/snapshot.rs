//! Read side: pooled reader connections, snapshots and the [`Reader`] trait

use crate::database::ReaderOpener;
use crate::document::{decode, Decoded, Document};
use crate::migrations::COMMIT_SEQ;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Reader connections handed out one per snapshot.
///
/// Keeps up to `capacity` idle connections. When none is idle a new one is
/// opened, so a read never waits on another snapshot.
pub(crate) struct ReaderPool {
    state: Mutex<PoolState>,
    opener: ReaderOpener,
    capacity: usize,
}

struct PoolState {
    idle: Vec<Connection>,
    closed: bool,
}

impl ReaderPool {
    pub(crate) fn new(connections: Vec<Connection>, opener: ReaderOpener) -> Self {
        Self {
            capacity: connections.len().max(1),
            state: Mutex::new(PoolState {
                idle: connections,
                closed: false,
            }),
            opener,
        }
    }

    /// Take an idle connection, opening another when all are in use
    fn acquire(&self) -> Result<Connection> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(conn);
            }
        }
        tracing::debug!("All {} pooled readers busy, opening another", self.capacity);
        self.opener.open()
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.capacity {
            return;
        }
        state.idle.push(conn);
    }

    /// Close idle connections; busy ones close when their snapshot ends
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }
}

/// Current value of the commit counter
pub(crate) fn read_commit_seq(conn: &Connection) -> Result<u64> {
    let seq: i64 = conn.query_row(
        "SELECT value FROM store_meta WHERE name = ?1",
        [COMMIT_SEQ],
        |row| row.get(0),
    )?;
    Ok(seq as u64)
}

/// Read-only view of the store as of one commit.
///
/// Holds an open read transaction on a pooled connection until dropped, so
/// a snapshot is isolated from every later commit.
pub struct Snapshot {
    conn: Option<Connection>,
    seq: u64,
    pool: Arc<ReaderPool>,
}

impl Snapshot {
    pub(crate) fn begin(pool: Arc<ReaderPool>) -> Result<Self> {
        let conn = pool.acquire()?;
        let mut snapshot = Self {
            conn: Some(conn),
            seq: 0,
            pool,
        };
        let seq = {
            let conn = snapshot.connection();
            conn.execute_batch("BEGIN DEFERRED")?;
            // The first read pins the snapshot
            read_commit_seq(conn)?
        };
        snapshot.seq = seq;
        Ok(snapshot)
    }

    /// Commit sequence number this snapshot reflects
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    // Closing the connection ends the transaction; the pool
                    // opens a replacement when it next runs dry
                    tracing::warn!("Failed to end read snapshot {}, closing its connection: {}", self.seq, e);
                    return;
                }
            }
            self.pool.release(conn);
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("seq", &self.seq).finish()
    }
}

/// Read operations shared by [`Snapshot`] and
/// [`WriteTransaction`](super::WriteTransaction).
///
/// Keys come first, then the collection, everywhere.
pub trait Reader {
    /// Connection the reads run on
    #[doc(hidden)]
    fn connection(&self) -> &Connection;

    /// Payload stored under `key`
    fn get(&self, key: &str, collection: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .connection()
            .prepare_cached("SELECT data FROM documents WHERE collection = ?1 AND key = ?2")?
            .query_row(params![collection, key], |row| row.get(0))
            .optional()?)
    }

    /// Payload and metadata stored under `key`
    fn get_document(&self, key: &str, collection: &str) -> Result<Option<Document>> {
        Ok(self
            .connection()
            .prepare_cached(
                "SELECT data, metadata FROM documents WHERE collection = ?1 AND key = ?2",
            )?
            .query_row(params![collection, key], |row| {
                Ok(Document {
                    payload: row.get(0)?,
                    metadata: row.get(1)?,
                })
            })
            .optional()?)
    }

    /// Metadata stored under `key`
    fn metadata(&self, key: &str, collection: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .connection()
            .prepare_cached("SELECT metadata FROM documents WHERE collection = ?1 AND key = ?2")?
            .query_row(params![collection, key], |row| row.get::<_, Option<Vec<u8>>>(0))
            .optional()?
            .flatten())
    }

    /// Whether `key` exists in `collection`
    fn has(&self, key: &str, collection: &str) -> Result<bool> {
        Ok(self
            .connection()
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM documents WHERE collection = ?1 AND key = ?2)")?
            .query_row(params![collection, key], |row| row.get(0))?)
    }

    /// Keys in `collection`
    fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT key FROM documents WHERE collection = ?1")?;
        let keys = stmt
            .query_map([collection], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// `(key, payload)` pairs of `collection`; order is unspecified
    fn enumerate(&self, collection: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT key, data FROM documents WHERE collection = ?1")?;
        let rows = stmt
            .query_map([collection], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Visit every document of `collection` without collecting them
    fn for_each_document<F>(&self, collection: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, Document),
        Self: Sized,
    {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT key, data, metadata FROM documents WHERE collection = ?1")?;
        let mut rows = stmt.query([collection])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            visit(
                &key,
                Document {
                    payload: row.get(1)?,
                    metadata: row.get(2)?,
                },
            );
        }
        Ok(())
    }

    /// Number of documents in `collection`
    fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self
            .connection()
            .prepare_cached("SELECT COUNT(*) FROM documents WHERE collection = ?1")?
            .query_row([collection], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Collections holding at least one document
    fn collections(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT DISTINCT collection FROM documents ORDER BY collection")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Structured value under `key`; an undecodable payload is
    /// [`Decoded::UnknownSchema`], not an error
    fn get_object<T: DeserializeOwned>(&self, key: &str, collection: &str) -> Result<Option<Decoded<T>>>
    where
        Self: Sized,
    {
        Ok(self.get(key, collection)?.map(|bytes| decode(&bytes)))
    }

    /// Every structured value in `collection`, continuing past undecodable ones
    fn enumerate_objects<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<(String, Decoded<T>)>>
    where
        Self: Sized,
    {
        let mut out = Vec::new();
        for (key, bytes) in self.enumerate(collection)? {
            let decoded = decode(&bytes);
            if let Decoded::UnknownSchema { reason } = &decoded {
                tracing::warn!("Undecodable document {}/{}: {}", collection, key, reason);
            }
            out.push((key, decoded));
        }
        Ok(out)
    }

    /// String value; undecodable payloads are logged and read as absent
    fn get_string(&self, key: &str, collection: &str) -> Result<Option<String>>
    where
        Self: Sized,
    {
        typed(self, key, collection)
    }

    /// Integer value; undecodable payloads are logged and read as absent
    fn get_int(&self, key: &str, collection: &str) -> Result<Option<i64>>
    where
        Self: Sized,
    {
        typed(self, key, collection)
    }

    /// Boolean value; undecodable payloads are logged and read as absent
    fn get_bool(&self, key: &str, collection: &str) -> Result<Option<bool>>
    where
        Self: Sized,
    {
        typed(self, key, collection)
    }

    /// Date stored as epoch seconds
    fn get_date(&self, key: &str, collection: &str) -> Result<Option<DateTime<Utc>>>
    where
        Self: Sized,
    {
        Ok(typed::<f64, _>(self, key, collection)?.and_then(crate::document::epoch_to_date))
    }

    /// Raw binary value
    fn get_bytes(&self, key: &str, collection: &str) -> Result<Option<Vec<u8>>> {
        self.get(key, collection)
    }
}

fn typed<T: DeserializeOwned, R: Reader>(reader: &R, key: &str, collection: &str) -> Result<Option<T>> {
    match reader.get_object::<T>(key, collection)? {
        Some(Decoded::Value(value)) => Ok(Some(value)),
        Some(Decoded::UnknownSchema { reason }) => {
            tracing::warn!("Undecodable document {}/{}: {}", collection, key, reason);
            Ok(None)
        }
        None => Ok(None),
    }
}

impl Reader for Snapshot {
    fn connection(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            // Only taken in Drop
            None => unreachable!("snapshot connection released"),
        }
    }
}

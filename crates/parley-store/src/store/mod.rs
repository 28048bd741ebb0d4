//! Collection-scoped document store over an open [`Database`]
//!
//! One writer connection serializes read-write transactions; a pool of
//! reader connections serves snapshots concurrently. WAL mode keeps every
//! snapshot isolated from commits that happen while it is open.

mod queue;
mod snapshot;
mod write;

pub use queue::QueuedWrite;
pub use snapshot::{Reader, Snapshot};
pub use write::WriteTransaction;

use crate::config::StoreOptions;
use crate::database::{self, Database};
use crate::notifier::{ChangeNotifier, ObserverCursor};
use crate::{Error, Result};
use parking_lot::Mutex;
use queue::{QueuedJob, WriteBody};
use rusqlite::Connection;
use snapshot::{read_commit_seq, ReaderPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

pub(crate) struct StoreInner {
    writer: Mutex<Option<Connection>>,
    readers: Arc<ReaderPool>,
    notifier: ChangeNotifier,
    queue: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StoreInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one write body under the writer lock and publish its change set
    fn write<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let writer = self.writer.lock();
        let conn = writer.as_ref().ok_or(Error::Closed)?;

        let mut tx = WriteTransaction::begin(conn)?;
        let value = body(&mut tx)?;
        let changes = tx.commit()?;

        // Still under the writer lock: change sets are published in commit order
        self.notifier.publish(changes);
        Ok(value)
    }
}

/// Handle to an open store.
///
/// Cheap to clone; pass it to every consumer instead of reaching for a
/// global. Closing is explicit through [`ObjectStore::shutdown`].
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

impl ObjectStore {
    /// Take ownership of an open database
    pub fn open(database: Database, options: &StoreOptions) -> Result<Self> {
        let path = database.path().to_path_buf();
        let (writer, readers, opener) = database.into_parts();
        let seq = read_commit_seq(&writer)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(StoreInner {
            writer: Mutex::new(Some(writer)),
            readers: Arc::new(ReaderPool::new(readers, opener)),
            notifier: ChangeNotifier::new(seq, options.change_retention),
            queue: Mutex::new(Some(sender)),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let worker = queue::spawn_writer(Arc::downgrade(&inner), receiver)?;
        *inner.worker.lock() = Some(worker);

        tracing::info!("Store open at {} (commit {})", path.display(), seq);
        Ok(Self { inner })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Long-lived read transaction pinned to the latest commit
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.ensure_open()?;
        Snapshot::begin(self.inner.readers.clone())
    }

    /// Run `body` against a fresh snapshot.
    ///
    /// Never waits for a write; sees either all or none of any concurrent
    /// commit.
    pub fn read<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Snapshot) -> T,
    {
        let snapshot = self.snapshot()?;
        Ok(body(&snapshot))
    }

    /// Run `body` in an exclusive read-write transaction, blocking behind any
    /// write in flight.
    ///
    /// Commits when `body` returns `Ok`, rolls back on `Err`. Must not be
    /// called from inside another write body.
    pub fn read_write<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        self.ensure_open()?;
        self.inner.write(body)
    }

    /// Queue `body` on the dedicated writer thread and return at once.
    ///
    /// Writes run in submission order. Completion is observable only
    /// through the notifier; a failing body is logged and rolled back.
    pub fn async_read_write<F>(&self, body: F) -> Result<QueuedWrite>
    where
        F: for<'c> FnOnce(&mut WriteTransaction<'c>) -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        let slot = self.inner.queue.lock();
        let sender = slot.as_ref().ok_or(Error::Closed)?;
        let body: WriteBody = Box::new(body);
        queue::enqueue(sender, body)
    }

    /// Change notifier of this store
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Register an observer positioned at the latest commit
    pub fn begin_observing(&self) -> ObserverCursor {
        self.inner.notifier.begin_observing()
    }

    /// Whether [`ObjectStore::shutdown`] has run
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the store.
    ///
    /// Queued writes that have not started are dropped, a write in flight
    /// runs to completion first. The WAL is checkpointed into the main file
    /// before the writer connection closes. Every later call on any clone
    /// returns [`Error::Closed`].
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        tracing::info!("Shutting down store");

        drop(self.inner.queue.lock().take());
        if let Some(worker) = self.inner.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Writer thread panicked");
            }
        }

        let writer = self.inner.writer.lock().take();
        self.inner.readers.close();
        self.inner.notifier.close();

        if let Some(conn) = writer {
            database::checkpoint(&conn)?;
            conn.close().map_err(|(_, e)| Error::Database(e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("closed", &self.inner.is_closed())
            .field("latest_seq", &self.inner.notifier.latest_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::EncryptionKey;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            reader_connections: 2,
            ..Default::default()
        };
        let db = Database::open(dir.path().join("s.sqlite"), &EncryptionKey::generate(), &options).unwrap();
        (dir, ObjectStore::open(db, &options).unwrap())
    }

    #[test]
    fn test_round_trip_and_delete_by_none() {
        let (_dir, store) = open_store();
        store
            .read_write(|tx| tx.set(Some(b"hello".as_slice()), "m1", "messages"))
            .unwrap();
        let got = store.read(|snap| snap.get("m1", "messages")).unwrap().unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello"[..]));

        store.read_write(|tx| tx.set(None, "m1", "messages")).unwrap();
        store
            .read(|snap| {
                assert_eq!(snap.get("m1", "messages").unwrap(), None);
                assert!(snap.enumerate("messages").unwrap().is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_failed_body_rolls_back() {
        let (_dir, store) = open_store();
        let result: Result<()> = store.read_write(|tx| {
            tx.set(Some(b"a".as_slice()), "k1", "c")?;
            tx.set(Some(b"b".as_slice()), "k2", "c")?;
            Err(Error::Validation("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.read(|snap| snap.count("c")).unwrap().unwrap(), 0);
        assert_eq!(store.notifier().latest_seq(), 0);
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let (_dir, store) = open_store();
        store.read_write(|tx| tx.set_int(1, "n", "counters")).unwrap();

        let snap = store.snapshot().unwrap();
        store.read_write(|tx| tx.set_int(2, "n", "counters")).unwrap();

        assert_eq!(snap.get_int("n", "counters").unwrap(), Some(1));
        assert_eq!(snap.seq(), 1);
        drop(snap);
        assert_eq!(store.read(|s| s.get_int("n", "counters")).unwrap().unwrap(), Some(2));
    }

    #[test]
    fn test_busy_pool_opens_extra_readers() {
        let (_dir, store) = open_store();
        store.read_write(|tx| tx.set_int(7, "n", "counters")).unwrap();

        let held: Vec<Snapshot> = (0..4).map(|_| store.snapshot().unwrap()).collect();
        assert_eq!(store.inner.readers.idle_count(), 0);
        assert_eq!(store.read(|s| s.get_int("n", "counters")).unwrap().unwrap(), Some(7));

        drop(held);
        assert_eq!(store.inner.readers.idle_count(), 2);
    }

    #[test]
    fn test_shutdown_closes_every_clone() {
        let (_dir, store) = open_store();
        let other = store.clone();
        store.shutdown().unwrap();
        assert!(matches!(other.snapshot(), Err(Error::Closed)));
        assert!(matches!(other.read_write(|_| Ok(())), Err(Error::Closed)));
        assert!(matches!(other.shutdown(), Err(Error::Closed)));
    }
}

//! Change sets and observer cursors
//!
//! Every committed read-write transaction publishes one [`ChangeSet`],
//! numbered by the store's commit sequence. The notifier keeps a log of
//! recent change sets; each [`ObserverCursor`] is a watermark into that log.
//! Entries a live cursor has not yet passed are never trimmed, so a slow
//! observer still sees every change set in commit order.

use crate::store::Snapshot;
use crate::view::{diff, MappingHandle, OrderedViewIndex, ViewChanges};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Kind of mutation applied to one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Key did not exist before
    Insert,
    /// Existing key rewritten (or touched)
    Update,
    /// Key removed
    Delete,
}

/// One mutation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Collection of the document
    pub collection: String,
    /// Key of the document
    pub key: String,
    /// What happened
    pub kind: ChangeKind,
}

/// Mutations of one committed read-write transaction, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Commit sequence number this transaction produced
    pub seq: u64,
    /// Mutation records
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Whether any record targets `collection`
    pub fn touches(&self, collection: &str) -> bool {
        self.changes.iter().any(|c| c.collection == collection)
    }

    /// Whether the transaction changed nothing
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

struct ChangeLog {
    entries: VecDeque<Arc<ChangeSet>>,
    latest_seq: u64,
    cursors: BTreeMap<u64, u64>,
    next_cursor_id: u64,
    retention: usize,
}

impl ChangeLog {
    /// Drop entries no cursor needs, keeping at least `retention`
    fn trim(&mut self) {
        let floor = self.cursors.values().min().copied().unwrap_or(self.latest_seq);
        while self.entries.len() > self.retention {
            match self.entries.front() {
                Some(front) if front.seq <= floor => {
                    self.entries.pop_front();
                }
                _ => break,
            }
        }
    }

    fn between(&self, from: u64, to: u64) -> Option<Vec<Arc<ChangeSet>>> {
        if from >= to {
            return Some(Vec::new());
        }
        if to > self.latest_seq {
            return None;
        }
        match self.entries.front() {
            Some(front) if front.seq <= from + 1 => {}
            _ => return None,
        }
        Some(
            self.entries
                .iter()
                .filter(|set| set.seq > from && set.seq <= to)
                .cloned()
                .collect(),
        )
    }
}

struct Shared {
    log: Mutex<ChangeLog>,
    wake: watch::Sender<u64>,
    closed: AtomicBool,
}

/// Per-store publish/subscribe channel for committed change sets.
///
/// Cheap to clone; every clone shares the same log.
#[derive(Clone)]
pub struct ChangeNotifier {
    shared: Arc<Shared>,
}

impl ChangeNotifier {
    /// Notifier whose log starts after commit `seq`
    pub(crate) fn new(seq: u64, retention: usize) -> Self {
        let (wake, _) = watch::channel(seq);
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(ChangeLog {
                    entries: VecDeque::new(),
                    latest_seq: seq,
                    cursors: BTreeMap::new(),
                    next_cursor_id: 0,
                    retention,
                }),
                wake,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Record a committed change set and wake observers.
    ///
    /// Called with the writer lock held, so sets arrive in commit order.
    pub(crate) fn publish(&self, set: ChangeSet) {
        let seq = set.seq;
        {
            let mut log = self.shared.log.lock();
            tracing::debug!("Publishing change set {} ({} changes)", seq, set.changes.len());
            log.latest_seq = seq;
            log.entries.push_back(Arc::new(set));
            log.trim();
        }
        self.shared.wake.send_replace(seq);
    }

    /// Stop waking observers; pending `changed()` calls return [`Error::Closed`]
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let latest = *self.shared.wake.borrow();
        self.shared.wake.send_replace(latest);
    }

    /// Sequence number of the most recent commit
    pub fn latest_seq(&self) -> u64 {
        self.shared.log.lock().latest_seq
    }

    /// Register an observer positioned at "now"
    pub fn begin_observing(&self) -> ObserverCursor {
        let mut log = self.shared.log.lock();
        let id = log.next_cursor_id;
        log.next_cursor_id += 1;
        let seq = log.latest_seq;
        log.cursors.insert(id, seq);
        ObserverCursor {
            id,
            seq,
            shared: self.shared.clone(),
            wake: self.shared.wake.subscribe(),
        }
    }

    /// Mark everything up to `seq` as applied by `cursor`.
    ///
    /// Never moves a cursor backwards, and never past the latest commit.
    pub fn advance(&self, cursor: &mut ObserverCursor, seq: u64) {
        let mut log = self.shared.log.lock();
        let target = seq.min(log.latest_seq);
        if target <= cursor.seq {
            return;
        }
        cursor.seq = target;
        log.cursors.insert(cursor.id, target);
        log.trim();
    }

    /// Change sets with `from < seq <= to`, in commit order.
    ///
    /// `None` when part of that range is no longer (or not yet) in the log;
    /// callers then rebuild from a snapshot instead.
    pub fn changes_between(&self, from: u64, to: u64) -> Option<Vec<Arc<ChangeSet>>> {
        self.shared.log.lock().between(from, to)
    }

    /// Translate everything committed after `cursor` up to `snapshot` into
    /// row and section changes of one mapping, updating the mapping to
    /// `snapshot` on the way.
    ///
    /// The mapping must have been updated to the cursor's position. If it
    /// was not, or the log no longer covers the range, the mapping is
    /// rebuilt and the result only carries `reloaded = true`. When no
    /// change touches the mapping's collection, the mapping is fast-forwarded
    /// and the result is empty.
    ///
    /// Removed rows, the source of moves and updated rows use coordinates
    /// from before the changes; inserted rows and move targets use
    /// coordinates after them.
    pub fn section_and_row_changes(
        &self,
        cursor: &ObserverCursor,
        index: &mut OrderedViewIndex,
        mapping: MappingHandle,
        snapshot: &Snapshot,
    ) -> Result<ViewChanges> {
        let collection = index.collection(mapping)?.to_string();
        let target = snapshot.seq();
        let mapping_seq = index.seq(mapping)?;

        let sets = match self.changes_between(cursor.seq, target) {
            Some(sets) if mapping_seq == Some(cursor.seq) => sets,
            _ => {
                tracing::debug!(
                    "Mapping {:?} not at cursor {}, reloading at {}",
                    mapping,
                    cursor.seq,
                    target
                );
                index.rebuild(mapping, snapshot)?;
                return Ok(ViewChanges::reloaded());
            }
        };

        if !sets.iter().any(|set| set.touches(&collection)) {
            index.fast_forward(mapping, target)?;
            return Ok(ViewChanges::default());
        }

        let mut keys: Vec<&str> = Vec::new();
        for change in sets.iter().flat_map(|set| set.changes.iter()) {
            if change.collection == collection && !keys.contains(&change.key.as_str()) {
                keys.push(&change.key);
            }
        }

        let before = index.layout(mapping, &keys)?;
        index.apply(mapping, &sets, snapshot)?;
        let after = index.layout(mapping, &keys)?;
        Ok(diff(&before, &after))
    }
}

/// Per-observer watermark into the change set stream.
///
/// Unregisters itself on drop, releasing any log entries it was holding.
pub struct ObserverCursor {
    id: u64,
    seq: u64,
    shared: Arc<Shared>,
    wake: watch::Receiver<u64>,
}

impl ObserverCursor {
    /// Last commit this observer has applied
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Change sets committed after this cursor, in commit order
    pub fn pending(&self) -> Vec<Arc<ChangeSet>> {
        let log = self.shared.log.lock();
        log.entries
            .iter()
            .filter(|set| set.seq > self.seq)
            .cloned()
            .collect()
    }

    /// Wait until something was committed after this cursor.
    ///
    /// Returns the latest commit sequence, or [`Error::Closed`] once the
    /// store is shut down.
    pub async fn changed(&mut self) -> Result<u64> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            let latest = *self.wake.borrow_and_update();
            if latest > self.seq {
                return Ok(latest);
            }
            if self.wake.changed().await.is_err() {
                return Err(Error::Closed);
            }
        }
    }
}

impl std::fmt::Debug for ObserverCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverCursor")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Drop for ObserverCursor {
    fn drop(&mut self) {
        let mut log = self.shared.log.lock();
        log.cursors.remove(&self.id);
        log.trim();
    }
}

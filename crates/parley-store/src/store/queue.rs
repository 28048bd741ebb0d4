//! Dedicated serial writer for `async_read_write`

use super::{StoreInner, WriteTransaction};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

pub(crate) type WriteBody = Box<dyn for<'c> FnOnce(&mut WriteTransaction<'c>) -> Result<()> + Send>;

pub(crate) struct QueuedJob {
    state: Arc<AtomicU8>,
    body: WriteBody,
}

impl QueuedJob {
    pub(crate) fn new(body: WriteBody) -> (Self, QueuedWrite) {
        let state = Arc::new(AtomicU8::new(QUEUED));
        (
            Self {
                state: state.clone(),
                body,
            },
            QueuedWrite { state },
        )
    }
}

/// Handle to a write queued with `async_read_write`.
///
/// Dropping the handle does not cancel the write.
#[derive(Debug, Clone)]
pub struct QueuedWrite {
    state: Arc<AtomicU8>,
}

impl QueuedWrite {
    /// Drop the write if it has not started.
    ///
    /// Returns `false` when it is already running or done; a started write
    /// always runs to completion.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether the write is still waiting for the writer
    pub fn is_queued(&self) -> bool {
        self.state.load(Ordering::SeqCst) == QUEUED
    }

    /// Whether the write was cancelled before it started
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }
}

/// Spawn the writer thread; it exits when the queue sender is dropped
pub(crate) fn spawn_writer(
    store: Weak<StoreInner>,
    mut jobs: mpsc::UnboundedReceiver<QueuedJob>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("parley-writer".to_string())
        .spawn(move || {
            tracing::debug!("Writer thread started");
            while let Some(job) = jobs.blocking_recv() {
                let Some(inner) = store.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    job.state.store(CANCELLED, Ordering::SeqCst);
                    tracing::debug!("Dropping queued write after shutdown");
                    continue;
                }
                if job
                    .state
                    .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    tracing::debug!("Skipping cancelled write");
                    continue;
                }
                if let Err(e) = inner.write(job.body) {
                    tracing::error!("Queued write failed: {}", e);
                }
            }
            tracing::debug!("Writer thread stopped");
        })
}

/// Hand a body to the writer thread
pub(crate) fn enqueue(queue: &mpsc::UnboundedSender<QueuedJob>, body: WriteBody) -> Result<QueuedWrite> {
    let (job, handle) = QueuedJob::new(body);
    queue.send(job).map_err(|_| Error::Closed)?;
    Ok(handle)
}

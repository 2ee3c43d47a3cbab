//! Dispatcher Module
//!
//! Owns the background flush thread and the queues of active changelogs.
//!
//! ## Responsibilities
//! - Buffer appends per changelog and flush them in batches
//! - Resolve flush futures once a batch is synced
//! - Sweep queues that are idle and unused
//! - Drain every queue on shutdown
//!
//! ## Flush Thread
//! ```text
//!   loop:
//!     ┌──────────────────────────────────────────┐
//!     │ flush queues with pending actions        │  (no registry lock)
//!     ├──────────────────────────────────────────┤
//!     │ sweep empty queues with no users         │  (registry lock)
//!     ├──────────────────────────────────────────┤
//!     │ sleep until woken or flush_quantum       │
//!     └──────────────────────────────────────────┘
//! ```
//!
//! ## Lock Order
//! registry → queue, and changelog → queue. A queue lock is never held while
//! taking a changelog lock. A handle's failure slot is a leaf.

mod completion;
mod queue;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::async_changelog::AsyncChangelog;
use crate::changelog::{Changelog, EpochId};
use crate::config::Config;
use crate::error::{ChangelogError, Result};

pub use completion::FlushFuture;

use queue::{ChangelogQueue, QueueLease};

/// A changelog shared between its façade handles and its queue
pub(crate) struct ChangelogHandle {
    /// Registry key, unique per dispatcher
    key: u64,
    id: i32,
    epoch: EpochId,
    prev_record_count: i32,
    path: PathBuf,
    /// Last flush generation handed out; survives queue sweeps
    generation: AtomicU64,
    /// First flush failure; survives queue sweeps
    failure: Mutex<Option<String>>,
    changelog: Mutex<Changelog>,
}

impl ChangelogHandle {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn id(&self) -> i32 {
        self.id
    }

    pub(crate) fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub(crate) fn prev_record_count(&self) -> i32 {
        self.prev_record_count
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// State shared between the dispatcher, its façades and the flush thread
pub(crate) struct DispatcherCore {
    config: Config,
    /// Queues of changelogs with recent activity
    queues: Mutex<HashMap<u64, Arc<ChangelogQueue>>>,
    /// Only set while holding the `queues` lock
    shutdown: AtomicBool,
    next_key: AtomicU64,
    wakeup: Sender<()>,
}

/// Background flusher for a set of changelogs
///
/// ## Concurrency:
/// - All methods take `&self`; share it behind an `Arc` if needed
/// - Appends return immediately; durability is reported through `FlushFuture`
/// - Dropping the dispatcher drains all queues and joins the flush thread
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start a dispatcher and its flush thread
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        // A single pending wakeup is enough: the thread scans every queue.
        let (wakeup, wakeup_rx) = channel::bounded(1);
        let core = Arc::new(DispatcherCore {
            config,
            queues: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
            wakeup,
        });

        let thread_core = Arc::clone(&core);
        let worker = std::thread::Builder::new()
            .name("changelog-flush".to_string())
            .spawn(move || run(thread_core, wakeup_rx))?;

        tracing::debug!("Changelog dispatcher started");

        Ok(Self {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Create a new changelog at `path` and wrap it in an async façade
    pub fn create_changelog(
        &self,
        path: &Path,
        id: i32,
        epoch: EpochId,
        prev_record_count: i32,
    ) -> Result<AsyncChangelog> {
        self.core.ensure_running()?;
        let changelog = Changelog::create(path, id, epoch, prev_record_count, &self.core.config)?;
        Ok(self.core.wrap(changelog))
    }

    /// Open (and recover) an existing changelog at `path`
    pub fn open_changelog(&self, path: &Path) -> Result<AsyncChangelog> {
        self.core.ensure_running()?;
        let changelog = Changelog::open(path, &self.core.config)?;
        Ok(self.core.wrap(changelog))
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Number of changelogs currently holding a queue
    pub fn active_queue_count(&self) -> usize {
        self.core.queues.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown.load(Ordering::Acquire)
    }

    /// Flush every queue and stop the flush thread
    ///
    /// Idempotent. Operations that need the flush thread fail with
    /// `DispatcherShutdown` afterwards; reads keep working.
    pub fn shutdown(&self) {
        {
            let _queues = self.core.queues.lock();
            self.core.shutdown.store(true, Ordering::Release);
        }
        self.core.wake();

        if let Some(worker) = self.worker.lock().take() {
            tracing::debug!("Stopping changelog dispatcher");
            if worker.join().is_err() {
                tracing::error!("Changelog flush thread panicked");
            }
            tracing::debug!("Changelog dispatcher stopped");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Flush Thread
// =============================================================================

fn run(core: Arc<DispatcherCore>, wakeup: Receiver<()>) {
    tracing::debug!("Changelog flush thread started");

    while !core.shutdown.load(Ordering::Acquire) {
        core.flush_pending(false);
        core.sweep();
        if !core.sleep(&wakeup) {
            break;
        }
    }

    core.drain(&wakeup);
    tracing::debug!("Changelog flush thread stopped");
}

impl DispatcherCore {
    /// Flush queues with pending actions, or every queue when `all` is set
    fn flush_pending(&self, all: bool) {
        let pending: Vec<Arc<ChangelogQueue>> = self
            .queues
            .lock()
            .values()
            .filter(|queue| all || queue.has_pending_actions())
            .cloned()
            .collect();

        for queue in pending {
            queue.flush();
        }
    }

    /// Drop queues that are empty and unused
    fn sweep(&self) {
        let mut queues = self.queues.lock();
        queues.retain(|_, queue| {
            let swept = queue.try_sweep();
            if swept {
                tracing::trace!("Changelog {} queue swept", queue.id());
            }
            !swept
        });
    }

    /// Returns false if the wakeup channel is gone
    fn sleep(&self, wakeup: &Receiver<()>) -> bool {
        match wakeup.recv_timeout(self.config.flush_quantum) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Flush until every queue is empty and released
    fn drain(&self, wakeup: &Receiver<()>) {
        loop {
            self.flush_pending(true);
            self.sweep();

            let in_use: Vec<i32> = {
                let queues = self.queues.lock();
                if queues.is_empty() {
                    break;
                }
                queues
                    .values()
                    .filter(|queue| queue.use_count() > 0 || !queue.is_empty())
                    .map(|queue| queue.id())
                    .collect()
            };
            tracing::debug!("Waiting for changelog queues to drain: {:?}", in_use);

            if !self.sleep(wakeup) {
                break;
            }
        }
    }

    pub(crate) fn wake(&self) {
        // Full means a wakeup is already pending.
        let _ = self.wakeup.try_send(());
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ChangelogError::DispatcherShutdown);
        }
        Ok(())
    }

    fn wrap(self: &Arc<Self>, changelog: Changelog) -> AsyncChangelog {
        AsyncChangelog::new(Arc::clone(self), self.new_handle(changelog))
    }

    fn new_handle(&self, changelog: Changelog) -> Arc<ChangelogHandle> {
        Arc::new(ChangelogHandle {
            key: self.next_key.fetch_add(1, Ordering::Relaxed),
            id: changelog.id(),
            epoch: changelog.epoch(),
            prev_record_count: changelog.prev_record_count(),
            path: changelog.path().to_path_buf(),
            generation: AtomicU64::new(0),
            failure: Mutex::new(None),
            changelog: Mutex::new(changelog),
        })
    }

    // =========================================================================
    // Queue Registry
    // =========================================================================

    /// Lease the queue of `handle`, creating it if needed
    fn lease(&self, handle: &Arc<ChangelogHandle>) -> Result<QueueLease> {
        let mut queues = self.queues.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ChangelogError::DispatcherShutdown);
        }

        let queue = queues.entry(handle.key).or_insert_with(|| {
            tracing::trace!("Changelog {} queue created", handle.id);
            Arc::new(ChangelogQueue::new(Arc::clone(handle), &self.config))
        });
        Ok(QueueLease::new(Arc::clone(queue)))
    }

    /// Lease the queue of `handle` only if it exists
    fn find_lease(&self, handle: &ChangelogHandle) -> Option<QueueLease> {
        self.queues
            .lock()
            .get(&handle.key)
            .map(|queue| QueueLease::new(Arc::clone(queue)))
    }

    /// Like `lease`, but after shutdown only yields a queue that is still
    /// draining; `None` means nothing of `handle` is buffered
    fn lease_draining(&self, handle: &Arc<ChangelogHandle>) -> Result<Option<QueueLease>> {
        match self.lease(handle) {
            Ok(queue) => Ok(Some(queue)),
            Err(ChangelogError::DispatcherShutdown) => Ok(self.find_lease(handle)),
            Err(e) => Err(e),
        }
    }

    /// Drop the queue of `handle` if it is empty and nobody else holds it
    fn release(&self, handle: &ChangelogHandle) -> bool {
        let mut queues = self.queues.lock();
        let released = match queues.get(&handle.key) {
            Some(queue) => queue.try_sweep(),
            None => return true,
        };
        if released {
            queues.remove(&handle.key);
        }
        released
    }

    /// Whether only the caller's façade still refers to `handle`; an idle
    /// queue is released first
    pub(crate) fn is_idle(&self, handle: &Arc<ChangelogHandle>) -> bool {
        self.release(handle) && Arc::strong_count(handle) == 1
    }

    fn wait_until_flushed(&self, queue: &ChangelogQueue) -> Result<()> {
        queue.wait_until_flushed(&|| self.wake())
    }

    // =========================================================================
    // Changelog Operations
    // =========================================================================

    pub(crate) fn append(
        &self,
        handle: &Arc<ChangelogHandle>,
        record_id: u32,
        payload: Bytes,
    ) -> Result<FlushFuture> {
        let future = self.lease(handle)?.append(record_id, payload)?;
        self.wake();
        Ok(future)
    }

    pub(crate) fn read(
        &self,
        handle: &Arc<ChangelogHandle>,
        first_record_id: u32,
        max_records: usize,
        max_bytes: u64,
    ) -> Result<Vec<Bytes>> {
        if max_records == 0 || max_bytes == 0 {
            return Ok(Vec::new());
        }
        match self.lease_draining(handle)? {
            Some(queue) => queue.read(first_record_id, max_records, max_bytes),
            // No queue: the changelog alone is authoritative.
            None => handle
                .changelog
                .lock()
                .read(first_record_id, max_records, max_bytes),
        }
    }

    pub(crate) fn record_count(&self, handle: &ChangelogHandle) -> u32 {
        match self.find_lease(handle) {
            Some(queue) => queue.record_count(),
            None => handle.changelog.lock().record_count(),
        }
    }

    pub(crate) fn is_finalized(&self, handle: &ChangelogHandle) -> bool {
        handle.changelog.lock().is_finalized()
    }

    pub(crate) fn flush(&self, handle: &Arc<ChangelogHandle>) -> Result<()> {
        let queue = self.lease(handle)?;
        self.wait_until_flushed(&queue)?;
        handle.changelog.lock().flush()
    }

    pub(crate) fn flush_async(&self, handle: &Arc<ChangelogHandle>) -> Result<FlushFuture> {
        let future = self.lease(handle)?.async_flush();
        self.wake();
        Ok(future)
    }

    pub(crate) fn finalize(&self, handle: &Arc<ChangelogHandle>) -> Result<()> {
        let queue = self.lease(handle)?;

        // Seal first so nothing new is appended while draining.
        queue.set_sealed(true);
        let result = self
            .wait_until_flushed(&queue)
            .and_then(|_| handle.changelog.lock().finalize());
        if result.is_err() {
            queue.set_sealed(handle.changelog.lock().is_finalized());
        }
        result
    }

    pub(crate) fn definalize(&self, handle: &Arc<ChangelogHandle>) -> Result<()> {
        let queue = self.lease(handle)?;
        handle.changelog.lock().definalize()?;
        queue.set_sealed(false);
        Ok(())
    }

    pub(crate) fn truncate(&self, handle: &Arc<ChangelogHandle>, record_count: u32) -> Result<()> {
        let queue = self.lease(handle)?;

        queue.set_sealed(true);
        let result = self.wait_until_flushed(&queue).and_then(|_| {
            let mut changelog = handle.changelog.lock();
            changelog.truncate(record_count)?;
            queue.reset_flushed(changelog.record_count());
            Ok(())
        });
        queue.set_sealed(handle.changelog.lock().is_finalized());
        result
    }

    /// Flush everything and release the queue of `handle`
    ///
    /// Records appended through other handles while closing stay queued; the
    /// queue is then left to the flush thread instead of being released.
    pub(crate) fn close(&self, handle: &Arc<ChangelogHandle>) -> Result<()> {
        if let Some(queue) = self.lease_draining(handle)? {
            self.wait_until_flushed(&queue)?;
        }
        if !self.release(handle) {
            tracing::debug!("Changelog {} still in use, queue kept", handle.id);
        }

        handle.changelog.lock().flush()?;
        tracing::debug!("Changelog {} closed", handle.id);
        Ok(())
    }

    /// Close the changelog and delete its files
    pub(crate) fn remove(&self, handle: &Arc<ChangelogHandle>) -> Result<()> {
        self.close(handle)?;

        let index_path = handle.changelog.lock().index_path().to_path_buf();
        for path in [handle.path.as_path(), index_path.as_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("Changelog {} removed", handle.id);
        Ok(())
    }
}

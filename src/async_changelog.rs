//! Async changelog façade
//!
//! The handle callers use. Appends are queued and flushed by the dispatcher
//! thread; reads see flushed and unflushed records alike.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::changelog::EpochId;
use crate::dispatcher::{ChangelogHandle, DispatcherCore, FlushFuture};
use crate::error::Result;

/// Handle to a changelog served by a `Dispatcher`
///
/// Clones share the same changelog and queue.
#[derive(Clone)]
pub struct AsyncChangelog {
    core: Arc<DispatcherCore>,
    handle: Arc<ChangelogHandle>,
}

impl AsyncChangelog {
    pub(crate) fn new(core: Arc<DispatcherCore>, handle: Arc<ChangelogHandle>) -> Self {
        Self { core, handle }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Queue `payload` as record `record_id` without waiting for the disk
    ///
    /// `record_id` must equal `record_count()`. The returned future resolves
    /// once the record (and every record before it) is durable.
    pub fn append(&self, record_id: u32, payload: impl Into<Bytes>) -> Result<FlushFuture> {
        self.core.append(&self.handle, record_id, payload.into())
    }

    /// Block until every queued record is durable
    pub fn flush(&self) -> Result<()> {
        self.core.flush(&self.handle)
    }

    /// Start a flush of every queued record without waiting for it
    pub fn flush_async(&self) -> Result<FlushFuture> {
        self.core.flush_async(&self.handle)
    }

    /// Drop every record with id `>= record_count`, after flushing the queue
    pub fn truncate(&self, record_count: u32) -> Result<()> {
        self.core.truncate(&self.handle, record_count)
    }

    /// Flush and seal; further appends fail with `LogClosed`
    pub fn finalize(&self) -> Result<()> {
        self.core.finalize(&self.handle)
    }

    pub fn definalize(&self) -> Result<()> {
        self.core.definalize(&self.handle)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read up to `max_records` records starting at `first_record_id`
    pub fn read(&self, first_record_id: u32, max_records: usize) -> Result<Vec<Bytes>> {
        self.read_limited(first_record_id, max_records, u64::MAX)
    }

    /// Like `read`, but stops once `max_bytes` of payload were collected
    ///
    /// At least one record is returned when one exists past `first_record_id`.
    pub fn read_limited(
        &self,
        first_record_id: u32,
        max_records: usize,
        max_bytes: u64,
    ) -> Result<Vec<Bytes>> {
        self.core
            .read(&self.handle, first_record_id, max_records, max_bytes)
    }

    /// Records appended so far, unflushed ones included
    pub fn record_count(&self) -> u32 {
        self.core.record_count(&self.handle)
    }

    pub fn is_finalized(&self) -> bool {
        self.core.is_finalized(&self.handle)
    }

    pub fn id(&self) -> i32 {
        self.handle.id()
    }

    pub fn epoch(&self) -> EpochId {
        self.handle.epoch()
    }

    pub fn prev_record_count(&self) -> i32 {
        self.handle.prev_record_count()
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Flush everything and release this changelog's queue
    pub fn close(self) -> Result<()> {
        self.core.close(&self.handle)
    }

    /// Whether no other handle shares this changelog
    pub(crate) fn is_idle(&self) -> bool {
        self.core.is_idle(&self.handle)
    }

    /// Close and delete the data and index files
    pub(crate) fn remove(self) -> Result<()> {
        self.core.remove(&self.handle)
    }
}

impl fmt::Debug for AsyncChangelog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChangelog")
            .field("id", &self.handle.id())
            .field("epoch", &self.handle.epoch())
            .field("path", &self.handle.path())
            .finish()
    }
}

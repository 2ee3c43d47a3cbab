//! Changelog queue
//!
//! Buffers appends for one changelog until the flush thread writes them.
//!
//! ```text
//!   disk                    memory
//! ┌───────────────────────┬──────────────┬──────────────┐
//! │ 0 .. flushed          │ flush_queue  │ append_queue │
//! └───────────────────────┴──────────────┴──────────────┘
//!   durable                 being written   newly appended
//! ```
//!
//! The queue lock is never held during file I/O.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{ChangelogError, Result};

use super::completion::{Completion, FlushFuture};
use super::ChangelogHandle;

/// Mutable part of a queue, guarded by its lock
struct QueueState {
    /// Records known to be durable in the changelog
    flushed_record_count: u32,
    /// Records currently being written by the flush thread
    flush_queue: Vec<Bytes>,
    /// Records appended since the last flush cycle started
    append_queue: Vec<Bytes>,
    /// Payload bytes in `append_queue`
    byte_size: usize,

    /// Shared by every record in `append_queue`
    completion: Arc<Completion>,
    flush_forced: bool,
    last_flush: Instant,

    /// Mirrors the changelog's finalized state (also set while truncating)
    sealed: bool,
    /// Set after a failed flush
    failure: Option<String>,
}

impl QueueState {
    fn record_count(&self) -> u32 {
        self.flushed_record_count + self.flush_queue.len() as u32 + self.append_queue.len() as u32
    }

    fn is_empty(&self) -> bool {
        self.flush_queue.is_empty() && self.append_queue.is_empty()
    }
}

/// Pending appends of a single changelog
pub(crate) struct ChangelogQueue {
    handle: Arc<ChangelogHandle>,
    state: Mutex<QueueState>,
    /// Callers currently inside an operation on this queue
    use_count: AtomicUsize,
    flush_buffer_size: usize,
    flush_period: Duration,
}

impl ChangelogQueue {
    pub(crate) fn new(handle: Arc<ChangelogHandle>, config: &Config) -> Self {
        let (record_count, sealed) = {
            let changelog = handle.changelog.lock();
            (changelog.record_count(), changelog.is_finalized())
        };
        let failure = handle.failure.lock().clone();

        Self {
            state: Mutex::new(QueueState {
                flushed_record_count: record_count,
                flush_queue: Vec::new(),
                append_queue: Vec::new(),
                byte_size: 0,
                completion: Completion::new(handle.id, handle.next_generation()),
                flush_forced: false,
                last_flush: Instant::now(),
                sealed,
                failure,
            }),
            handle,
            use_count: AtomicUsize::new(0),
            flush_buffer_size: config.flush_buffer_size,
            flush_period: config.flush_period,
        }
    }

    pub(crate) fn id(&self) -> i32 {
        self.handle.id
    }

    // =========================================================================
    // Caller Side
    // =========================================================================

    /// Enqueue `payload` as record `record_id`
    ///
    /// Ids must continue the sequence exactly; the returned future is shared
    /// with every other record of the current flush generation.
    pub(crate) fn append(&self, record_id: u32, payload: Bytes) -> Result<FlushFuture> {
        crate::changelog::validate_payload(self.handle.id, record_id, &payload)?;

        let mut state = self.state.lock();
        if state.failure.is_some() {
            return Err(ChangelogError::Unusable { id: self.handle.id });
        }
        if state.sealed {
            return Err(ChangelogError::LogClosed { id: self.handle.id });
        }

        let expected = state.record_count();
        if record_id != expected {
            return Err(ChangelogError::OutOfOrder {
                id: self.handle.id,
                expected,
                actual: record_id,
            });
        }

        state.byte_size += payload.len();
        state.append_queue.push(payload);
        Ok(FlushFuture::new(Arc::clone(&state.completion)))
    }

    /// Read records, from disk below the flushed count and from memory above
    pub(crate) fn read(
        &self,
        first_record_id: u32,
        max_records: usize,
        max_bytes: u64,
    ) -> Result<Vec<Bytes>> {
        let mut cursor = ReadCursor::new(first_record_id, max_records, max_bytes);

        while cursor.needs_more() {
            let state = self.state.lock();
            if cursor.current < state.flushed_record_count {
                drop(state);

                let records = self.handle.changelog.lock().read(
                    cursor.current,
                    cursor.need_records,
                    cursor.need_bytes,
                )?;
                if records.is_empty() {
                    break;
                }
                for record in records {
                    cursor.push(record);
                }
            } else {
                let flush_first = state.flushed_record_count;
                let append_first = flush_first + state.flush_queue.len() as u32;
                cursor.copy_from(&state.flush_queue, flush_first);
                cursor.copy_from(&state.append_queue, append_first);
                break;
            }
        }

        Ok(cursor.records)
    }

    /// Force a flush cycle; the future resolves once everything currently
    /// queued is durable
    pub(crate) fn async_flush(&self) -> FlushFuture {
        let mut state = self.state.lock();
        if state.is_empty() {
            return FlushFuture::ready(self.handle.id);
        }
        state.flush_forced = true;
        FlushFuture::new(Arc::clone(&state.completion))
    }

    /// Block until both queues are empty; `wakeup` nudges the flush thread
    pub(crate) fn wait_until_flushed(&self, wakeup: &dyn Fn()) -> Result<()> {
        loop {
            let future = {
                let mut state = self.state.lock();
                if state.failure.is_some() {
                    return Err(ChangelogError::Unusable { id: self.handle.id });
                }
                if state.is_empty() {
                    return Ok(());
                }
                state.flush_forced = true;
                FlushFuture::new(Arc::clone(&state.completion))
            };
            wakeup();
            future.wait()?;
        }
    }

    /// Records in the changelog, unflushed ones included
    pub(crate) fn record_count(&self) -> u32 {
        self.state.lock().record_count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub(crate) fn set_sealed(&self, sealed: bool) {
        self.state.lock().sealed = sealed;
    }

    /// Adopt the changelog's count after a truncate; both queues must be empty
    pub(crate) fn reset_flushed(&self, record_count: u32) {
        let mut state = self.state.lock();
        debug_assert!(state.is_empty());
        state.flushed_record_count = record_count;
    }

    // =========================================================================
    // Flush Thread Side
    // =========================================================================

    pub(crate) fn has_pending_actions(&self) -> bool {
        let state = self.state.lock();
        if state.flush_forced {
            return true;
        }
        if state.append_queue.is_empty() {
            return false;
        }
        state.byte_size >= self.flush_buffer_size || state.last_flush.elapsed() >= self.flush_period
    }

    /// Write and sync everything in the append queue (flush thread only)
    pub(crate) fn flush(&self) {
        let (records, first_record_id, completion, failure) = {
            let mut state = self.state.lock();
            debug_assert!(state.flush_queue.is_empty());

            let pending = std::mem::take(&mut state.append_queue);
            state.byte_size = 0;
            state.flush_forced = false;
            let next = Completion::new(self.handle.id, self.handle.next_generation());
            let completion = std::mem::replace(&mut state.completion, next);

            // After a failure nothing reaches the disk any more.
            let failure = state.failure.clone();
            if failure.is_none() {
                state.flush_queue = pending;
            }
            (
                state.flush_queue.clone(),
                state.flushed_record_count,
                completion,
                failure,
            )
        };

        let result = match failure {
            Some(reason) => Err(reason),
            None if records.is_empty() => Ok(()),
            None => {
                let mut changelog = self.handle.changelog.lock();
                changelog
                    .append(first_record_id, &records)
                    .and_then(|_| changelog.flush())
                    .map_err(|e| e.to_string())
            }
        };

        {
            let mut state = self.state.lock();
            match &result {
                Ok(()) => state.flushed_record_count += state.flush_queue.len() as u32,
                Err(reason) => {
                    if state.failure.is_none() {
                        tracing::error!(
                            "Flush of changelog {} failed, {} records dropped: {}",
                            self.handle.id,
                            state.flush_queue.len(),
                            reason
                        );
                    }
                    state.failure = Some(reason.clone());
                    *self.handle.failure.lock() = Some(reason.clone());
                }
            }
            state.flush_queue.clear();
            state.last_flush = Instant::now();
        }

        completion.resolve(result);
    }

    /// Release an idle queue; fails while records are queued or callers use it
    pub(crate) fn try_sweep(&self) -> bool {
        let completion = {
            let mut state = self.state.lock();
            if !state.is_empty() || self.use_count.load(Ordering::Acquire) > 0 {
                return false;
            }
            state.flush_forced = false;
            Arc::clone(&state.completion)
        };

        completion.resolve(Ok(()));
        true
    }

    pub(crate) fn use_count(&self) -> usize {
        self.use_count.load(Ordering::Acquire)
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Keeps a queue from being swept while a caller operates on it
pub(crate) struct QueueLease {
    queue: Arc<ChangelogQueue>,
}

impl QueueLease {
    /// Must be taken under the registry lock
    pub(crate) fn new(queue: Arc<ChangelogQueue>) -> Self {
        queue.use_count.fetch_add(1, Ordering::AcqRel);
        Self { queue }
    }
}

impl Deref for QueueLease {
    type Target = ChangelogQueue;

    fn deref(&self) -> &ChangelogQueue {
        &self.queue
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        self.queue.use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Read Cursor
// =============================================================================

/// Accumulates records for `ChangelogQueue::read`
struct ReadCursor {
    records: Vec<Bytes>,
    current: u32,
    need_records: usize,
    need_bytes: u64,
}

impl ReadCursor {
    fn new(first_record_id: u32, max_records: usize, max_bytes: u64) -> Self {
        Self {
            records: Vec::new(),
            current: first_record_id,
            need_records: max_records,
            need_bytes: max_bytes,
        }
    }

    fn needs_more(&self) -> bool {
        self.need_records > 0 && self.need_bytes > 0
    }

    fn push(&mut self, record: Bytes) {
        self.need_records -= 1;
        self.need_bytes = self.need_bytes.saturating_sub(record.len() as u64);
        self.current += 1;
        self.records.push(record);
    }

    /// Copy records from `memory`, whose first record has id `first_memory_id`
    fn copy_from(&mut self, memory: &[Bytes], first_memory_id: u32) {
        if self.current < first_memory_id {
            return;
        }
        let mut index = (self.current - first_memory_id) as usize;
        while index < memory.len() && self.needs_more() {
            self.push(memory[index].clone());
            index += 1;
        }
    }
}

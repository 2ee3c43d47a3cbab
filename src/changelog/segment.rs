//! Changelog segment
//!
//! A data file plus its sparse index. All methods take `&mut self`; callers
//! serialize access (the dispatcher keeps every changelog behind a mutex).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::config::Config;
use crate::error::{ChangelogError, Result};

use super::format::{
    atomic_write_header, with_suffix, EpochId, IndexEntry, LogHeader, INDEX_SUFFIX,
    LOG_HEADER_SIZE,
};
use super::index::ChangelogIndex;
use super::record::{self, Decoded, MAX_RECORD_SIZE};
use super::recovery::{self, RecoveryReport};

/// Lifecycle state of an initialized changelog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangelogState {
    /// Accepts appends and truncation
    Open,
    /// Sealed; only reads until definalized
    Finalized,
}

/// A single changelog segment on disk
///
/// ## Concurrency:
/// - Not internally synchronized: single writer, readers share the same lock
/// - Data and index files are always positioned explicitly before I/O
pub struct Changelog {
    id: i32,
    epoch: EpochId,
    prev_record_count: i32,
    state: ChangelogState,

    /// Data file path; the index lives at `{path}.index`
    path: PathBuf,
    file: File,
    index: ChangelogIndex,

    index_block_size: u64,
    enable_sync: bool,

    /// Number of records in the data file
    record_count: u32,
    /// Offset right after the last record
    current_position: u64,
    /// Bytes of records written since the last index entry
    current_block_size: u64,

    /// Records written since the last flush
    unflushed: bool,
    /// Set after an I/O failure during a mutation
    failed: bool,

    recovery: RecoveryReport,
}

impl Changelog {
    /// Create a new empty changelog at `path`
    ///
    /// Both headers are written through a temp file and a rename, so a crash
    /// never leaves a half-written header under the final names.
    pub fn create(
        path: &Path,
        id: i32,
        epoch: EpochId,
        prev_record_count: i32,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        tracing::debug!("Creating changelog {} at {}", id, path.display());

        let header = LogHeader::new(id, epoch, prev_record_count, false);
        let file = atomic_write_header(path, &header.encode()?)?;
        let index = ChangelogIndex::create(&with_suffix(path, INDEX_SUFFIX))?;

        tracing::debug!("Changelog {} created", id);

        Ok(Self {
            id,
            epoch,
            prev_record_count,
            state: ChangelogState::Open,
            path: path.to_path_buf(),
            file,
            index,
            index_block_size: config.index_block_size,
            enable_sync: config.enable_sync,
            record_count: 0,
            current_position: LOG_HEADER_SIZE,
            current_block_size: 0,
            unflushed: false,
            failed: false,
            recovery: RecoveryReport::default(),
        })
    }

    /// Open an existing changelog, recovering from an unclean shutdown
    ///
    /// On open:
    /// 1. Validate the data file header
    /// 2. Load the index and keep its longest valid prefix
    /// 3. Replay the data file from the last index entry to its end
    /// 4. Cut off a torn tail, if any, and rewrite the index to match
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!("Opening changelog {}", path.display());

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();

        let mut raw = vec![0u8; LOG_HEADER_SIZE.min(file_len) as usize];
        file.read_exact(&mut raw)?;
        let header = LogHeader::decode(&raw, path)?;
        let state = if header.finalized {
            ChangelogState::Finalized
        } else {
            ChangelogState::Open
        };

        let mut index = ChangelogIndex::load(&with_suffix(path, INDEX_SUFFIX))?;
        let loaded = index.len();

        let scan = recovery::scan(&mut file, index.entries(), file_len, config.index_block_size)?;

        if scan.valid_index_len < loaded {
            tracing::warn!(
                "Changelog {} index contains {} incorrect entries, dropped",
                header.changelog_id,
                loaded - scan.valid_index_len
            );
        }
        index.truncate(scan.valid_index_len)?;
        index.append(&scan.new_entries)?;

        if let Some(trim) = &scan.trim {
            if state == ChangelogState::Finalized {
                tracing::error!(
                    "Finalized changelog {} contains a broken record (RecordId: {}, Offset: {}, Damage: {:?})",
                    header.changelog_id,
                    trim.record_id,
                    trim.offset,
                    trim.damage
                );
            } else {
                tracing::warn!(
                    "Broken record found, changelog {} trimmed (RecordId: {}, Offset: {}, Bytes: {}, Damage: {:?})",
                    header.changelog_id,
                    trim.record_id,
                    trim.offset,
                    trim.bytes,
                    trim.damage
                );
            }
            file.set_len(trim.offset)?;
        }

        if config.enable_sync {
            file.sync_data()?;
            index.flush()?;
        }

        let recovery = RecoveryReport {
            record_count: scan.record_count,
            index_entries_loaded: loaded,
            index_entries_dropped: loaded - scan.valid_index_len,
            records_replayed: scan.records_replayed,
            trim: scan.trim,
        };

        tracing::debug!(
            "Changelog {} opened (RecordCount: {}, Finalized: {})",
            header.changelog_id,
            scan.record_count,
            header.finalized
        );

        Ok(Self {
            id: header.changelog_id,
            epoch: header.epoch,
            prev_record_count: header.prev_record_count,
            state,
            path: path.to_path_buf(),
            file,
            index,
            index_block_size: config.index_block_size,
            enable_sync: config.enable_sync,
            record_count: scan.record_count,
            current_position: scan.end_position,
            current_block_size: scan.block_size,
            unflushed: false,
            failed: false,
            recovery,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append `records` with consecutive ids starting at `first_record_id`
    ///
    /// Index entries for the batch hit the index file before the records hit
    /// the data file. Nothing is written if any record is rejected.
    pub fn append(&mut self, first_record_id: u32, records: &[Bytes]) -> Result<()> {
        self.ensure_writable()?;

        if first_record_id != self.record_count {
            return Err(ChangelogError::OutOfOrder {
                id: self.id,
                expected: self.record_count,
                actual: first_record_id,
            });
        }
        if u64::from(first_record_id) + records.len() as u64 > u64::from(u32::MAX) {
            return Err(ChangelogError::InvalidRecord {
                id: self.id,
                record_id: first_record_id,
                reason: "record id space exhausted".to_string(),
            });
        }
        for (i, payload) in records.iter().enumerate() {
            validate_payload(self.id, first_record_id + i as u32, payload)?;
        }
        if records.is_empty() {
            return Ok(());
        }

        tracing::debug!("Appending {} records to changelog {}", records.len(), self.id);

        let encoded: usize = records.iter().map(|r| record::encoded_len(r.len())).sum();
        let mut buf = Vec::with_capacity(encoded);
        let mut new_entries = Vec::new();

        let mut record_id = self.record_count;
        let mut position = self.current_position;
        let mut block_size = self.current_block_size;

        for payload in records {
            if record_id == 0 || block_size >= self.index_block_size {
                new_entries.push(IndexEntry::new(record_id, position));
                block_size = 0;
            }
            let size = record::encode(record_id, payload, &mut buf) as u64;
            block_size += size;
            position += size;
            record_id += 1;
        }

        if let Err(e) = self.write_batch(&new_entries, &buf) {
            self.mark_failed("append", &e);
            return Err(e);
        }

        self.record_count = record_id;
        self.current_position = position;
        self.current_block_size = block_size;
        self.unflushed = true;

        Ok(())
    }

    fn write_batch(&mut self, new_entries: &[IndexEntry], buf: &[u8]) -> Result<()> {
        for entry in new_entries {
            tracing::debug!(
                "Changelog {} index entry added (RecordId: {}, Offset: {})",
                self.id,
                entry.record_id,
                entry.file_position
            );
        }
        self.index.append(new_entries)?;

        self.file.seek(SeekFrom::Start(self.current_position))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Sync both files if anything was appended since the last flush
    pub fn flush(&mut self) -> Result<()> {
        if !self.unflushed {
            return Ok(());
        }

        tracing::debug!("Flushing changelog {}", self.id);
        if self.enable_sync {
            let result = self
                .file
                .sync_data()
                .map_err(ChangelogError::from)
                .and_then(|_| self.index.flush());
            if let Err(e) = result {
                self.mark_failed("flush", &e);
                return Err(e);
            }
        }
        self.unflushed = false;

        tracing::debug!("Changelog {} flushed", self.id);
        Ok(())
    }

    /// Discard every record with id `>= new_record_count`
    ///
    /// Truncating to the current count is a no-op; growing is an error.
    pub fn truncate(&mut self, new_record_count: u32) -> Result<()> {
        self.ensure_writable()?;

        if new_record_count > self.record_count {
            return Err(ChangelogError::InvalidTruncate {
                id: self.id,
                requested: new_record_count,
                record_count: self.record_count,
            });
        }
        if new_record_count == self.record_count {
            return Ok(());
        }

        tracing::info!(
            "Truncating changelog {}: {} -> {}",
            self.id,
            self.record_count,
            new_record_count
        );

        let position = self.record_position(new_record_count)?;
        let keep = self
            .index
            .entries()
            .partition_point(|e| e.record_id < new_record_count);
        let block_start = match keep.checked_sub(1) {
            Some(i) => self.index.entries()[i].file_position,
            None => position,
        };

        if let Err(e) = self.apply_truncate(keep, position) {
            self.mark_failed("truncate", &e);
            return Err(e);
        }

        self.record_count = new_record_count;
        self.current_position = position;
        self.current_block_size = position - block_start;
        self.unflushed = false;

        Ok(())
    }

    fn apply_truncate(&mut self, keep: usize, position: u64) -> Result<()> {
        self.index.truncate(keep)?;
        self.file.set_len(position)?;
        if self.enable_sync {
            self.file.sync_all()?;
            self.index.flush()?;
        }
        Ok(())
    }

    /// Offset of the header of record `record_id` (or the end of the records)
    fn record_position(&mut self, record_id: u32) -> Result<u64> {
        if record_id == self.record_count {
            return Ok(self.current_position);
        }

        let lower = self
            .index
            .lower_bound(record_id)
            .unwrap_or(IndexEntry::new(0, LOG_HEADER_SIZE));
        if lower.record_id == record_id {
            return Ok(lower.file_position);
        }

        let end = self
            .index
            .upper_bound(record_id)
            .map_or(self.current_position, |e| e.file_position);
        let blob = self.read_envelope(lower.file_position, end)?;

        let mut offset = 0usize;
        for current in lower.record_id..record_id {
            match record::decode(&blob.slice(offset..)) {
                Decoded::Record(r) if r.record_id == current => offset += r.encoded_len,
                other => self.fatal_corruption(current, lower.file_position + offset as u64, &other),
            }
        }
        Ok(lower.file_position + offset as u64)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read up to `max_records` records starting at `first_record_id`
    ///
    /// Stops early once `max_bytes` of payload were collected, but always
    /// returns at least one record when one exists. Corruption found here is
    /// fatal: this data was validated when the changelog was opened or written.
    pub fn read(
        &mut self,
        first_record_id: u32,
        max_records: usize,
        max_bytes: u64,
    ) -> Result<Vec<Bytes>> {
        if max_records == 0 || first_record_id >= self.record_count {
            return Ok(Vec::new());
        }

        let available = (self.record_count - first_record_id) as usize;
        let end_record_id = first_record_id + available.min(max_records) as u32;

        tracing::debug!(
            "Reading records {}-{} of changelog {}",
            first_record_id,
            end_record_id - 1,
            self.id
        );

        let lower = self
            .index
            .lower_bound(first_record_id)
            .unwrap_or(IndexEntry::new(0, LOG_HEADER_SIZE));
        let end = self
            .index
            .upper_bound(end_record_id - 1)
            .map_or(self.current_position, |e| e.file_position);
        let blob = self.read_envelope(lower.file_position, end)?;

        let mut records = Vec::with_capacity((end_record_id - first_record_id) as usize);
        let mut bytes = 0u64;
        let mut offset = 0usize;
        for record_id in lower.record_id..end_record_id {
            let decoded = record::decode(&blob.slice(offset..));
            let record = match decoded {
                Decoded::Record(r) if r.record_id == record_id => r,
                other => self.fatal_corruption(record_id, lower.file_position + offset as u64, &other),
            };
            offset += record.encoded_len;

            if record_id >= first_record_id {
                bytes += record.payload.len() as u64;
                records.push(record.payload);
                if bytes >= max_bytes {
                    break;
                }
            }
        }

        Ok(records)
    }

    fn read_envelope(&mut self, start: u64, end: u64) -> Result<Bytes> {
        let mut blob = vec![0u8; (end - start) as usize];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut blob)?;
        Ok(Bytes::from(blob))
    }

    fn fatal_corruption(&self, record_id: u32, offset: u64, decoded: &Decoded) -> ! {
        let detail = match decoded {
            Decoded::Record(r) => format!("found record {}", r.record_id),
            Decoded::EndOfRecords => "unexpected end of records".to_string(),
            Decoded::Corrupt(c) => c.to_string(),
        };
        tracing::error!(
            "Changelog {} is corrupted at record {} (Offset: {}): {}",
            self.id,
            record_id,
            offset,
            detail
        );
        panic!(
            "changelog {} ({}) is corrupted at record {} offset {}: {}",
            self.id,
            self.path.display(),
            record_id,
            offset,
            detail
        );
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Flush and seal the changelog; no-op if already finalized
    pub fn finalize(&mut self) -> Result<()> {
        if self.failed {
            return Err(ChangelogError::Unusable { id: self.id });
        }
        if self.state == ChangelogState::Finalized {
            return Ok(());
        }

        tracing::debug!("Finalizing changelog {}", self.id);
        self.flush()?;
        self.write_header(true)?;
        self.state = ChangelogState::Finalized;
        tracing::info!("Changelog {} finalized", self.id);

        Ok(())
    }

    /// Reopen a finalized changelog for appends
    pub fn definalize(&mut self) -> Result<()> {
        if self.failed {
            return Err(ChangelogError::Unusable { id: self.id });
        }
        if self.state != ChangelogState::Finalized {
            return Err(ChangelogError::NotFinalized { id: self.id });
        }

        tracing::debug!("Definalizing changelog {}", self.id);
        self.write_header(false)?;
        self.state = ChangelogState::Open;
        tracing::info!("Changelog {} definalized", self.id);

        Ok(())
    }

    /// Rewrite the header in place at offset 0
    fn write_header(&mut self, finalized: bool) -> Result<()> {
        let header = LogHeader::new(self.id, self.epoch, self.prev_record_count, finalized);
        let bytes = header.encode()?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        if self.enable_sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Flush and release the file handles
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        tracing::debug!("Changelog {} closed", self.id);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn prev_record_count(&self) -> i32 {
        self.prev_record_count
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn state(&self) -> ChangelogState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == ChangelogState::Finalized
    }

    /// Whether an I/O failure made this changelog reject mutations
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_path(&self) -> &Path {
        self.index.path()
    }

    /// Bytes occupied by records (headers and padding included)
    pub fn data_size(&self) -> u64 {
        self.current_position - LOG_HEADER_SIZE
    }

    /// Number of entries in the sparse index
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// What the last open had to repair
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_writable(&self) -> Result<()> {
        if self.failed {
            return Err(ChangelogError::Unusable { id: self.id });
        }
        if self.state != ChangelogState::Open {
            return Err(ChangelogError::LogClosed { id: self.id });
        }
        Ok(())
    }

    fn mark_failed(&mut self, operation: &str, error: &ChangelogError) {
        tracing::error!("Changelog {} {} failed: {}", self.id, operation, error);
        self.failed = true;
    }
}

pub(crate) fn validate_payload(id: i32, record_id: u32, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(ChangelogError::InvalidRecord {
            id,
            record_id,
            reason: "empty payload".to_string(),
        });
    }
    if payload.len() > MAX_RECORD_SIZE {
        return Err(ChangelogError::InvalidRecord {
            id,
            record_id,
            reason: format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_RECORD_SIZE
            ),
        });
    }
    Ok(())
}

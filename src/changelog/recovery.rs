//! Changelog recovery
//!
//! Recovery after an unclean shutdown runs in two phases:
//! 1. Keep the longest valid prefix of the index (see `valid_prefix_len`),
//!    dropping trailing entries that do not point at a decodable record
//! 2. Replay the data file linearly from the last surviving entry to its end;
//!    the first record that fails to decode marks the torn tail
//!
//! `scan` only reads. `Changelog::open` applies its result, `verify` reports it.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::Result;

use super::format::{with_suffix, IndexEntry, LogHeader, INDEX_SUFFIX, LOG_HEADER_SIZE};
use super::index::{read_entries, valid_prefix_len};
use super::record::{Corruption, Decoded, RecordReader};

/// What was found past the last good record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailDamage {
    /// Fewer bytes than a record header remain
    PartialHeader,
    /// The record at the cut point is malformed
    Corrupt(Corruption),
    /// A well-formed record carries an unexpected id
    WrongRecordId { found: u32 },
}

/// Where and why the data file was (or would be) cut
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trim {
    /// Id the first discarded record would have had
    pub record_id: u32,
    /// Offset the data file is cut at
    pub offset: u64,
    /// Bytes discarded
    pub bytes: u64,
    pub damage: TailDamage,
}

/// Result of a recovery or verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records in the changelog after recovery
    pub record_count: u32,

    /// Entries read from the index file
    pub index_entries_loaded: usize,

    /// Entries discarded as invalid
    pub index_entries_dropped: usize,

    /// Records decoded by the linear replay
    pub records_replayed: u32,

    /// Set when a torn tail was found
    pub trim: Option<Trim>,
}

impl RecoveryReport {
    /// Whether partial writes were (or would be) removed
    pub fn was_truncated(&self) -> bool {
        self.trim.is_some()
    }
}

/// Outcome of `scan`
pub(crate) struct ScanResult {
    /// Index entries to keep
    pub valid_index_len: usize,
    /// Entries to add for records replayed past the last kept entry
    pub new_entries: Vec<IndexEntry>,
    pub record_count: u32,
    /// Offset right after the last good record
    pub end_position: u64,
    /// Bytes of records written since the last index entry
    pub block_size: u64,
    pub records_replayed: u32,
    pub trim: Option<Trim>,
}

/// Validate `entries` against `file` and replay its records up to `file_len`
pub(crate) fn scan(
    file: &mut File,
    entries: &[IndexEntry],
    file_len: u64,
    index_block_size: u64,
) -> Result<ScanResult> {
    let mut valid = valid_prefix_len(entries, file_len);

    // The last kept entry must point at a decodable record with its id.
    while let Some(entry) = valid.checked_sub(1).map(|i| entries[i]) {
        file.seek(SeekFrom::Start(entry.file_position))?;
        let mut reader = RecordReader::new(BufReader::new(&mut *file), entry.file_position);
        match reader.next_record()? {
            Decoded::Record(record) if record.record_id == entry.record_id => break,
            _ => valid -= 1,
        }
    }

    let (start_id, start_position) = match valid.checked_sub(1) {
        Some(i) => (entries[i].record_id, entries[i].file_position),
        None => (0, LOG_HEADER_SIZE),
    };

    file.seek(SeekFrom::Start(start_position))?;
    let mut reader = RecordReader::new(BufReader::new(&mut *file), start_position);

    let mut new_entries = Vec::new();
    let mut record_count = start_id;
    let mut block_size = 0u64;
    let mut records_replayed = 0u32;
    let mut trim = None;

    while reader.position() < file_len {
        let position = reader.position();
        let damage = match reader.next_record()? {
            Decoded::Record(record) if record.record_id == record_count => {
                let indexed = valid > 0 && record.record_id == start_id;
                if !indexed && (record_count == 0 || block_size >= index_block_size) {
                    new_entries.push(IndexEntry::new(record.record_id, position));
                    block_size = 0;
                }
                block_size += record.encoded_len as u64;
                record_count += 1;
                records_replayed += 1;
                continue;
            }
            Decoded::Record(record) => TailDamage::WrongRecordId {
                found: record.record_id,
            },
            Decoded::EndOfRecords => TailDamage::PartialHeader,
            Decoded::Corrupt(corruption) => TailDamage::Corrupt(corruption),
        };

        trim = Some(Trim {
            record_id: record_count,
            offset: position,
            bytes: file_len - position,
            damage,
        });
        break;
    }

    // A record with the wrong id was decoded, so the reader moved past it.
    let end_position = trim.map_or(reader.position(), |t| t.offset);

    Ok(ScanResult {
        valid_index_len: valid,
        new_entries,
        record_count,
        end_position,
        block_size,
        records_replayed,
        trim,
    })
}

/// Check a changelog without modifying it.
///
/// Reports what `Changelog::open` would recover. A missing index is treated
/// as empty; a bad data or index header is an error.
pub fn verify(path: &Path) -> Result<(LogHeader, RecoveryReport)> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut raw = vec![0u8; LOG_HEADER_SIZE.min(file_len) as usize];
    file.read_exact(&mut raw)?;
    let header = LogHeader::decode(&raw, path)?;

    let entries = read_entries(&with_suffix(path, INDEX_SUFFIX))?.unwrap_or_default();
    let result = scan(&mut file, &entries, file_len, u64::MAX)?;

    let report = RecoveryReport {
        record_count: result.record_count,
        index_entries_loaded: entries.len(),
        index_entries_dropped: entries.len() - result.valid_index_len,
        records_replayed: result.records_replayed,
        trim: result.trim,
    };
    Ok((header, report))
}

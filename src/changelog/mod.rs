//! Changelog Module
//!
//! Synchronous, crash-recoverable append-only log segments.
//!
//! ## Responsibilities
//! - Append records with monotonic, gap-free ids
//! - CRC32 checksums for corruption detection
//! - Sparse index for fast positioned reads
//! - Crash recovery: index prefix validation, then linear replay
//! - Truncation of uncommitted tails and finalization
//!
//! ## File Format
//! ```text
//! Data file ({path})
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (40)                                                  │
//! │ ┌─────────┬────────┬───────────┬──────────┬─────────┬──────┐ │
//! │ │ Sig (8) │ Id (4) │ Epoch(16) │ Prev (4) │ Fin (1) │ (7)  │ │
//! │ └─────────┴────────┴───────────┴──────────┴─────────┴──────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record 0                                                     │
//! │ ┌────────┬─────────┬─────────┬──────────┬──────────────────┐ │
//! │ │ Id (4) │ Len (4) │ CRC (8) │ Payload  │ Pad to 8 bytes   │ │
//! │ └────────┴─────────┴─────────┴──────────┴──────────────────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record 1 ...                                                 │
//! └──────────────────────────────────────────────────────────────┘
//!
//! Index file ({path}.index)
//! ┌──────────────────────────────────────┐
//! │ Sig (8) │ EntryCount (4) │ (4)       │
//! ├──────────────────────────────────────┤
//! │ RecordId (4) │ FilePosition (8)      │  one per index block
//! │ ...                                  │
//! └──────────────────────────────────────┘
//! ```

mod format;
mod index;
mod record;
mod recovery;
mod segment;

pub use format::{
    with_suffix, EpochId, IndexEntry, IndexHeader, LogHeader, INDEX_ENTRY_SIZE,
    INDEX_HEADER_SIZE, INDEX_SIGNATURE, INDEX_SUFFIX, LOG_HEADER_SIZE, LOG_SIGNATURE,
    TEMP_SUFFIX,
};
pub use index::{valid_prefix_len, ChangelogIndex};
pub use record::{
    checksum, decode, encode, encoded_len, padded_len, Corruption, Decoded, DecodedRecord,
    RecordHeader, RecordReader, MAX_RECORD_SIZE, RECORD_ALIGNMENT, RECORD_HEADER_SIZE,
};
pub use recovery::{verify, RecoveryReport, TailDamage, Trim};
pub use segment::{Changelog, ChangelogState};

pub(crate) use segment::validate_payload;

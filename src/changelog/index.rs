//! Sparse changelog index
//!
//! Maps a record id to the offset of its header in the data file. Entries are
//! strictly increasing in both fields; the first one always describes record 0
//! right after the data file header.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{ChangelogError, Result};

use super::format::{
    atomic_write_header, IndexEntry, IndexHeader, INDEX_ENTRY_SIZE, INDEX_HEADER_SIZE,
    LOG_HEADER_SIZE,
};

/// In-memory copy of the index plus the file backing it
pub struct ChangelogIndex {
    path: PathBuf,
    file: File,
    entries: Vec<IndexEntry>,
    /// Entries or header written since the last sync
    dirty: bool,
}

impl ChangelogIndex {
    /// Atomically create an empty index at `path`
    pub fn create(path: &Path) -> Result<Self> {
        let file = atomic_write_header(path, &IndexHeader::new(0).encode()?)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            entries: Vec::new(),
            dirty: false,
        })
    }

    /// Load an index without validating its entries.
    ///
    /// A missing file is recreated empty; entries are rebuilt by the replay.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match read_entries(path)? {
            Some(entries) => entries,
            None => {
                tracing::warn!("Changelog index {} is missing, recreating it", path.display());
                return Self::create(path);
            }
        };

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            entries,
            dirty: false,
        })
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// Last entry with `record_id <= id`
    pub fn lower_bound(&self, id: u32) -> Option<IndexEntry> {
        let pos = self.entries.partition_point(|e| e.record_id <= id);
        pos.checked_sub(1).map(|i| self.entries[i])
    }

    /// First entry with `record_id > id`
    pub fn upper_bound(&self, id: u32) -> Option<IndexEntry> {
        let pos = self.entries.partition_point(|e| e.record_id <= id);
        self.entries.get(pos).copied()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Append entries to the file and refresh the header count
    pub fn append(&mut self, new_entries: &[IndexEntry]) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        debug_assert!(new_entries
            .windows(2)
            .all(|w| w[0].record_id < w[1].record_id));
        debug_assert!(match (self.entries.last(), new_entries.first()) {
            (Some(last), Some(first)) => last.record_id < first.record_id,
            _ => true,
        });

        let mut buf = Vec::with_capacity(new_entries.len() * INDEX_ENTRY_SIZE as usize);
        for entry in new_entries {
            bincode::serialize_into(&mut buf, entry)?;
        }

        let offset = INDEX_HEADER_SIZE + self.entries.len() as u64 * INDEX_ENTRY_SIZE;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.entries.extend_from_slice(new_entries);
        self.write_header()?;

        Ok(())
    }

    /// Keep only the first `len` entries, on disk as well as in memory
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        self.entries.truncate(len);
        self.file
            .set_len(INDEX_HEADER_SIZE + self.entries.len() as u64 * INDEX_ENTRY_SIZE)?;
        self.write_header()
    }

    /// Sync pending index writes
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let count = u32::try_from(self.entries.len()).map_err(|_| {
            ChangelogError::Serialization(format!(
                "index {} has too many entries",
                self.path.display()
            ))
        })?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&IndexHeader::new(count).encode()?)?;
        self.dirty = true;
        Ok(())
    }
}

/// Read the raw entries of the index at `path`, or `None` if it does not exist.
///
/// Entries beyond the header's count, or cut short, are ignored.
pub(crate) fn read_entries(path: &Path) -> Result<Option<Vec<IndexEntry>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let header = IndexHeader::decode(&bytes, path)?;

    let stored = (bytes.len() as u64 - INDEX_HEADER_SIZE) / INDEX_ENTRY_SIZE;
    let count = stored.min(u64::from(header.entry_count)) as usize;
    if count < header.entry_count as usize {
        tracing::warn!(
            "Changelog index {} claims {} entries but holds {}",
            path.display(),
            header.entry_count,
            count
        );
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let start = (INDEX_HEADER_SIZE + i as u64 * INDEX_ENTRY_SIZE) as usize;
        let end = start + INDEX_ENTRY_SIZE as usize;
        let entry: IndexEntry = bincode::deserialize(&bytes[start..end])?;
        entries.push(entry);
    }
    Ok(Some(entries))
}

/// Length of the longest prefix of `entries` that can describe a data file
/// of `data_len` bytes.
///
/// The first entry must be `(0, LOG_HEADER_SIZE)`, every later entry must
/// increase in both fields, and no surviving entry may point past the end
/// of the data file.
pub fn valid_prefix_len(entries: &[IndexEntry], data_len: u64) -> usize {
    let mut len = 0;
    for (i, entry) in entries.iter().enumerate() {
        let correct = match i.checked_sub(1) {
            None => entry.record_id == 0 && entry.file_position == LOG_HEADER_SIZE,
            Some(prev) => {
                entry.record_id > entries[prev].record_id
                    && entry.file_position > entries[prev].file_position
            }
        };
        if !correct {
            break;
        }
        len += 1;
    }

    while len > 0 && entries[len - 1].file_position > data_len {
        len -= 1;
    }
    len
}

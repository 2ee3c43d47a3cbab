//! On-disk headers and index entries
//!
//! All structures are encoded with bincode's fixed-int little endian layout,
//! so every one of them has a constant size on disk.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ChangelogError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Magic identifying a changelog data file ("CHGLOG01")
pub const LOG_SIGNATURE: u64 = u64::from_le_bytes(*b"CHGLOG01");

/// Magic identifying a changelog index file ("CHGIDX01")
pub const INDEX_SIGNATURE: u64 = u64::from_le_bytes(*b"CHGIDX01");

/// Signature (8) + Id (4) + Epoch (16) + PrevRecordCount (4) + Finalized (1) + Reserved (7)
pub const LOG_HEADER_SIZE: u64 = 40;

/// Signature (8) + EntryCount (4) + Reserved (4)
pub const INDEX_HEADER_SIZE: u64 = 16;

/// RecordId (4) + FilePosition (8)
pub const INDEX_ENTRY_SIZE: u64 = 12;

/// Suffix appended to the data file path to name its index
pub const INDEX_SUFFIX: &str = ".index";

/// Suffix of files being created; never visible under a final name
pub const TEMP_SUFFIX: &str = ".tmp";

// =============================================================================
// Epoch
// =============================================================================

/// Opaque identifier of the leadership term that created a changelog
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpochId(pub [u8; 16]);

impl EpochId {
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.as_u128())
    }
}

impl fmt::Debug for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EpochId({})", self)
    }
}

// =============================================================================
// Data File Header
// =============================================================================

/// Header at offset 0 of every data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub signature: u64,
    pub changelog_id: i32,
    pub epoch: EpochId,
    pub prev_record_count: i32,
    pub finalized: bool,
    reserved: [u8; 7],
}

impl LogHeader {
    pub fn new(changelog_id: i32, epoch: EpochId, prev_record_count: i32, finalized: bool) -> Self {
        Self {
            signature: LOG_SIGNATURE,
            changelog_id,
            epoch,
            prev_record_count,
            finalized,
            reserved: [0u8; 7],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and validate a header read from `path`
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let header: Self = decode_pod(bytes, LOG_HEADER_SIZE, path)?;
        if header.signature != LOG_SIGNATURE {
            return Err(ChangelogError::CorruptHeader {
                path: path.to_path_buf(),
                reason: format!(
                    "invalid signature: expected {:#018x}, got {:#018x}",
                    LOG_SIGNATURE, header.signature
                ),
            });
        }
        Ok(header)
    }
}

// =============================================================================
// Index File
// =============================================================================

/// Header at offset 0 of every index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub signature: u64,
    pub entry_count: u32,
    reserved: u32,
}

impl IndexHeader {
    pub fn new(entry_count: u32) -> Self {
        Self {
            signature: INDEX_SIGNATURE,
            entry_count,
            reserved: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let header: Self = decode_pod(bytes, INDEX_HEADER_SIZE, path)?;
        if header.signature != INDEX_SIGNATURE {
            return Err(ChangelogError::CorruptHeader {
                path: path.to_path_buf(),
                reason: format!(
                    "invalid index signature: expected {:#018x}, got {:#018x}",
                    INDEX_SIGNATURE, header.signature
                ),
            });
        }
        Ok(header)
    }
}

/// Sparse mapping of a record id to the offset of its header in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub record_id: u32,
    pub file_position: u64,
}

impl IndexEntry {
    pub fn new(record_id: u32, file_position: u64) -> Self {
        Self {
            record_id,
            file_position,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `path` with `suffix` appended to its file name ("a.log" → "a.log.index")
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Write a fresh file holding only `header`, via a temp file and a rename,
/// and return it opened for read/write
pub(crate) fn atomic_write_header(path: &Path, header: &[u8]) -> Result<File> {
    let temp_path = with_suffix(path, TEMP_SUFFIX);
    {
        let mut temp = File::create(&temp_path)?;
        temp.write_all(header)?;
        temp.sync_all()?;
    }
    fs::rename(&temp_path, path)?;

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok(file)
}

fn decode_pod<T: DeserializeOwned>(bytes: &[u8], size: u64, path: &Path) -> Result<T> {
    if (bytes.len() as u64) < size {
        return Err(ChangelogError::CorruptHeader {
            path: path.to_path_buf(),
            reason: format!("header too short: {} of {} bytes", bytes.len(), size),
        });
    }
    bincode::deserialize(&bytes[..size as usize]).map_err(|e| ChangelogError::CorruptHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

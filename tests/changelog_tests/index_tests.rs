//! Tests for the sparse changelog index
//!
//! These tests verify:
//! - Persistence of appended and truncated entries
//! - Bound lookups
//! - Prefix validation against a data file length
//! - Handling of missing and damaged index files

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use changelog::changelog::{
    valid_prefix_len, ChangelogIndex, IndexEntry, IndexHeader, INDEX_ENTRY_SIZE,
    INDEX_HEADER_SIZE, LOG_HEADER_SIZE,
};
use changelog::ChangelogError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_index() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000000000.log.index");
    (temp_dir, path)
}

fn sample_entries() -> Vec<IndexEntry> {
    vec![
        IndexEntry::new(0, LOG_HEADER_SIZE),
        IndexEntry::new(10, 1040),
        IndexEntry::new(25, 2080),
    ]
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_create_empty_index() {
    let (_temp, path) = setup_temp_index();
    let index = ChangelogIndex::create(&path).unwrap();

    assert!(index.is_empty());
    assert_eq!(fs::metadata(&path).unwrap().len(), INDEX_HEADER_SIZE);
}

#[test]
fn test_append_then_load() {
    let (_temp, path) = setup_temp_index();
    {
        let mut index = ChangelogIndex::create(&path).unwrap();
        index.append(&sample_entries()[..2]).unwrap();
        index.append(&sample_entries()[2..]).unwrap();
        index.flush().unwrap();
    }

    let index = ChangelogIndex::load(&path).unwrap();
    assert_eq!(index.entries(), sample_entries().as_slice());
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        INDEX_HEADER_SIZE + 3 * INDEX_ENTRY_SIZE
    );
}

#[test]
fn test_truncate_persists() {
    let (_temp, path) = setup_temp_index();
    {
        let mut index = ChangelogIndex::create(&path).unwrap();
        index.append(&sample_entries()).unwrap();
        index.truncate(1).unwrap();
        index.append(&[IndexEntry::new(5, 600)]).unwrap();
    }

    let index = ChangelogIndex::load(&path).unwrap();
    assert_eq!(
        index.entries(),
        &[IndexEntry::new(0, LOG_HEADER_SIZE), IndexEntry::new(5, 600)]
    );
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_lower_and_upper_bound() {
    let (_temp, path) = setup_temp_index();
    let mut index = ChangelogIndex::create(&path).unwrap();
    index.append(&sample_entries()).unwrap();

    assert_eq!(index.lower_bound(0).unwrap().record_id, 0);
    assert_eq!(index.lower_bound(9).unwrap().record_id, 0);
    assert_eq!(index.lower_bound(10).unwrap().record_id, 10);
    assert_eq!(index.lower_bound(1000).unwrap().record_id, 25);

    assert_eq!(index.upper_bound(0).unwrap().record_id, 10);
    assert_eq!(index.upper_bound(10).unwrap().record_id, 25);
    assert!(index.upper_bound(25).is_none());
    assert_eq!(index.last().unwrap().record_id, 25);
}

#[test]
fn test_bounds_on_empty_index() {
    let (_temp, path) = setup_temp_index();
    let index = ChangelogIndex::create(&path).unwrap();

    assert!(index.lower_bound(0).is_none());
    assert!(index.upper_bound(0).is_none());
    assert!(index.last().is_none());
}

// =============================================================================
// Prefix Validation Tests
// =============================================================================

#[test]
fn test_valid_prefix_accepts_good_entries() {
    assert_eq!(valid_prefix_len(&sample_entries(), 4096), 3);
    assert_eq!(valid_prefix_len(&[], 4096), 0);
}

#[test]
fn test_valid_prefix_requires_first_entry_at_header() {
    let entries = vec![IndexEntry::new(0, 0), IndexEntry::new(10, 1040)];
    assert_eq!(valid_prefix_len(&entries, 4096), 0);

    let entries = vec![IndexEntry::new(1, LOG_HEADER_SIZE)];
    assert_eq!(valid_prefix_len(&entries, 4096), 0);
}

#[test]
fn test_valid_prefix_stops_at_non_increasing_entry() {
    let mut entries = sample_entries();
    entries.insert(2, IndexEntry::new(10, 1500));
    assert_eq!(valid_prefix_len(&entries, 4096), 2);

    let mut entries = sample_entries();
    entries[2].file_position = 1040;
    assert_eq!(valid_prefix_len(&entries, 4096), 2);
}

#[test]
fn test_valid_prefix_drops_entries_past_data_end() {
    assert_eq!(valid_prefix_len(&sample_entries(), 2000), 2);
    assert_eq!(valid_prefix_len(&sample_entries(), 1000), 1);
    assert_eq!(valid_prefix_len(&sample_entries(), 10), 0);
}

// =============================================================================
// Damaged Index Tests
// =============================================================================

#[test]
fn test_load_missing_index_recreates_it() {
    let (_temp, path) = setup_temp_index();
    assert!(!path.exists());

    let index = ChangelogIndex::load(&path).unwrap();
    assert!(index.is_empty());
    assert!(path.exists());
}

#[test]
fn test_load_ignores_partial_trailing_entry() {
    let (_temp, path) = setup_temp_index();
    {
        let mut index = ChangelogIndex::create(&path).unwrap();
        index.append(&sample_entries()).unwrap();
    }
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 5)
        .unwrap();

    let index = ChangelogIndex::load(&path).unwrap();
    assert_eq!(index.entries(), &sample_entries()[..2]);
}

#[test]
fn test_load_trusts_smaller_header_count() {
    let (_temp, path) = setup_temp_index();
    {
        let mut index = ChangelogIndex::create(&path).unwrap();
        index.append(&sample_entries()).unwrap();
    }
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all(&IndexHeader::new(1).encode().unwrap()).unwrap();

    let index = ChangelogIndex::load(&path).unwrap();
    assert_eq!(index.len(), 1);
}

#[test]
fn test_load_rejects_bad_signature() {
    let (_temp, path) = setup_temp_index();
    fs::write(&path, [0xFFu8; INDEX_HEADER_SIZE as usize]).unwrap();

    match ChangelogIndex::load(&path) {
        Err(ChangelogError::CorruptHeader { .. }) => {}
        Err(e) => panic!("expected CorruptHeader, got {}", e),
        Ok(_) => panic!("expected CorruptHeader, got an index"),
    }
}

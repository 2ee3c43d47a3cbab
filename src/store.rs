//! Changelog Store
//!
//! A directory of numbered changelog segments served by one dispatcher.
//!
//! ## Responsibilities
//! - Map changelog ids to `{data_dir}/{id:09}.log`
//! - Clean up temp files left by interrupted creations
//! - Hand out one shared `AsyncChangelog` per open id
//! - Close the least recently used idle changelogs beyond the cache size
//! - Find the latest segment of a contiguous id range

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::async_changelog::AsyncChangelog;
use crate::changelog::{EpochId, TEMP_SUFFIX};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{ChangelogError, Result};

/// Manages the changelogs of one directory
///
/// ## Concurrency:
/// - `changelogs`: open handles, guarded by a mutex so an id is opened once
/// - Evicted changelogs are closed under that mutex, so a reopen never races
///   the close of the previous handle
/// - All methods use `&self`
pub struct ChangelogStore {
    data_dir: PathBuf,

    dispatcher: Dispatcher,

    /// Handles opened or created through this store
    changelogs: Mutex<ChangelogCache>,
}

impl ChangelogStore {
    const LOG_EXTENSION: &'static str = "log";

    /// Open or create a store in `config.data_dir`
    ///
    /// On startup:
    /// 1. Create the directory if it doesn't exist
    /// 2. Remove temp files of interrupted creations
    /// 3. Start the dispatcher
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!("Preparing changelog store at {}", config.data_dir.display());

        fs::create_dir_all(&config.data_dir)?;
        Self::clean_temp_files(&config.data_dir)?;

        let data_dir = config.data_dir.clone();
        let capacity = config.max_cached_changelogs;
        let dispatcher = Dispatcher::new(config)?;

        Ok(Self {
            data_dir,
            dispatcher,
            changelogs: Mutex::new(ChangelogCache::new(capacity)),
        })
    }

    /// Create changelog `id`; fails if it already exists
    pub fn create_changelog(
        &self,
        id: i32,
        epoch: EpochId,
        prev_record_count: i32,
    ) -> Result<AsyncChangelog> {
        let mut changelogs = self.changelogs.lock();
        let path = self.changelog_path(id);
        if changelogs.contains(id) || path.exists() {
            return Err(ChangelogError::AlreadyExists(id));
        }

        let changelog = self
            .dispatcher
            .create_changelog(&path, id, epoch, prev_record_count)?;
        changelogs.insert(id, changelog.clone());
        changelogs.evict_idle();
        tracing::info!("Changelog {} created (Epoch: {})", id, epoch);

        Ok(changelog)
    }

    /// Open changelog `id`; fails with `NoSuchChangelog` if it doesn't exist
    pub fn open_changelog(&self, id: i32) -> Result<AsyncChangelog> {
        self.try_open_changelog(id)?
            .ok_or(ChangelogError::NoSuchChangelog(id))
    }

    /// Open changelog `id`, or `None` if it doesn't exist
    pub fn try_open_changelog(&self, id: i32) -> Result<Option<AsyncChangelog>> {
        let mut changelogs = self.changelogs.lock();
        if let Some(changelog) = changelogs.get(id) {
            changelogs.evict_idle();
            return Ok(Some(changelog));
        }

        let path = self.changelog_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let changelog = self.dispatcher.open_changelog(&path)?;
        changelogs.insert(id, changelog.clone());
        changelogs.evict_idle();
        Ok(Some(changelog))
    }

    /// Highest id of the contiguous run starting at `initial_id`
    ///
    /// Returns `None` if `initial_id` itself doesn't exist.
    pub fn latest_changelog_id(&self, initial_id: i32) -> Option<i32> {
        let mut id = initial_id;
        while self.changelog_path(id).exists() {
            id += 1;
        }
        if id == initial_id {
            None
        } else {
            Some(id - 1)
        }
    }

    /// Ids of every changelog in the directory, ascending
    pub fn list_changelog_ids(&self) -> Result<Vec<i32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(id) = Self::parse_changelog_id(&path) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Flush changelog `id` and forget its handle
    pub fn close_changelog(&self, id: i32) -> Result<()> {
        let changelog = self.changelogs.lock().remove(id);
        match changelog {
            Some(changelog) => changelog.close(),
            None => Ok(()),
        }
    }

    /// Close `changelog` and delete its files
    pub fn remove_changelog(&self, changelog: AsyncChangelog) -> Result<()> {
        self.changelogs.lock().remove(changelog.id());
        changelog.remove()
    }

    /// Close every open changelog and stop the dispatcher
    ///
    /// Every changelog is closed even if one fails; the first error is returned.
    pub fn shutdown(&self) -> Result<()> {
        let changelogs = self.changelogs.lock().drain();

        let mut first_error = None;
        for changelog in changelogs {
            let id = changelog.id();
            if let Err(e) = changelog.close() {
                tracing::error!("Failed to close changelog {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }

        self.dispatcher.shutdown();
        tracing::debug!("Changelog store at {} shut down", self.data_dir.display());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ids of the changelogs currently cached, ascending
    pub fn cached_changelog_ids(&self) -> Vec<i32> {
        let mut ids = self.changelogs.lock().ids();
        ids.sort_unstable();
        ids
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the data file of changelog `id`
    pub fn changelog_path(&self, id: i32) -> PathBuf {
        self.data_dir
            .join(format!("{:09}.{}", id, Self::LOG_EXTENSION))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Parse a changelog id from a data file name
    /// "000000042.log" → Some(42), "000000042.log.index" → None
    fn parse_changelog_id(path: &Path) -> Option<i32> {
        if path.extension()? != Self::LOG_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    fn clean_temp_files(dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.ends_with(TEMP_SUFFIX));
            if is_temp && path.is_file() {
                tracing::debug!("Removing temp file {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

impl Drop for ChangelogStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Changelog store shutdown failed: {}", e);
        }
    }
}

// =============================================================================
// Changelog Cache
// =============================================================================

struct CacheEntry {
    changelog: AsyncChangelog,
    last_used: u64,
}

/// Open changelogs by id, evicting the least recently used idle ones
///
/// A changelog still referenced outside the cache is never evicted, so the
/// cache may exceed its capacity while callers hold handles.
struct ChangelogCache {
    entries: HashMap<i32, CacheEntry>,
    capacity: usize,
    /// Logical clock for `last_used`
    tick: u64,
}

impl ChangelogCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Look up `id` and mark it as most recently used
    fn get(&mut self, id: i32) -> Option<AsyncChangelog> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&id)?;
        entry.last_used = tick;
        Some(entry.changelog.clone())
    }

    fn insert(&mut self, id: i32, changelog: AsyncChangelog) {
        let last_used = self.next_tick();
        self.entries.insert(id, CacheEntry { changelog, last_used });
    }

    fn remove(&mut self, id: i32) -> Option<AsyncChangelog> {
        self.entries.remove(&id).map(|entry| entry.changelog)
    }

    fn drain(&mut self) -> Vec<AsyncChangelog> {
        self.entries.drain().map(|(_, entry)| entry.changelog).collect()
    }

    fn ids(&self) -> Vec<i32> {
        self.entries.keys().copied().collect()
    }

    /// Close idle changelogs, oldest first, until the cache fits
    fn evict_idle(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }

        let mut by_age: Vec<(u64, i32)> = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.last_used, *id))
            .collect();
        by_age.sort_unstable();

        for (_, id) in by_age {
            if self.entries.len() <= self.capacity {
                break;
            }
            let idle = self
                .entries
                .get(&id)
                .map_or(false, |entry| entry.changelog.is_idle());
            if !idle {
                continue;
            }

            if let Some(changelog) = self.remove(id) {
                tracing::debug!("Evicting changelog {} from cache", id);
                if let Err(e) = changelog.close() {
                    tracing::error!("Failed to close evicted changelog {}: {}", id, e);
                }
            }
        }
    }
}

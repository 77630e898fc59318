//! The bounded content-addressed download cache (spec.md §4.2).
//!
//! Entries are regular files named by their SHA3-384 hex digest. `Get` hard-
//! links (falling back to a copy across devices) into the destination and
//! refreshes the entry's mtime; `Put` hard-links the source in and evicts
//! least-recently-used entries, by mtime with a lexicographic filename
//! tiebreak, until back within capacity.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::sync::Mutex;

use store_core::Hash;

use crate::error::from_io;
use store_core::StoreResult;

/// Outcome of a cache [`DownloadCache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
}

/// A bounded, content-addressed cache of downloaded artifacts. A capacity of
/// zero yields a null cache: every operation is a no-op (spec.md §4.2).
pub struct DownloadCache {
    dir: Option<PathBuf>,
    capacity: usize,
    /// Serializes `Put` + eviction so two concurrent inserts don't race the
    /// directory listing used to decide what to evict.
    write_lock: Mutex<()>,
}

impl DownloadCache {
    pub fn new(dir: PathBuf, capacity: usize) -> Self {
        Self {
            dir: if capacity == 0 { None } else { Some(dir) },
            capacity,
            write_lock: Mutex::new(()),
        }
    }

    /// A cache that never stores anything.
    pub fn null() -> Self {
        Self {
            dir: None,
            capacity: 0,
            write_lock: Mutex::new(()),
        }
    }

    /// Changes the capacity in place (`Store::set_cache_downloads`,
    /// spec.md §3). Does not evict retroactively beyond the next `Put`.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if capacity == 0 {
            self.dir = None;
        }
    }

    fn entry_path(&self, hash: &Hash) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(hash.to_hex()))
    }

    /// If `hash` is cached, hard-links (or copies) it to `dst` and touches
    /// the entry's mtime. Returns [`CacheLookup::Miss`] otherwise.
    pub async fn get(&self, hash: &Hash, dst: &Path) -> StoreResult<CacheLookup> {
        let Some(src) = self.entry_path(hash) else {
            return Ok(CacheLookup::Miss);
        };

        if tokio::fs::metadata(&src).await.is_err() {
            return Ok(CacheLookup::Miss);
        }

        if tokio::fs::hard_link(&src, dst).await.is_err() {
            tokio::fs::copy(&src, dst).await.map_err(from_io)?;
        }

        touch(&src).await?;
        Ok(CacheLookup::Hit)
    }

    /// Hard-links `src` into the cache under `hash`, then evicts
    /// least-recently-used entries until at or under capacity.
    pub async fn put(&self, hash: &Hash, src: &Path) -> StoreResult<()> {
        let Some(dst) = self.entry_path(hash) else {
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(from_io)?;
        }

        match tokio::fs::hard_link(src, &dst).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(_) => {
                tokio::fs::copy(src, &dst).await.map_err(from_io)?;
            }
        }

        self.evict_over_capacity().await
    }

    /// Returns the cached path for `hash`, if present.
    pub async fn get_path(&self, hash: &Hash) -> Option<PathBuf> {
        let path = self.entry_path(hash)?;
        tokio::fs::metadata(&path).await.ok().map(|_| path)
    }

    async fn evict_over_capacity(&self) -> StoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let mut entries: Vec<(SystemTime, std::ffi::OsString)> = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(from_io)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(from_io)? {
            let metadata = entry.metadata().await.map_err(from_io)?;
            if !metadata.is_file() {
                continue;
            }
            let mtime = metadata.modified().map_err(from_io)?;
            entries.push((mtime, entry.file_name()));
        }

        if entries.len() <= self.capacity {
            return Ok(());
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let excess = entries.len() - self.capacity;

        for (_, name) in entries.into_iter().take(excess) {
            let _ = tokio::fs::remove_file(dir.join(name)).await;
        }

        Ok(())
    }
}

async fn touch(path: &Path) -> StoreResult<()> {
    let now = filetime_now();
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(now)
    })
    .await
    .map_err(|e| store_core::StoreError::Io(e.to_string()))?
    .map_err(from_io)
}

fn filetime_now() -> SystemTime {
    SystemTime::now()
}

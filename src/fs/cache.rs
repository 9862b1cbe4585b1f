//! Copy-on-access cache for the caching mount variant.
//!
//! The first open of a backing file copies it into the mirrored location
//! under the cache root; later opens reuse that copy for the rest of the
//! mount. The map is shared by all concurrent kernel callbacks, so each
//! original path gets its own slot lock: concurrent first opens of one path
//! perform a single copy and all observe the same cache path, while opens of
//! different paths copy in parallel.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use walkdir::WalkDir;

use crate::fs::inode::join_under;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub copies: u64,
    pub hits: u64,
    pub reused: u64,
}

#[derive(Debug)]
pub struct CacheMaterializer {
    backing_root: PathBuf,
    cache_root: PathBuf,
    entries: DashMap<PathBuf, Arc<Mutex<Option<PathBuf>>>>,
    copies: AtomicU64,
    hits: AtomicU64,
    reused: AtomicU64,
}

impl CacheMaterializer {
    pub fn new(backing_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            backing_root: backing_root.into(),
            cache_root: cache_root.into(),
            entries: DashMap::new(),
            copies: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Mirrored location of `original` under the cache root.
    pub fn cache_path_for(&self, original: &Path) -> io::Result<PathBuf> {
        let relative = original.strip_prefix(&self.backing_root).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is outside backing root {}",
                    original.display(),
                    self.backing_root.display()
                ),
            )
        })?;
        Ok(join_under(&self.cache_root, relative))
    }

    /// Return the cache path for `original`, copying it on first access.
    ///
    /// Anything that is not a regular file (devices, fifos, sockets,
    /// directories) is served from its original location.
    pub fn materialize(&self, original: &Path) -> io::Result<PathBuf> {
        let slot = self.entries.entry(original.to_path_buf()).or_default().clone();
        let mut slot = slot.lock();
        if let Some(cached) = slot.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        let meta = fs::metadata(original)?;
        if !meta.is_file() {
            *slot = Some(original.to_path_buf());
            return Ok(original.to_path_buf());
        }

        let target = self.cache_path_for(original)?;
        if is_fresh_copy(&meta, &target) {
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!(original = %original.display(), cache = %target.display(), "reusing kept cache entry");
        } else {
            copy_into_cache(original, &meta, &target)?;
            self.copies.fetch_add(1, Ordering::Relaxed);
            debug!(original = %original.display(), cache = %target.display(), "materialized");
        }
        *slot = Some(target.clone());
        Ok(target)
    }

    /// Cache path previously recorded for `original`, if any.
    pub fn lookup(&self, original: &Path) -> Option<PathBuf> {
        let slot = self.entries.get(original)?.clone();
        let cached = slot.lock().clone();
        cached
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            copies: self.copies.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }

    /// Regular files currently present under the cache root.
    pub fn list_cached_paths(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.cache_root)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.cache_root)
                    .ok()
                    .map(Path::to_path_buf)
            })
            .collect()
    }
}

/// A copy kept from an earlier mount counts when it matches the original's
/// size and is not older than it.
fn is_fresh_copy(original: &fs::Metadata, target: &Path) -> bool {
    let Ok(cached) = fs::metadata(target) else {
        return false;
    };
    if !cached.is_file() || cached.len() != original.len() {
        return false;
    }
    match (cached.modified(), original.modified()) {
        (Ok(cached), Ok(original)) => cached >= original,
        _ => false,
    }
}

/// Copy through a temporary sibling and rename into place so a reader never
/// observes a partial cache file.
fn copy_into_cache(original: &Path, meta: &fs::Metadata, target: &Path) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut source = fs::File::open(original)?;
    let mut partial = tempfile::Builder::new()
        .prefix(".partial")
        .tempfile_in(parent)?;
    io::copy(&mut source, partial.as_file_mut())?;
    partial.as_file().set_permissions(meta.permissions())?;
    partial.persist(target).map_err(|e| e.error)?;
    Ok(())
}

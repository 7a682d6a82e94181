//! In-memory content cache with an optional disk tier.
//!
//! Content is cached in fixed-size chunks keyed by (path, revision, index).
//! Resident bytes of unpinned paths never exceed the budget; a path is
//! pinned while it has unflushed writes.

use crate::disk_cache::PersistentCache;
use crate::error::FsError;
use crate::path;
use crate::remote::{Downloaded, Revision};
use log::{debug, trace};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChunkKey {
    path: String,
    revision: Revision,
    index: u64,
}

struct Inner {
    lru: LruCache<ChunkKey, Arc<Vec<u8>>>,
    resident: u64,
    /// Paths with unflushed writes.
    pinned: HashSet<String>,
}

impl Inner {
    fn pinned_bytes(&self) -> u64 {
        if self.pinned.is_empty() {
            return 0;
        }
        self.lru
            .iter()
            .filter(|(k, _)| self.pinned.contains(&k.path))
            .map(|(_, v)| v.len() as u64)
            .sum()
    }

    fn remove_where(&mut self, pred: impl Fn(&ChunkKey) -> bool) -> Vec<(ChunkKey, Arc<Vec<u8>>)> {
        let keys: Vec<ChunkKey> = self
            .lru
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self.lru.pop(&key) {
                self.resident -= v.len() as u64;
                removed.push((key, v));
            }
        }
        removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentStats {
    pub resident: u64,
    pub unpinned: u64,
    pub chunks: usize,
}

pub struct ContentCache {
    inner: Mutex<Inner>,
    budget: u64,
    chunk_size: u64,
    disk: Option<Arc<PersistentCache>>,
}

impl ContentCache {
    pub fn new(budget: u64, chunk_size: u64, disk: Option<Arc<PersistentCache>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                resident: 0,
                pinned: HashSet::new(),
            }),
            budget,
            chunk_size: chunk_size.max(1),
            disk,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn get_chunk(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        if let Some(hit) = self.inner.lock().lru.get(key) {
            return Some(Arc::clone(hit));
        }
        let disk = self.disk.as_ref()?;
        let data = disk.get(&key.path, key.revision.as_str(), key.index)?;
        trace!("disk cache hit for {} chunk {}", key.path, key.index);
        let data = Arc::new(data);
        self.insert(key.clone(), Arc::clone(&data));
        Some(data)
    }

    fn insert(&self, key: ChunkKey, data: Arc<Vec<u8>>) {
        let mut inner = self.inner.lock();
        inner.resident += data.len() as u64;
        if let Some(old) = inner.lru.put(key, data) {
            inner.resident -= old.len() as u64;
        }
        self.evict(&mut inner);
    }

    /// Drop least-recently-used unpinned chunks until under budget.
    fn evict(&self, inner: &mut Inner) {
        if inner.resident <= self.budget {
            return;
        }
        let mut unpinned = inner.resident - inner.pinned_bytes();
        while unpinned > self.budget {
            let victim = inner
                .lru
                .iter()
                .rev()
                .find(|(k, _)| !inner.pinned.contains(&k.path))
                .map(|(k, _)| k.clone());
            let Some(key) = victim else { break };
            if let Some(v) = inner.lru.pop(&key) {
                let len = v.len() as u64;
                inner.resident -= len;
                unpinned -= len;
                trace!("evicted {} chunk {} ({} bytes)", key.path, key.index, len);
            }
        }
    }

    /// Read `[offset, offset + size)` of `revision`, clamped to `file_size`.
    ///
    /// Missing chunks are fetched through `fetch` one at a time; chunks
    /// fetched before a failure stay cached, so a retried read resumes at
    /// the failed chunk. A fetch that returns another revision fails with
    /// `Conflict` and drops everything cached for the path.
    pub fn read_range(
        &self,
        path: &str,
        revision: &Revision,
        offset: u64,
        size: u32,
        file_size: u64,
        mut fetch: impl FnMut(Range<u64>) -> Result<Downloaded, FsError>,
    ) -> Result<Vec<u8>, FsError> {
        let end = (offset + size as u64).min(file_size);
        if offset >= end {
            return Ok(Vec::new());
        }

        let first = offset / self.chunk_size;
        let last = (end - 1) / self.chunk_size;
        let mut out = Vec::with_capacity((end - offset) as usize);

        for index in first..=last {
            let key = ChunkKey {
                path: path.to_string(),
                revision: revision.clone(),
                index,
            };
            let chunk = match self.get_chunk(&key) {
                Some(c) => c,
                None => {
                    let start = index * self.chunk_size;
                    let chunk_end = (start + self.chunk_size).min(file_size);
                    let downloaded = fetch(start..chunk_end)?;
                    if &downloaded.revision != revision {
                        debug!(
                            "{} changed remotely ({} -> {})",
                            path, revision, downloaded.revision
                        );
                        self.invalidate(path);
                        return Err(FsError::Conflict(path.to_string()));
                    }
                    if let Some(disk) = &self.disk {
                        disk.put(path, revision.as_str(), index, &downloaded.data);
                    }
                    let data = Arc::new(downloaded.data);
                    self.insert(key, Arc::clone(&data));
                    data
                }
            };

            let chunk_start = index * self.chunk_size;
            let from = offset.saturating_sub(chunk_start) as usize;
            let to = ((end - chunk_start) as usize).min(chunk.len());
            if from >= to {
                // Remote content shorter than the size we were told.
                break;
            }
            out.extend_from_slice(&chunk[from..to]);
        }
        Ok(out)
    }

    /// Cache content we just uploaded as `revision`.
    pub fn store(&self, path: &str, revision: &Revision, data: &[u8]) {
        for (index, chunk) in data.chunks(self.chunk_size as usize).enumerate() {
            let key = ChunkKey {
                path: path.to_string(),
                revision: revision.clone(),
                index: index as u64,
            };
            self.insert(key, Arc::new(chunk.to_vec()));
        }
    }

    /// Drop cached content of `path` and everything below it.
    pub fn invalidate(&self, path: &str) {
        let removed = self.inner.lock().remove_where(|k| path::is_within(&k.path, path));
        if !removed.is_empty() {
            trace!("dropped {} cached chunks under {}", removed.len(), path);
        }
        if let Some(disk) = &self.disk {
            disk.invalidate(path);
        }
    }

    /// Drop content of `path` for any revision other than `keep`.
    pub fn retain_revision(&self, path: &str, keep: &Revision) {
        self.inner
            .lock()
            .remove_where(|k| k.path == path && &k.revision != keep);
        if let Some(disk) = &self.disk {
            disk.retain_revision(path, keep.as_str());
        }
    }

    /// Re-key cached content under `from` to `to`.
    pub fn rename(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock();
        inner.remove_where(|k| path::is_within(&k.path, to));
        let moved = inner.remove_where(|k| path::is_within(&k.path, from));
        let pins: Vec<String> = inner
            .pinned
            .iter()
            .filter(|p| path::is_within(p, from) || path::is_within(p, to))
            .cloned()
            .collect();
        for pin in pins {
            inner.pinned.remove(&pin);
            if path::is_within(&pin, from) {
                inner.pinned.insert(path::rebase(&pin, from, to));
            }
        }
        for (mut key, data) in moved {
            key.path = path::rebase(&key.path, from, to);
            inner.resident += data.len() as u64;
            inner.lru.put(key, data);
        }
        self.evict(&mut inner);
        drop(inner);
        if let Some(disk) = &self.disk {
            disk.invalidate(from);
            disk.invalidate(to);
        }
    }

    pub fn pin(&self, path: &str) {
        self.inner.lock().pinned.insert(path.to_string());
    }

    pub fn unpin(&self, path: &str) {
        let mut inner = self.inner.lock();
        if inner.pinned.remove(path) {
            self.evict(&mut inner);
        }
    }

    /// Drop pins of `path` and everything below it.
    pub fn unpin_subtree(&self, root: &str) {
        let mut inner = self.inner.lock();
        inner.pinned.retain(|p| !path::is_within(p, root));
        self.evict(&mut inner);
    }

    pub fn is_pinned(&self, path: &str) -> bool {
        self.inner.lock().pinned.contains(path)
    }

    pub fn stats(&self) -> ContentStats {
        let inner = self.inner.lock();
        ContentStats {
            resident: inner.resident,
            unpinned: inner.resident - inner.pinned_bytes(),
            chunks: inner.lru.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use std::cell::Cell;

    fn source(data: &'static [u8], rev: &'static str) -> impl Fn(Range<u64>) -> Result<Downloaded, FsError> {
        move |r| {
            let end = (r.end as usize).min(data.len());
            Ok(Downloaded {
                data: data[r.start as usize..end].to_vec(),
                revision: Revision::new(rev),
            })
        }
    }

    #[test]
    fn test_chunked_read_and_cache_hit() {
        let cache = ContentCache::new(1024, 4, None);
        let rev = Revision::new("r1");
        let calls = Cell::new(0);
        let fetch = source(b"0123456789", "r1");
        let counted = |r: Range<u64>| {
            calls.set(calls.get() + 1);
            fetch(r)
        };

        let out = cache.read_range("/f", &rev, 2, 6, 10, counted).unwrap();
        assert_eq!(out, b"234567");
        assert_eq!(calls.get(), 2);

        let out = cache
            .read_range("/f", &rev, 0, 8, 10, |_| panic!("should be cached"))
            .unwrap();
        assert_eq!(out, b"01234567");

        // Past the end of what was fetched: chunk 2 is downloaded now.
        let out = cache.read_range("/f", &rev, 6, 100, 10, counted).unwrap();
        assert_eq!(out, b"6789");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_failed_read_resumes_from_last_chunk() {
        let cache = ContentCache::new(1024, 4, None);
        let rev = Revision::new("r1");
        let fetch = source(b"abcdefghijkl", "r1");
        let attempt = Cell::new(0);
        let flaky = |r: Range<u64>| {
            attempt.set(attempt.get() + 1);
            if r.start == 8 {
                Err(FsError::Remote(RemoteError::Network("reset".into())))
            } else {
                fetch(r)
            }
        };
        assert!(cache.read_range("/f", &rev, 0, 12, 12, flaky).is_err());
        assert_eq!(attempt.get(), 3);

        let fetched = Cell::new(Vec::new());
        let out = cache
            .read_range("/f", &rev, 0, 12, 12, |r| {
                let mut seen = fetched.take();
                seen.push(r.start);
                fetched.set(seen);
                fetch(r)
            })
            .unwrap();
        assert_eq!(out, b"abcdefghijkl");
        assert_eq!(fetched.take(), vec![8]);
    }

    #[test]
    fn test_revision_mismatch_is_conflict() {
        let cache = ContentCache::new(1024, 4, None);
        let err = cache
            .read_range("/f", &Revision::new("r1"), 0, 4, 8, source(b"zzzzzzzz", "r2"))
            .unwrap_err();
        assert!(matches!(err, FsError::Conflict(_)));
        assert_eq!(cache.stats().chunks, 0);
    }

    #[test]
    fn test_eviction_keeps_unpinned_within_budget() {
        let cache = ContentCache::new(8, 4, None);
        let rev = Revision::new("r1");
        cache.pin("/pinned");
        cache
            .read_range("/pinned", &rev, 0, 8, 8, source(b"PPPPPPPP", "r1"))
            .unwrap();
        for name in ["/a", "/b", "/c"] {
            cache
                .read_range(name, &rev, 0, 8, 8, source(b"xxxxxxxx", "r1"))
                .unwrap();
            let stats = cache.stats();
            assert!(stats.unpinned <= 8, "unpinned {} over budget", stats.unpinned);
        }
        // Pinned content survived while others were evicted.
        assert_eq!(cache.stats().resident, 16);

        cache.unpin("/pinned");
        assert!(!cache.is_pinned("/pinned"));
        assert!(cache.stats().resident <= 8);
    }

    #[test]
    fn test_rename_rekeys_content() {
        let cache = ContentCache::new(1024, 4, None);
        let rev = Revision::new("r1");
        cache
            .read_range("/d/f", &rev, 0, 4, 4, source(b"data", "r1"))
            .unwrap();
        cache.pin("/d/f");
        cache.rename("/d", "/e");
        assert!(cache.is_pinned("/e/f"));
        assert!(!cache.is_pinned("/d/f"));
        let out = cache
            .read_range("/e/f", &rev, 0, 4, 4, |_| panic!("should be cached"))
            .unwrap();
        assert_eq!(out, b"data");
    }
}

//! Per-path lock manager with hierarchical awareness.
//!
//! Three modes:
//! - `Read`: shared access to one node.
//! - `Write`: exclusive access to one node.
//! - `Subtree`: exclusive access to a node *and everything below it*.
//!
//! Read and Write only conflict on the same path, so operations on siblings
//! (or on a directory and one of its files) run concurrently. Subtree is
//! taken by structural operations (rename, rmdir) and conflicts with any
//! lock on or below its path, and with any Subtree lock on an ancestor.
//!
//! Multi-path acquisition is all-or-nothing under one mutex, with the
//! requested paths in lexical order, so two crossing renames cannot
//! deadlock.

use crate::error::FsError;
use crate::path;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    Subtree,
}

#[derive(Debug, Clone, Default)]
struct LockEntry {
    readers: u32,
    writer: Option<u64>,
    subtree: Option<u64>,
}

impl LockEntry {
    fn is_idle(&self) -> bool {
        self.readers == 0 && self.writer.is_none() && self.subtree.is_none()
    }

    fn is_exclusive(&self) -> bool {
        self.writer.is_some() || self.subtree.is_some()
    }
}

#[derive(Debug, Clone)]
struct HandleInfo {
    path: String,
    mode: LockMode,
}

/// Conflict checks and entry mutation happen under one mutex.
#[derive(Debug, Default)]
struct LockState {
    locks: HashMap<String, LockEntry>,
    handles: HashMap<u64, HandleInfo>,
}

impl LockState {
    fn ancestor_subtree(&self, path: &str) -> bool {
        path::ancestors(path)
            .into_iter()
            .any(|anc| self.locks.get(anc).is_some_and(|e| e.subtree.is_some()))
    }

    fn descendant_held(&self, path: &str) -> bool {
        self.locks
            .iter()
            .any(|(key, entry)| key != path && path::is_within(key, path) && !entry.is_idle())
    }

    fn conflicts(&self, path: &str, mode: LockMode) -> bool {
        if self.ancestor_subtree(path) {
            return true;
        }
        let entry = self.locks.get(path);
        match mode {
            LockMode::Read => entry.is_some_and(|e| e.is_exclusive()),
            LockMode::Write => entry.is_some_and(|e| !e.is_idle()),
            LockMode::Subtree => {
                entry.is_some_and(|e| !e.is_idle()) || self.descendant_held(path)
            }
        }
    }

    fn grant(&mut self, handle: u64, path: &str, mode: LockMode) {
        let entry = self.locks.entry(path.to_string()).or_default();
        match mode {
            LockMode::Read => entry.readers += 1,
            LockMode::Write => entry.writer = Some(handle),
            LockMode::Subtree => entry.subtree = Some(handle),
        }
        self.handles.insert(
            handle,
            HandleInfo {
                path: path.to_string(),
                mode,
            },
        );
    }

    fn release(&mut self, handle: u64) -> bool {
        let info = match self.handles.remove(&handle) {
            Some(info) => info,
            None => return false,
        };
        if let Some(entry) = self.locks.get_mut(&info.path) {
            match info.mode {
                LockMode::Read => entry.readers = entry.readers.saturating_sub(1),
                LockMode::Write => {
                    if entry.writer == Some(handle) {
                        entry.writer = None;
                    }
                }
                LockMode::Subtree => {
                    if entry.subtree == Some(handle) {
                        entry.subtree = None;
                    }
                }
            }
            if entry.is_idle() {
                self.locks.remove(&info.path);
            }
        }
        true
    }
}

/// In-process lock table keyed by normalized path.
#[derive(Debug)]
pub struct PathLocks {
    state: Mutex<LockState>,
    notify: Condvar,
    next_handle: AtomicU64,
    timeout: Duration,

    acquire_count: AtomicU64,
    contention_count: AtomicU64,
    timeout_count: AtomicU64,
}

/// Releases its locks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    handles: Vec<u64>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.handles);
    }
}

/// Aggregate counters, for debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub acquire_count: u64,
    pub contention_count: u64,
    pub timeout_count: u64,
    pub active_locks: usize,
}

impl PathLocks {
    /// `timeout` bounds every wait; a wait that runs out fails with `Busy`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            notify: Condvar::new(),
            next_handle: AtomicU64::new(0),
            timeout,
            acquire_count: AtomicU64::new(0),
            contention_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, path: &str, mode: LockMode) -> Result<PathGuard<'_>, FsError> {
        self.acquire_many(&[(path, mode)])
    }

    /// Acquire every `(path, mode)` pair at once, or none of them.
    pub fn acquire_many(&self, requests: &[(&str, LockMode)]) -> Result<PathGuard<'_>, FsError> {
        let mut sorted: Vec<(String, LockMode)> = requests
            .iter()
            .map(|(p, m)| (path::normalize(p), *m))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(handles) = self.try_acquire_locked(&mut state, &sorted) {
                self.acquire_count.fetch_add(1, Ordering::Relaxed);
                return Ok(PathGuard {
                    locks: self,
                    handles,
                });
            }

            self.contention_count.fetch_add(1, Ordering::Relaxed);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.timeout_count.fetch_add(1, Ordering::Relaxed);
                let paths: Vec<&str> = sorted.iter().map(|(p, _)| p.as_str()).collect();
                debug!("lock wait timed out on {:?}", paths);
                return Err(FsError::Busy(paths.join(", ")));
            }
            // Spurious wakeups and timeouts both fall through to a re-check.
            self.notify.wait_for(&mut state, remaining);
        }
    }

    fn try_acquire_locked(
        &self,
        state: &mut LockState,
        requests: &[(String, LockMode)],
    ) -> Option<Vec<u64>> {
        let mut granted = Vec::with_capacity(requests.len());
        for (path, mode) in requests {
            if state.conflicts(path, *mode) {
                for handle in granted {
                    state.release(handle);
                }
                return None;
            }
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
            state.grant(handle, path, *mode);
            granted.push(handle);
        }
        Some(granted)
    }

    fn release(&self, handles: &[u64]) {
        {
            let mut state = self.state.lock();
            for handle in handles {
                state.release(*handle);
            }
        }
        self.notify.notify_all();
    }

    pub fn is_locked(&self, path: &str) -> bool {
        let norm = path::normalize(path);
        self.state
            .lock()
            .locks
            .get(&norm)
            .is_some_and(|entry| !entry.is_idle())
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquire_count: self.acquire_count.load(Ordering::Relaxed),
            contention_count: self.contention_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            active_locks: self.state.lock().locks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn make() -> PathLocks {
        PathLocks::new(Duration::from_millis(50))
    }

    #[test]
    fn test_basic_acquire_release() {
        let mgr = make();
        {
            let _g = mgr.acquire("/foo", LockMode::Write).unwrap();
            assert!(mgr.is_locked("/foo"));
        }
        assert!(!mgr.is_locked("/foo"));
    }

    #[test]
    fn test_read_read_coexist() {
        let mgr = make();
        let _a = mgr.acquire("/foo", LockMode::Read).unwrap();
        let _b = mgr.acquire("/foo", LockMode::Read).unwrap();
        assert!(mgr.is_locked("/foo"));
    }

    #[test]
    fn test_write_blocks_read_until_timeout() {
        let mgr = make();
        let _w = mgr.acquire("/foo", LockMode::Write).unwrap();
        assert!(matches!(mgr.acquire("/foo", LockMode::Read), Err(FsError::Busy(_))));
        assert_eq!(mgr.stats().timeout_count, 1);
    }

    #[test]
    fn test_siblings_and_parent_do_not_conflict() {
        let mgr = make();
        let _a = mgr.acquire("/d/a", LockMode::Write).unwrap();
        let _b = mgr.acquire("/d/b", LockMode::Write).unwrap();
        let _d = mgr.acquire("/d", LockMode::Read).unwrap();
    }

    #[test]
    fn test_subtree_excludes_descendants() {
        let mgr = make();
        let _s = mgr.acquire("/d", LockMode::Subtree).unwrap();
        assert!(mgr.acquire("/d/a", LockMode::Read).is_err());
        assert!(mgr.acquire("/d/x/y", LockMode::Write).is_err());
        assert!(mgr.acquire("/d", LockMode::Read).is_err());
        assert!(mgr.acquire("/other", LockMode::Write).is_ok());
    }

    #[test]
    fn test_descendant_blocks_subtree() {
        let mgr = make();
        let _r = mgr.acquire("/d/a/b", LockMode::Read).unwrap();
        assert!(mgr.acquire("/d", LockMode::Subtree).is_err());
        assert!(mgr.acquire("/", LockMode::Subtree).is_err());
        assert!(mgr.acquire("/e", LockMode::Subtree).is_ok());
    }

    #[test]
    fn test_acquire_many_is_all_or_nothing() {
        let mgr = make();
        let held = mgr.acquire("/b", LockMode::Write).unwrap();
        assert!(mgr
            .acquire_many(&[("/a", LockMode::Subtree), ("/b", LockMode::Subtree)])
            .is_err());
        // Nothing of the failed request may linger.
        assert!(!mgr.is_locked("/a"));
        drop(held);
        let _both = mgr
            .acquire_many(&[("/b", LockMode::Subtree), ("/a", LockMode::Subtree)])
            .unwrap();
        assert!(mgr.is_locked("/a"));
        assert!(mgr.is_locked("/b"));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let mgr = Arc::new(PathLocks::new(Duration::from_secs(5)));
        let guard = mgr.acquire("/f", LockMode::Write).unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.acquire("/f", LockMode::Write).map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_crossing_multi_acquire_does_not_deadlock() {
        let mgr = Arc::new(PathLocks::new(Duration::from_secs(10)));
        let done = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let (a, b) = if i % 2 == 0 { ("/x", "/y") } else { ("/y", "/x") };
                    for _ in 0..100 {
                        let _g = mgr
                            .acquire_many(&[(a, LockMode::Subtree), (b, LockMode::Subtree)])
                            .unwrap();
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(mgr.stats().active_locks, 0);
    }
}

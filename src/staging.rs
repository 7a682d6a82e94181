//! Staging store: not-yet-flushed file content, one buffer per path.
//!
//! A staged buffer is authoritative for its path until an upload succeeds.
//! At most one handle owns a dirty buffer at a time; ownerless dirty
//! buffers (left behind by a failed release) are picked up by the next
//! flush of the path or by the unmount flush.

use crate::error::FsError;
use crate::handle::HandleId;
use crate::path;
use crate::remote::Revision;
use crate::spool::SpoolBuffer;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
pub struct StagedFile {
    pub buffer: SpoolBuffer,
    /// Revision the buffer was loaded from; `None` for a file the remote
    /// has never seen.
    pub base: Option<Revision>,
    pub dirty: bool,
    pub owner: Option<HandleId>,
    /// Handles that reference this buffer.
    pub opens: usize,
    /// Bumped on every mutation.
    version: u64,
}

/// Content handed to an upload.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub base: Option<Revision>,
    pub version: u64,
}

pub struct StagingStore {
    files: Mutex<HashMap<String, StagedFile>>,
    cleared: Condvar,
    threshold: u64,
}

impl StagingStore {
    pub fn new(spool_threshold: u64) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            cleared: Condvar::new(),
            threshold: spool_threshold,
        }
    }

    pub fn is_staged(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.files.lock().get(path).is_some_and(|f| f.dirty)
    }

    pub fn owner(&self, path: &str) -> Option<HandleId> {
        self.files.lock().get(path).and_then(|f| f.owner)
    }

    pub fn len(&self, path: &str) -> Option<u64> {
        self.files.lock().get(path).map(|f| f.buffer.len())
    }

    /// Load `data` as the clean content of `path` unless a buffer exists.
    pub fn load(&self, path: &str, data: Vec<u8>, base: Option<Revision>) -> Result<(), FsError> {
        let mut files = self.files.lock();
        if files.contains_key(path) {
            return Ok(());
        }
        let buffer = SpoolBuffer::from_bytes(data, self.threshold)?;
        files.insert(
            path.to_string(),
            StagedFile {
                buffer,
                base,
                dirty: false,
                owner: None,
                opens: 0,
                version: 0,
            },
        );
        Ok(())
    }

    pub fn add_ref(&self, path: &str) {
        if let Some(f) = self.files.lock().get_mut(path) {
            f.opens += 1;
        }
    }

    /// Drop one reference; a clean buffer nobody references is discarded.
    pub fn release_ref(&self, path: &str, handle: HandleId) {
        let mut files = self.files.lock();
        let drop_it = match files.get_mut(path) {
            Some(f) => {
                f.opens = f.opens.saturating_sub(1);
                if f.owner == Some(handle) {
                    f.owner = None;
                }
                f.opens == 0 && !f.dirty
            }
            None => false,
        };
        if drop_it {
            files.remove(path);
        }
        drop(files);
        self.cleared.notify_all();
    }

    /// Make `handle` the owner of the buffer's dirty data.
    ///
    /// Fails with `Busy` if another handle already owns it.
    pub fn claim(&self, path: &str, handle: HandleId) -> Result<(), FsError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(path)
            .ok_or_else(|| FsError::Internal(format!("no staged buffer for {}", path)))?;
        match file.owner {
            Some(owner) if owner != handle && file.dirty => {
                Err(FsError::Busy(format!("{} has unflushed writes from handle {}", path, owner)))
            }
            _ => {
                file.owner = Some(handle);
                Ok(())
            }
        }
    }

    /// True if a handle other than `handle` owns dirty data for `path`.
    pub fn held_by_other(&self, path: &str, handle: Option<HandleId>) -> bool {
        self.files
            .lock()
            .get(path)
            .is_some_and(|f| f.dirty && f.owner.is_some() && f.owner != handle)
    }

    /// Block until no other handle owns dirty data for `path`, or `deadline`.
    pub fn wait_until_free(&self, path: &str, handle: Option<HandleId>, deadline: Instant) -> bool {
        let mut files = self.files.lock();
        loop {
            let held = files
                .get(path)
                .is_some_and(|f| f.dirty && f.owner.is_some() && f.owner != handle);
            if !held {
                return true;
            }
            if self.cleared.wait_until(&mut files, deadline).timed_out() {
                return false;
            }
        }
    }

    pub fn read(&self, path: &str, offset: u64, size: u32) -> Option<Result<Vec<u8>, FsError>> {
        let mut files = self.files.lock();
        let file = files.get_mut(path)?;
        Some(file.buffer.read_at(offset, size).map_err(FsError::from))
    }

    /// Stage bytes at `offset`; returns the new length.
    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        self.mutate(path, |buf| buf.write_at(offset, data))
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<u64, FsError> {
        self.mutate(path, |buf| buf.truncate(size))
    }

    fn mutate(
        &self,
        path: &str,
        f: impl FnOnce(&mut SpoolBuffer) -> std::io::Result<()>,
    ) -> Result<u64, FsError> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(path)
            .ok_or_else(|| FsError::Internal(format!("no staged buffer for {}", path)))?;
        f(&mut file.buffer)?;
        file.dirty = true;
        file.version += 1;
        Ok(file.buffer.len())
    }

    pub fn snapshot(&self, path: &str) -> Result<Option<Snapshot>, FsError> {
        let mut files = self.files.lock();
        let file = match files.get_mut(path) {
            Some(f) if f.dirty => f,
            _ => return Ok(None),
        };
        Ok(Some(Snapshot {
            data: file.buffer.contents()?,
            base: file.base.clone(),
            version: file.version,
        }))
    }

    /// The upload of `version` succeeded as `revision`.
    pub fn mark_clean(&self, path: &str, version: u64, revision: Revision) {
        let mut files = self.files.lock();
        let drop_it = match files.get_mut(path) {
            Some(f) => {
                f.base = Some(revision);
                if f.version == version {
                    f.dirty = false;
                    f.owner = None;
                }
                f.opens == 0 && !f.dirty
            }
            None => false,
        };
        if drop_it {
            files.remove(path);
        }
        drop(files);
        self.cleared.notify_all();
    }

    /// Point the buffer at a newer remote revision (conflict retry).
    pub fn rebase(&self, path: &str, base: Option<Revision>) {
        if let Some(f) = self.files.lock().get_mut(path) {
            f.base = base;
        }
    }

    /// Forget everything staged under `root` (unlink, rmdir).
    pub fn discard(&self, root: &str) {
        let mut files = self.files.lock();
        let before = files.len();
        files.retain(|p, _| !path::is_within(p, root));
        if files.len() != before {
            debug!("discarded {} staged buffers under {}", before - files.len(), root);
        }
        drop(files);
        self.cleared.notify_all();
    }

    /// Re-key buffers under `from` to live under `to`.
    pub fn rename(&self, from: &str, to: &str) {
        let mut files = self.files.lock();
        files.retain(|p, _| !path::is_within(p, to));
        let moved: Vec<String> = files
            .keys()
            .filter(|p| path::is_within(p, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(f) = files.remove(&old) {
                files.insert(path::rebase(&old, from, to), f);
            }
        }
    }

    pub fn dirty_paths(&self) -> Vec<String> {
        self.dirty_paths_within("/")
    }

    pub fn dirty_paths_within(&self, root: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files
            .lock()
            .iter()
            .filter(|(p, f)| f.dirty && path::is_within(p, root))
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> StagingStore {
        StagingStore::new(1024)
    }

    #[test]
    fn test_write_marks_dirty_and_mark_clean_releases() {
        let s = store();
        s.load("/f", b"abc".to_vec(), Some(Revision::new("r1"))).unwrap();
        s.add_ref("/f");
        assert!(!s.is_dirty("/f"));

        s.claim("/f", 1).unwrap();
        assert_eq!(s.write("/f", 3, b"def").unwrap(), 6);
        let snap = s.snapshot("/f").unwrap().unwrap();
        assert_eq!(snap.data, b"abcdef");
        assert_eq!(snap.base, Some(Revision::new("r1")));

        s.mark_clean("/f", snap.version, Revision::new("r2"));
        assert!(!s.is_dirty("/f"));
        assert!(s.snapshot("/f").unwrap().is_none());
        assert_eq!(s.owner("/f"), None);
    }

    #[test]
    fn test_second_owner_is_busy() {
        let s = store();
        s.load("/f", Vec::new(), None).unwrap();
        s.claim("/f", 1).unwrap();
        s.write("/f", 0, b"x").unwrap();
        assert!(matches!(s.claim("/f", 2), Err(FsError::Busy(_))));
        assert!(s.held_by_other("/f", Some(2)));
        assert!(!s.held_by_other("/f", Some(1)));
    }

    #[test]
    fn test_failed_release_keeps_ownerless_dirty_data() {
        let s = store();
        s.load("/f", Vec::new(), None).unwrap();
        s.add_ref("/f");
        s.claim("/f", 7).unwrap();
        s.write("/f", 0, b"data").unwrap();
        s.release_ref("/f", 7);

        assert!(s.is_staged("/f"));
        assert!(s.is_dirty("/f"));
        assert_eq!(s.owner("/f"), None);
        assert_eq!(s.dirty_paths(), vec!["/f".to_string()]);
    }

    #[test]
    fn test_wait_until_free_times_out_and_wakes() {
        let s = std::sync::Arc::new(store());
        s.load("/f", Vec::new(), None).unwrap();
        s.claim("/f", 1).unwrap();
        s.write("/f", 0, b"x").unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!s.wait_until_free("/f", Some(2), deadline));

        let waiter = {
            let s = std::sync::Arc::clone(&s);
            std::thread::spawn(move || {
                s.wait_until_free("/f", Some(2), Instant::now() + Duration::from_secs(5))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        let version = s.snapshot("/f").unwrap().unwrap().version;
        s.mark_clean("/f", version, Revision::new("r1"));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_rename_and_discard_subtree() {
        let s = store();
        s.load("/d/a", b"1".to_vec(), None).unwrap();
        s.load("/d/sub/b", b"2".to_vec(), None).unwrap();
        s.load("/other", b"3".to_vec(), None).unwrap();

        s.rename("/d", "/e");
        assert!(s.is_staged("/e/a"));
        assert!(s.is_staged("/e/sub/b"));
        assert!(!s.is_staged("/d/a"));

        s.discard("/e");
        assert!(!s.is_staged("/e/a"));
        assert!(s.is_staged("/other"));
    }
}

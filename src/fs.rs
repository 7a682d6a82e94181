//! Filesystem operation adapter.
//!
//! [`CloudFs`] owns every piece of cache state for one mount and turns
//! POSIX-shaped calls into resolver, cache and remote operations. Each
//! operation takes its path locks at entry and never re-locks internally.
//!
//! Writes are staged locally and only reach the remote on flush/release.
//! Uploads are conditional on the revision the data was based on; a
//! mismatch refreshes the revision and retries once (latest write wins),
//! so a retried upload whose first response was lost cannot create a
//! second copy.

use crate::config::{FsConfig, WriterPolicy};
use crate::content::{ContentCache, ContentStats};
use crate::disk_cache::PersistentCache;
use crate::error::FsError;
use crate::handle::{Handle, HandleId, HandleState, HandleTable, OpenMode};
use crate::lock::{LockMode, PathGuard, PathLocks};
use crate::metadata::MetadataCache;
use crate::path;
use crate::remote::{EntryKind, RemoteEntry, RemoteStorage, Revision, WriteMode};
use crate::resolver::Resolver;
use crate::retry::OpKind;
use crate::staging::StagingStore;
use crate::tree::NodeAttrs;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Reported when the remote does not know its quota (1 PiB).
const UNKNOWN_TOTAL_SPACE: u64 = 1 << 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attrs: NodeAttrs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

pub struct CloudFs {
    resolver: Resolver,
    meta: Arc<MetadataCache>,
    content: ContentCache,
    staging: StagingStore,
    handles: HandleTable,
    locks: PathLocks,
    disk: Option<Arc<PersistentCache>>,
    mounted: Arc<AtomicBool>,
    config: FsConfig,
}

impl CloudFs {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        config: FsConfig,
        disk: Option<Arc<PersistentCache>>,
    ) -> Self {
        let meta = Arc::new(MetadataCache::new(config.attr_ttl, config.dir_ttl));
        let mounted = Arc::new(AtomicBool::new(true));
        let resolver = Resolver::new(remote, Arc::clone(&meta), config.retry, Arc::clone(&mounted));
        let fs = Self {
            resolver,
            meta,
            content: ContentCache::new(config.cache_budget, config.chunk_size, disk.clone()),
            staging: StagingStore::new(config.spool_threshold),
            handles: HandleTable::new(),
            locks: PathLocks::new(config.lock_timeout),
            disk,
            mounted,
            config,
        };
        if let Some(disk) = &fs.disk {
            fs.reconcile_disk_cache(disk);
        }
        fs
    }

    fn reconcile_disk_cache(&self, disk: &PersistentCache) {
        match self.resolver.call(OpKind::Metadata, "/", |r| r.metadata("/")) {
            Ok(root) => {
                if let Err(e) = disk.reconcile_root(root.revision.as_str()) {
                    warn!("Disk cache reconcile failed: {}", e);
                }
            }
            Err(e) => {
                warn!("Could not read root revision ({}), clearing disk cache", e);
                if let Err(e) = disk.clear() {
                    warn!("Disk cache clear failed: {}", e);
                }
            }
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    fn ensure_mounted(&self) -> Result<(), FsError> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(FsError::Unmounted)
        }
    }

    /// Lock the path a handle points at, re-checking after the wait in case
    /// a rename moved the handle meanwhile.
    fn lock_handle(&self, id: HandleId, mode: LockMode) -> Result<(Handle, PathGuard<'_>), FsError> {
        loop {
            let before = self.handles.get(id)?;
            let guard = self.locks.acquire(&before.path, mode)?;
            let handle = self.handles.get(id)?;
            if handle.path == before.path {
                return Ok((handle, guard));
            }
        }
    }

    /// Apply the single-writer policy while another handle owns dirty data.
    /// Must be called without holding the path lock.
    fn wait_for_writer(&self, path: &str, handle: Option<HandleId>) -> Result<(), FsError> {
        match self.config.writer_policy {
            WriterPolicy::Reject => {
                debug!("rejecting second writer on {}", path);
                Err(FsError::Busy(path.to_string()))
            }
            WriterPolicy::Queue => {
                debug!("queueing writer on {} behind the current owner", path);
                let deadline = Instant::now() + self.config.lock_timeout;
                if self.staging.wait_until_free(path, handle, deadline) {
                    Ok(())
                } else {
                    Err(FsError::Busy(path.to_string()))
                }
            }
        }
    }

    /// Staged length wins over the cached size.
    fn overlay(&self, path: &str, mut attrs: NodeAttrs) -> NodeAttrs {
        if let Some(len) = self.staging.len(path) {
            attrs.size = len;
        }
        attrs
    }

    /// Run a read against `attrs`; on a revision conflict refresh the
    /// metadata and try exactly once more.
    fn read_consistent<T>(
        &self,
        path: &str,
        attrs: NodeAttrs,
        f: impl Fn(&NodeAttrs) -> Result<T, FsError>,
    ) -> Result<T, FsError> {
        match f(&attrs) {
            Err(FsError::Conflict(_)) => {
                debug!("{} changed while reading, retrying with fresh metadata", path);
                let fresh = self.resolver.refresh(path)?;
                f(&fresh)
            }
            other => other,
        }
    }

    fn read_revision(
        &self,
        path: &str,
        revision: &Revision,
        offset: u64,
        size: u32,
        file_size: u64,
    ) -> Result<Vec<u8>, FsError> {
        self.content
            .read_range(path, revision, offset, size, file_size, |range| {
                self.resolver
                    .call(OpKind::Download, path, |r| r.download(path, range.clone()))
            })
    }

    fn read_all(&self, path: &str, attrs: &NodeAttrs) -> Result<Vec<u8>, FsError> {
        let revision = match &attrs.revision {
            Some(rev) => rev,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(attrs.size as usize);
        while (out.len() as u64) < attrs.size {
            let offset = out.len() as u64;
            let want = (attrs.size - offset).min(u32::MAX as u64) as u32;
            let part = self.read_revision(path, revision, offset, want, attrs.size)?;
            if part.is_empty() {
                break;
            }
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    /// Make sure `path` has a staged buffer, downloading the current content
    /// unless `with_content` is false.
    fn stage(&self, path: &str, attrs: &NodeAttrs, with_content: bool) -> Result<(), FsError> {
        if self.staging.is_staged(path) {
            return Ok(());
        }
        if !with_content || attrs.size == 0 {
            return self.staging.load(path, Vec::new(), attrs.revision.clone());
        }
        let (data, base) = self.read_consistent(path, attrs.clone(), |a| {
            Ok((self.read_all(path, a)?, a.revision.clone()))
        })?;
        self.staging.load(path, data, base)
    }

    /// Mutate the staged buffer, tracking the clean -> dirty transition.
    fn write_staged(
        &self,
        owner: Option<HandleId>,
        path: &str,
        mutate: impl FnOnce(&StagingStore) -> Result<u64, FsError>,
    ) -> Result<u64, FsError> {
        if let Some(id) = owner {
            self.staging.claim(path, id)?;
        }
        let was_dirty = self.staging.is_dirty(path);
        let len = mutate(&self.staging)?;
        if !was_dirty {
            self.content.pin(path);
            let mut attrs = self.meta.peek(path).unwrap_or(NodeAttrs {
                kind: EntryKind::File,
                size: 0,
                revision: None,
                mtime: SystemTime::now(),
            });
            attrs.size = len;
            attrs.mtime = SystemTime::now();
            self.meta.put_pending(path, attrs)?;
        }
        if let Some(id) = owner {
            self.handles.transition(id, HandleState::Dirty)?;
        }
        Ok(len)
    }

    /// Upload `data` conditionally on `base`. A conflict refreshes the
    /// revision and retries once; a second conflict is surfaced.
    fn upload_content(
        &self,
        path: &str,
        data: &[u8],
        base: Option<Revision>,
    ) -> Result<RemoteEntry, FsError> {
        let mode = base.map_or(WriteMode::Add, WriteMode::Update);
        match self.upload_once(path, data, mode) {
            Err(FsError::Conflict(_)) | Err(FsError::AlreadyExists(_)) => {
                info!("{} changed remotely, uploading over the latest revision", path);
                self.meta.invalidate(path);
                let fresh = match self.resolver.call(OpKind::Metadata, path, |r| r.metadata(path)) {
                    Ok(entry) => Some(entry.revision),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                self.staging.rebase(path, fresh.clone());
                let mode = fresh.map_or(WriteMode::Add, WriteMode::Update);
                match self.upload_once(path, data, mode) {
                    Err(FsError::Conflict(_)) | Err(FsError::AlreadyExists(_)) => {
                        Err(FsError::Conflict(path.to_string()))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn upload_once(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<RemoteEntry, FsError> {
        self.resolver
            .call(OpKind::Upload, path, |r| r.upload(path, data, mode.clone()))
    }

    /// Upload the staged buffer of `path` if dirty. Caller holds the path lock.
    ///
    /// With `handle` set, data owned by another handle is left alone.
    fn flush_locked(&self, path: &str, handle: Option<HandleId>) -> Result<(), FsError> {
        if handle.is_some() && self.staging.held_by_other(path, handle) {
            return Ok(());
        }
        let snapshot = match self.staging.snapshot(path)? {
            Some(s) => s,
            None => return Ok(()),
        };
        let actor = handle
            .or_else(|| self.staging.owner(path))
            .filter(|id| self.handles.get(*id).is_ok());
        if let Some(id) = actor {
            self.handles.transition(id, HandleState::Flushing)?;
        }

        match self.upload_content(path, &snapshot.data, snapshot.base.clone()) {
            Ok(entry) => {
                self.staging
                    .mark_clean(path, snapshot.version, entry.revision.clone());
                if !self.staging.is_dirty(path) {
                    self.content.unpin(path);
                }
                self.content.retain_revision(path, &entry.revision);
                self.content.store(path, &entry.revision, &snapshot.data);
                self.meta.put(path, NodeAttrs::from(&entry))?;
                if let Some(id) = actor {
                    self.handles.transition(id, HandleState::Clean)?;
                }
                debug!(
                    "flushed {} ({} bytes) as revision {}",
                    path,
                    snapshot.data.len(),
                    entry.revision
                );
                Ok(())
            }
            Err(e) => {
                if let Some(id) = actor {
                    let _ = self.handles.transition(id, HandleState::Dirty);
                }
                warn!("flush of {} failed: {}", path, e);
                Err(e)
            }
        }
    }

    /// Create an empty remote file. Caller holds the path lock.
    fn create_remote(&self, path: &str, exclusive: bool) -> Result<NodeAttrs, FsError> {
        let parent = path::parent(path).unwrap_or("/");
        if !self.resolver.resolve(parent)?.is_dir() {
            return Err(FsError::NotADirectory(parent.to_string()));
        }

        self.meta.put_pending(
            path,
            NodeAttrs {
                kind: EntryKind::File,
                size: 0,
                revision: None,
                mtime: SystemTime::now(),
            },
        )?;

        let entry = match self.upload_once(path, &[], WriteMode::Add) {
            Ok(entry) => entry,
            Err(FsError::AlreadyExists(_)) => {
                // Another client won the race, or a retried call already
                // created it before its response got lost.
                match self.resolver.call(OpKind::Metadata, path, |r| r.metadata(path)) {
                    Ok(existing) if !existing.is_dir() && (existing.size == 0 || !exclusive) => {
                        existing
                    }
                    Ok(_) => {
                        self.meta.rollback(path);
                        return Err(FsError::AlreadyExists(path.to_string()));
                    }
                    Err(e) => {
                        self.meta.rollback(path);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.meta.rollback(path);
                return Err(e);
            }
        };

        let attrs = NodeAttrs::from(&entry);
        self.meta.put(path, attrs.clone())?;
        info!("created {}", path);
        Ok(attrs)
    }

    /// Drop local state for a path removed remotely.
    fn forget_local(&self, path: &str) {
        self.staging.discard(path);
        self.content.unpin_subtree(path);
        self.content.invalidate(path);
        self.meta.remove(path);
    }

    /// Delete remotely. `NotFound` counts as done: it is what a retried
    /// delete whose first response was lost sees.
    fn delete_remote(&self, path: &str) -> Result<(), FsError> {
        match self.resolver.call(OpKind::Delete, path, |r| r.delete(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("{} already gone remotely", path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn getattr(&self, path: &str) -> Result<NodeAttrs, FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        let _guard = self.locks.acquire(&path, LockMode::Read)?;
        let attrs = self.resolver.resolve(&path)?;
        Ok(self.overlay(&path, attrs))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        let _guard = self.locks.acquire(&path, LockMode::Read)?;
        let children = self.resolver.children(&path)?;
        Ok(children
            .into_iter()
            .map(|c| {
                let child = path::join(&path, &c.name);
                DirEntry {
                    attrs: self.overlay(&child, c.attrs),
                    name: c.name,
                }
            })
            .collect())
    }

    /// Open `path` with POSIX `flags` (`O_CREAT`, `O_EXCL`, `O_TRUNC`,
    /// `O_APPEND` and the access mode are honoured).
    pub fn open(&self, path: &str, flags: i32) -> Result<HandleId, FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        let mode = OpenMode::from_flags(flags);
        let create = flags & libc::O_CREAT != 0;
        let exclusive = create && flags & libc::O_EXCL != 0;
        let truncate = flags & libc::O_TRUNC != 0 && mode.can_write();
        let lock_mode = if mode.can_write() || create {
            LockMode::Write
        } else {
            LockMode::Read
        };

        loop {
            let guard = self.locks.acquire(&path, lock_mode)?;
            if mode.can_write() && self.staging.held_by_other(&path, None) {
                drop(guard);
                self.wait_for_writer(&path, None)?;
                continue;
            }
            return self.open_locked(&path, mode, create, exclusive, truncate);
        }
    }

    fn open_locked(
        &self,
        path: &str,
        mode: OpenMode,
        create: bool,
        exclusive: bool,
        truncate: bool,
    ) -> Result<HandleId, FsError> {
        let attrs = match self.resolver.resolve(path) {
            Ok(_) if exclusive => return Err(FsError::AlreadyExists(path.to_string())),
            Ok(attrs) => attrs,
            Err(e) if e.is_not_found() && create => self.create_remote(path, exclusive)?,
            Err(e) => return Err(e),
        };
        if attrs.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        if mode.can_write() {
            self.stage(path, &attrs, !truncate)?;
        }
        let id = self.handles.allocate(path, mode);
        if mode.can_write() {
            self.staging.add_ref(path);
        }

        let ready = self.handles.transition(id, HandleState::Clean).and_then(|()| {
            if truncate {
                self.write_staged(Some(id), path, |s| s.truncate(path, 0))
                    .map(|_| ())
            } else {
                Ok(())
            }
        });
        if let Err(e) = ready {
            if mode.can_write() {
                self.staging.release_ref(path, id);
            }
            let _ = self.handles.transition(id, HandleState::Closed);
            return Err(e);
        }

        debug!("opened {} as handle {} ({:?})", path, id, mode);
        Ok(id)
    }

    /// Create (if missing) and open. `O_EXCL` fails on an existing file.
    pub fn create(&self, path: &str, flags: i32) -> Result<HandleId, FsError> {
        self.open(path, flags | libc::O_CREAT)
    }

    pub fn read(&self, id: HandleId, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        self.ensure_mounted()?;
        let (handle, _guard) = self.lock_handle(id, LockMode::Read)?;
        if !handle.mode.can_read() {
            return Err(FsError::BadHandle(id));
        }
        let path = handle.path.as_str();

        if let Some(staged) = self.staging.read(path, offset, size) {
            return staged;
        }

        let attrs = self.resolver.resolve(path)?;
        if attrs.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.read_consistent(path, attrs, |a| match &a.revision {
            Some(rev) => self.read_revision(path, rev, offset, size, a.size),
            None => Ok(Vec::new()),
        })
    }

    /// Stage `data` at `offset` (at the end for append handles). Never
    /// contacts the remote unless the file has to be loaded first.
    pub fn write(&self, id: HandleId, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.ensure_mounted()?;
        let (handle, _guard) = loop {
            let (handle, guard) = self.lock_handle(id, LockMode::Write)?;
            if !self.staging.held_by_other(&handle.path, Some(id)) {
                break (handle, guard);
            }
            drop(guard);
            self.wait_for_writer(&handle.path, Some(id))?;
        };
        if !handle.mode.can_write() {
            return Err(FsError::BadHandle(id));
        }
        let path = handle.path.as_str();

        if !self.staging.is_staged(path) {
            // Buffer was dropped by an unlink or rename of the target.
            let attrs = self.resolver.resolve(path)?;
            self.stage(path, &attrs, true)?;
            self.staging.add_ref(path);
        }

        let offset = if handle.mode.append {
            self.staging.len(path).unwrap_or(0)
        } else {
            offset
        };
        self.write_staged(Some(id), path, |s| s.write(path, offset, data))?;
        Ok(data.len() as u32)
    }

    pub fn flush(&self, id: HandleId) -> Result<(), FsError> {
        self.ensure_mounted()?;
        let (handle, _guard) = self.lock_handle(id, LockMode::Write)?;
        if !handle.mode.can_write() {
            return Ok(());
        }
        self.flush_locked(&handle.path, Some(id))
    }

    /// Flush (for writers) and close. A failed flush still closes the
    /// handle; the data stays staged for the next flush of the path or the
    /// unmount flush.
    pub fn release(&self, id: HandleId) -> Result<(), FsError> {
        let lock_mode = if self.handles.get(id)?.mode.can_write() {
            LockMode::Write
        } else {
            LockMode::Read
        };
        let (handle, _guard) = self.lock_handle(id, lock_mode)?;

        let result = if handle.mode.can_write() && self.is_mounted() {
            self.flush_locked(&handle.path, Some(id))
        } else {
            Ok(())
        };
        if handle.mode.can_write() {
            self.staging.release_ref(&handle.path, id);
        }
        if let Err(e) = &result {
            warn!("release of {} kept unflushed data: {}", handle.path, e);
        }
        self.handles.transition(id, HandleState::Closed)?;
        result
    }

    /// Set the size of `path`. If a writer has it open the staged buffer is
    /// truncated; otherwise the new content is uploaded right away.
    pub fn truncate(&self, path: &str, size: u64, handle: Option<HandleId>) -> Result<NodeAttrs, FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        let _guard = loop {
            let guard = self.locks.acquire(&path, LockMode::Write)?;
            if !self.staging.held_by_other(&path, handle) {
                break guard;
            }
            drop(guard);
            self.wait_for_writer(&path, handle)?;
        };

        let attrs = self.resolver.resolve(&path)?;
        if attrs.is_dir() {
            return Err(FsError::IsADirectory(path));
        }
        let open_for_write = self.handles.has_writer(&path);
        let current = self.staging.len(&path).unwrap_or(attrs.size);
        if size == current && !self.staging.is_dirty(&path) {
            return Ok(self.overlay(&path, attrs));
        }

        self.stage(&path, &attrs, size > 0)?;
        let owner = handle.filter(|id| {
            self.handles
                .get(*id)
                .is_ok_and(|h| h.path == path && h.mode.can_write())
        });
        self.write_staged(owner, &path, |s| s.truncate(&path, size))?;
        if !open_for_write {
            self.flush_locked(&path, None)?;
        }

        let attrs = self.resolver.resolve(&path)?;
        Ok(self.overlay(&path, attrs))
    }

    pub fn mkdir(&self, path: &str) -> Result<NodeAttrs, FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        if path == "/" {
            return Err(FsError::AlreadyExists(path));
        }
        let _guard = self.locks.acquire(&path, LockMode::Write)?;

        let parent = path::parent(&path).unwrap_or("/");
        if !self.resolver.resolve(parent)?.is_dir() {
            return Err(FsError::NotADirectory(parent.to_string()));
        }
        match self.resolver.resolve(&path) {
            Ok(_) => return Err(FsError::AlreadyExists(path)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let entry = match self
            .resolver
            .call(OpKind::CreateFolder, &path, |r| r.create_folder(&path))
        {
            Ok(entry) => entry,
            Err(FsError::AlreadyExists(_)) => {
                let existing = self
                    .resolver
                    .call(OpKind::Metadata, &path, |r| r.metadata(&path))?;
                if !existing.is_dir() {
                    return Err(FsError::AlreadyExists(path));
                }
                existing
            }
            Err(e) => return Err(e),
        };

        let attrs = NodeAttrs::from(&entry);
        self.meta.put(&path, attrs.clone())?;
        info!("created directory {}", path);
        Ok(attrs)
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        let _guard = self.locks.acquire(&path, LockMode::Write)?;

        let attrs = self.resolver.resolve(&path)?;
        if attrs.is_dir() {
            return Err(FsError::IsADirectory(path));
        }
        self.delete_remote(&path)?;
        self.forget_local(&path);
        info!("deleted {}", path);
        Ok(())
    }

    /// Remove an empty directory. Emptiness is checked against the cached
    /// view and then re-verified with a fresh remote listing.
    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.ensure_mounted()?;
        let path = path::normalize(path);
        if path == "/" {
            return Err(FsError::InvalidArgument("cannot remove the root".to_string()));
        }
        let _guard = self.locks.acquire(&path, LockMode::Subtree)?;

        let attrs = self.resolver.resolve(&path)?;
        if !attrs.is_dir() {
            return Err(FsError::NotADirectory(path));
        }
        if !self.staging.dirty_paths_within(&path).is_empty()
            || !self.resolver.children(&path)?.is_empty()
        {
            return Err(FsError::NotEmpty(path));
        }
        let remote_children = self.resolver.list_remote(&path)?;
        if !remote_children.is_empty() {
            debug!(
                "{} gained {} entries remotely, refusing rmdir",
                path,
                remote_children.len()
            );
            return Err(FsError::NotEmpty(path));
        }

        self.delete_remote(&path)?;
        self.forget_local(&path);
        info!("removed directory {}", path);
        Ok(())
    }

    /// Move `from` to `to`, replacing a compatible destination unless
    /// `no_replace` is set.
    pub fn rename(&self, from: &str, to: &str, no_replace: bool) -> Result<(), FsError> {
        self.ensure_mounted()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        if from == "/" || to == "/" {
            return Err(FsError::InvalidArgument("cannot rename the root".to_string()));
        }
        if from != to && path::is_within(&to, &from) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} into itself",
                from
            )));
        }

        // A subtree lock on an ancestor already covers the other path.
        let _guard = if path::is_within(&from, &to) {
            self.locks.acquire(&to, LockMode::Subtree)?
        } else {
            self.locks.acquire_many(&[
                (from.as_str(), LockMode::Subtree),
                (to.as_str(), LockMode::Subtree),
            ])?
        };

        let src = self.resolver.resolve(&from)?;
        if from == to {
            return Ok(());
        }
        let to_parent = path::parent(&to).unwrap_or("/");
        if !self.resolver.resolve(to_parent)?.is_dir() {
            return Err(FsError::NotADirectory(to_parent.to_string()));
        }

        let replaces = match self.resolver.resolve(&to) {
            Ok(dst) => {
                if no_replace {
                    return Err(FsError::AlreadyExists(to));
                }
                if src.is_dir() && !dst.is_dir() {
                    return Err(FsError::NotADirectory(to));
                }
                if !src.is_dir() && dst.is_dir() {
                    return Err(FsError::IsADirectory(to));
                }
                if dst.is_dir() {
                    if !self.resolver.children(&to)?.is_empty() {
                        return Err(FsError::NotEmpty(to));
                    }
                    // The replaced directory is deleted recursively, so its
                    // emptiness has to hold remotely too.
                    if !self.resolver.list_remote(&to)?.is_empty() {
                        debug!("{} gained entries remotely, refusing rename onto it", to);
                        return Err(FsError::NotEmpty(to));
                    }
                }
                true
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        // Content must be on the remote before the remote moves it.
        for dirty in self.staging.dirty_paths_within(&from) {
            self.flush_locked(&dirty, None)?;
        }

        if replaces {
            self.delete_remote(&to)?;
            self.forget_local(&to);
        }

        let entry = match self
            .resolver
            .call(OpKind::Move, &from, |r| r.move_path(&from, &to))
        {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => {
                // A retried move whose first response was lost.
                match self.resolver.call(OpKind::Metadata, &to, |r| r.metadata(&to)) {
                    Ok(entry) if entry.kind == src.kind => entry,
                    _ => {
                        if replaces {
                            warn!("{} was replaced but moving {} onto it failed", to, from);
                        }
                        self.meta.forget(&from);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                // The remote has no atomic replace: the old destination is
                // already gone at this point.
                if replaces {
                    warn!("{} was replaced but moving {} onto it failed: {}", to, from, e);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.meta.rename(&from, &to) {
            debug!("could not relink {} -> {} in cache ({}), dropping both", from, to, e);
            self.meta.remove(&from);
            self.meta.invalidate(&to);
        } else {
            self.meta.put(&to, NodeAttrs::from(&entry))?;
        }
        self.staging.rename(&from, &to);
        self.handles.rename(&from, &to);
        self.content.rename(&from, &to);

        info!("renamed {} -> {}", from, to);
        Ok(())
    }

    pub fn statfs(&self) -> Result<FsStats, FsError> {
        self.ensure_mounted()?;
        let usage = self
            .resolver
            .call(OpKind::SpaceUsage, "/", |r| r.space_usage())?;
        Ok(match usage {
            Some(u) if u.allocated > 0 => FsStats {
                total_bytes: u.allocated.max(u.used),
                used_bytes: u.used,
            },
            Some(u) => FsStats {
                total_bytes: UNKNOWN_TOTAL_SPACE,
                used_bytes: u.used,
            },
            None => FsStats {
                total_bytes: UNKNOWN_TOTAL_SPACE,
                used_bytes: 0,
            },
        })
    }

    /// Forget cached metadata and content under `path` (event-based
    /// invalidation). Staged writes are untouched.
    pub fn invalidate(&self, path: &str) {
        let path = path::normalize(path);
        debug!("invalidating {}", path);
        self.meta.invalidate_subtree(&path);
        self.content.invalidate(&path);
    }

    /// Flush everything dirty, then stop applying remote results.
    /// Operations afterwards fail with `Unmounted`.
    pub fn shutdown(&self) {
        if !self.is_mounted() {
            return;
        }
        let dirty = self.staging.dirty_paths();
        if !dirty.is_empty() {
            info!("Flushing {} dirty files before unmount", dirty.len());
        }
        for p in dirty {
            let result = self
                .locks
                .acquire(&p, LockMode::Write)
                .and_then(|_guard| self.flush_locked(&p, None));
            if let Err(e) = result {
                error!("Could not flush {} before unmount: {}", p, e);
            }
        }

        if let Some(disk) = &self.disk {
            match self.resolver.call(OpKind::Metadata, "/", |r| r.metadata("/")) {
                Ok(root) => {
                    if let Err(e) = disk.set_root_revision(root.revision.as_str()) {
                        warn!("Could not record root revision: {}", e);
                    }
                }
                Err(e) => warn!("Could not read root revision at unmount: {}", e),
            }
        }

        self.mounted.store(false, Ordering::Release);
        self.meta.seal();
        let stats = self.locks.stats();
        debug!(
            "lock stats: {} acquires, {} contended, {} timed out",
            stats.acquire_count, stats.contention_count, stats.timeout_count
        );
        info!("Filesystem shut down");
    }

    pub fn handle_state(&self, id: HandleId) -> Option<HandleState> {
        self.handles.get(id).ok().map(|h| h.state)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.staging.is_dirty(&path::normalize(path))
    }

    pub fn content_stats(&self) -> ContentStats {
        self.content.stats()
    }

    pub fn check_invariants(&self) -> Result<(), FsError> {
        self.meta.check_invariants()
    }
}

impl Drop for CloudFs {
    fn drop(&mut self) {
        self.shutdown();
    }
}

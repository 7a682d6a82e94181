//! Path resolution and directory listings on top of the metadata cache.
//!
//! Every remote call made here goes through the retry policy and is only
//! applied to the cache if no related local mutation happened meanwhile.

use crate::error::{FsError, RemoteError};
use crate::metadata::{ChildEntry, Lookup, MetadataCache};
use crate::path;
use crate::remote::{Listing, RemoteEntry, RemoteStorage};
use crate::retry::{OpKind, RetryPolicy};
use crate::tree::NodeAttrs;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Listing attempts before giving up on caching a listing that keeps
/// racing with local mutations.
const LISTING_ATTEMPTS: usize = 3;

pub struct Resolver {
    remote: Arc<dyn RemoteStorage>,
    meta: Arc<MetadataCache>,
    retry: RetryPolicy,
    mounted: Arc<AtomicBool>,
}

impl Resolver {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        meta: Arc<MetadataCache>,
        retry: RetryPolicy,
        mounted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            remote,
            meta,
            retry,
            mounted,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Run a remote call under the retry policy.
    pub fn call<T>(
        &self,
        kind: OpKind,
        path: &str,
        mut op: impl FnMut(&dyn RemoteStorage) -> Result<T, RemoteError>,
    ) -> Result<T, FsError> {
        if !self.is_mounted() {
            return Err(FsError::Unmounted);
        }
        let remote = self.remote.as_ref();
        self.retry
            .run(kind, path, || self.is_mounted(), || op(remote))
    }

    /// Attributes of `path`, walking one segment at a time.
    pub fn resolve(&self, target: &str) -> Result<NodeAttrs, FsError> {
        if target == "/" {
            return self
                .meta
                .peek("/")
                .ok_or_else(|| FsError::Internal("root node missing".to_string()));
        }

        let mut attrs = NodeAttrs::directory();
        for prefix in path::prefixes(target) {
            attrs = match self.meta.lookup(prefix) {
                Lookup::Hit(a) => a,
                Lookup::Absent => {
                    trace!("negative cache hit for {}", prefix);
                    return Err(FsError::NotFound(target.to_string()));
                }
                Lookup::Miss => self.fetch(prefix, target)?,
            };
            if prefix != target && !attrs.is_dir() {
                return Err(FsError::NotFound(target.to_string()));
            }
        }
        Ok(attrs)
    }

    /// Attributes straight from the remote, refreshing the cache.
    pub fn refresh(&self, target: &str) -> Result<NodeAttrs, FsError> {
        self.meta.invalidate(target);
        self.resolve(target)
    }

    fn fetch(&self, prefix: &str, target: &str) -> Result<NodeAttrs, FsError> {
        let generation = self.meta.generation();
        match self.call(OpKind::Metadata, prefix, |r| r.metadata(prefix)) {
            Ok(entry) => {
                self.meta.apply_remote(prefix, &entry, generation);
                Ok(NodeAttrs::from(&entry))
            }
            Err(e) if e.is_not_found() => {
                debug!("{} is gone remotely, dropping it from the cache", prefix);
                self.meta.forget(prefix);
                Err(FsError::NotFound(target.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Children of a directory in remote order, from cache when fresh.
    pub fn children(&self, dir: &str) -> Result<Vec<ChildEntry>, FsError> {
        let attrs = self.resolve(dir)?;
        if !attrs.is_dir() {
            return Err(FsError::NotADirectory(dir.to_string()));
        }
        if let Some(children) = self.meta.fresh_children(dir) {
            return Ok(children);
        }

        let mut hash = self.meta.listing_hash(dir);
        let mut last = Vec::new();
        for _ in 0..LISTING_ATTEMPTS {
            let generation = self.meta.generation();
            let listing = self
                .call(OpKind::List, dir, |r| r.list_if_changed(dir, hash.as_deref()))
                .map_err(|e| self.missing_dir(dir, e))?;
            match listing {
                Listing::NotModified => {
                    if let Some(children) = self.meta.touch_listing(dir, generation) {
                        trace!("listing of {} not modified", dir);
                        return Ok(children);
                    }
                    // Nothing cached to renew; ask for the full listing.
                    hash = None;
                }
                Listing::Entries { entries, hash: new_hash } => {
                    if let Some(children) =
                        self.meta.apply_listing(dir, &entries, new_hash, generation)
                    {
                        return Ok(children);
                    }
                    last = entries;
                    hash = None;
                }
            }
        }
        debug!("listing of {} kept racing with local changes, serving it uncached", dir);
        Ok(last
            .iter()
            .map(|e| ChildEntry {
                name: path::file_name(&e.path).to_string(),
                attrs: NodeAttrs::from(e),
            })
            .collect())
    }

    /// Unconditional remote listing (used to re-verify before destructive ops).
    pub fn list_remote(&self, dir: &str) -> Result<Vec<RemoteEntry>, FsError> {
        let generation = self.meta.generation();
        let entries = self
            .call(OpKind::List, dir, |r| r.list(dir))
            .map_err(|e| self.missing_dir(dir, e))?;
        self.meta.apply_listing(dir, &entries, None, generation);
        Ok(entries)
    }

    fn missing_dir(&self, dir: &str, err: FsError) -> FsError {
        if err.is_not_found() {
            self.meta.forget(dir);
        }
        err
    }
}

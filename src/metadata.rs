//! Metadata cache: the directory tree plus freshness bookkeeping.
//!
//! Readers get cached attributes while they are younger than the TTL.
//! Results fetched from the remote are applied only if no local mutation
//! touched a related path since the fetch began, so a slow listing can
//! never resurrect a file we just deleted. Mutations elsewhere in the tree
//! do not disturb the fetch.

use crate::error::FsError;
use crate::path;
use crate::remote::RemoteEntry;
use crate::tree::{DirectoryTree, NodeAttrs, NodeState};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Answer of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Fresh attributes.
    Hit(NodeAttrs),
    /// A fresh listing of the parent says the name does not exist.
    Absent,
    /// Unknown or stale; ask the remote.
    Miss,
}

/// Child entry of a cached listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub attrs: NodeAttrs,
}

/// Mutations kept for staleness checks; older fetches count as stale.
const CHANGE_LOG_LEN: usize = 1024;

/// Paths touched by recent local mutations, oldest first.
#[derive(Default)]
struct ChangeLog {
    entries: VecDeque<(u64, String)>,
    /// Generation of the newest entry dropped from the log.
    horizon: u64,
}

pub struct MetadataCache {
    tree: RwLock<DirectoryTree>,
    attr_ttl: Duration,
    dir_ttl: Duration,
    generation: AtomicU64,
    changes: Mutex<ChangeLog>,
    /// Set at shutdown; every later update is dropped.
    sealed: AtomicBool,
}

fn within(at: Option<Instant>, ttl: Duration) -> bool {
    at.is_some_and(|t| t.elapsed() < ttl)
}

impl MetadataCache {
    pub fn new(attr_ttl: Duration, dir_ttl: Duration) -> Self {
        Self {
            tree: RwLock::new(DirectoryTree::new()),
            attr_ttl,
            dir_ttl,
            generation: AtomicU64::new(0),
            changes: Mutex::new(ChangeLog::default()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Stop applying anything. Late remote results are discarded.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        self.bump(&["/"]);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Snapshot to pass back to the `apply_*` calls after a remote fetch.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record a local mutation of `paths`. Called with the tree lock held.
    fn bump(&self, paths: &[&str]) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut log = self.changes.lock();
        for p in paths {
            log.entries.push_back((generation, p.to_string()));
        }
        while log.entries.len() > CHANGE_LOG_LEN {
            if let Some((dropped, _)) = log.entries.pop_front() {
                log.horizon = dropped;
            }
        }
    }

    /// Whether a mutation accepted by `affects` happened after `generation`.
    fn changed_since(&self, generation: u64, affects: impl Fn(&str) -> bool) -> bool {
        if self.is_sealed() {
            return true;
        }
        let log = self.changes.lock();
        if generation < log.horizon {
            return true;
        }
        log.entries
            .iter()
            .rev()
            .take_while(|(g, _)| *g > generation)
            .any(|(_, p)| affects(p))
    }

    /// Attributes of `path` fetched at `generation` are outdated by any
    /// later change on, above or below it.
    fn attrs_outdated(&self, path: &str, generation: u64) -> bool {
        self.changed_since(generation, |m| {
            path::is_within(path, m) || path::is_within(m, path)
        })
    }

    /// A listing of `dir` is outdated by changes on or above `dir`, or to
    /// one of its direct children.
    fn listing_outdated(&self, dir: &str, generation: u64) -> bool {
        self.changed_since(generation, |m| {
            path::is_within(dir, m) || path::parent(m) == Some(dir)
        })
    }

    pub fn lookup(&self, path: &str) -> Lookup {
        let tree = self.tree.read();
        if let Some(node) = tree.get(path) {
            if node.is_pending() || within(node.verified_at, self.attr_ttl) {
                return Lookup::Hit(node.attrs.clone());
            }
            return Lookup::Miss;
        }
        let parent_listed = path::parent(path)
            .and_then(|p| tree.get(p))
            .and_then(|p| p.listing.as_ref())
            .is_some_and(|l| within(l.listed_at, self.dir_ttl));
        if parent_listed {
            Lookup::Absent
        } else {
            Lookup::Miss
        }
    }

    /// Cached attributes regardless of freshness.
    pub fn peek(&self, path: &str) -> Option<NodeAttrs> {
        self.tree.read().get(path).map(|n| n.attrs.clone())
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.tree.read().get(path).is_some_and(|n| n.is_pending())
    }

    /// Cached children if the listing is younger than the directory TTL.
    pub fn fresh_children(&self, dir: &str) -> Option<Vec<ChildEntry>> {
        let tree = self.tree.read();
        let listing = tree.get(dir)?.listing.as_ref()?;
        if !within(listing.listed_at, self.dir_ttl) {
            return None;
        }
        Some(Self::collect_children(&tree, dir))
    }

    fn collect_children(tree: &DirectoryTree, dir: &str) -> Vec<ChildEntry> {
        tree.children(dir)
            .unwrap_or_default()
            .into_iter()
            .map(|n| ChildEntry {
                name: path::file_name(&n.path).to_string(),
                attrs: n.attrs.clone(),
            })
            .collect()
    }

    /// Hash of the last listing, for a conditional re-list.
    pub fn listing_hash(&self, dir: &str) -> Option<String> {
        self.tree
            .read()
            .get(dir)
            .and_then(|n| n.listing.as_ref())
            .and_then(|l| l.hash.clone())
    }

    /// Apply fetched metadata unless a related local mutation happened since
    /// `generation`.
    /// Returns whether it was applied.
    pub fn apply_remote(&self, path: &str, entry: &RemoteEntry, generation: u64) -> bool {
        let mut tree = self.tree.write();
        if self.attrs_outdated(path, generation) {
            trace!("discarding stale metadata for {}", path);
            return false;
        }
        if tree.get(path).is_some_and(|n| n.is_pending()) {
            return false;
        }
        if !Self::parent_cached(&tree, path) {
            return false;
        }
        tree.insert(path, NodeAttrs::from(entry)).is_ok()
    }

    /// Apply a fetched listing; same staleness rule as [`apply_remote`](Self::apply_remote).
    pub fn apply_listing(
        &self,
        dir: &str,
        entries: &[RemoteEntry],
        hash: Option<String>,
        generation: u64,
    ) -> Option<Vec<ChildEntry>> {
        let mut tree = self.tree.write();
        if self.listing_outdated(dir, generation) {
            trace!("discarding stale listing for {}", dir);
            return None;
        }
        tree.set_listing(dir, entries, hash).ok()?;
        Some(Self::collect_children(&tree, dir))
    }

    /// The remote confirmed the listing is unchanged; refresh its timestamps.
    pub fn touch_listing(&self, dir: &str, generation: u64) -> Option<Vec<ChildEntry>> {
        let mut tree = self.tree.write();
        if self.listing_outdated(dir, generation) {
            return None;
        }
        let now = Instant::now();
        let names = {
            let listing = tree.get_mut(dir)?.listing.as_mut()?;
            listing.listed_at = Some(now);
            listing.names.clone()
        };
        for name in names {
            if let Some(child) = tree.get_mut(&path::join(dir, &name)) {
                child.verified_at = Some(now);
            }
        }
        Some(Self::collect_children(&tree, dir))
    }

    /// Record remote-confirmed attributes after a local mutation succeeded.
    pub fn put(&self, path: &str, attrs: NodeAttrs) -> Result<(), FsError> {
        if self.is_sealed() {
            return Ok(());
        }
        let mut tree = self.tree.write();
        self.bump(&[path]);
        if !Self::parent_cached(&tree, path) {
            trace!("not caching {}: parent unknown", path);
            return Ok(());
        }
        tree.insert(path, attrs)
    }

    fn parent_cached(tree: &DirectoryTree, path: &str) -> bool {
        match path::parent(path) {
            Some(parent) => tree.get(parent).is_some_and(|p| p.attrs.is_dir()),
            None => true,
        }
    }

    /// Record a local mutation the remote has not confirmed yet.
    pub fn put_pending(&self, path: &str, attrs: NodeAttrs) -> Result<(), FsError> {
        if self.is_sealed() {
            return Ok(());
        }
        let mut tree = self.tree.write();
        self.bump(&[path]);
        if !Self::parent_cached(&tree, path) {
            trace!("not caching {}: parent unknown", path);
            return Ok(());
        }
        let previous = match tree.get(path) {
            Some(node) => match &node.state {
                NodeState::Pending { previous } => previous.clone(),
                NodeState::Confirmed => Some(node.attrs.clone()),
            },
            None => None,
        };
        tree.insert(path, attrs)?;
        if let Some(node) = tree.get_mut(path) {
            node.state = NodeState::Pending { previous };
        }
        Ok(())
    }

    /// Undo a pending mutation: restore the previous attributes (stale, so
    /// they get re-verified) or drop a node that never existed remotely.
    pub fn rollback(&self, path: &str) {
        if self.is_sealed() {
            return;
        }
        let mut tree = self.tree.write();
        self.bump(&[path]);
        let previous = match tree.get(path).map(|n| n.state.clone()) {
            Some(NodeState::Pending { previous }) => previous,
            _ => return,
        };
        debug!("rolling back pending metadata for {}", path);
        match previous {
            Some(attrs) => {
                if let Some(node) = tree.get_mut(path) {
                    node.attrs = attrs;
                    node.state = NodeState::Confirmed;
                    node.verified_at = None;
                }
            }
            None => {
                let _ = tree.remove(path, true);
            }
        }
    }

    /// Remove a path (and everything below it) from the cache.
    pub fn remove(&self, path: &str) {
        if self.is_sealed() {
            return;
        }
        let mut tree = self.tree.write();
        self.bump(&[path]);
        let _ = tree.remove(path, true);
    }

    /// The remote says `path` does not exist: forget it, unless it is a
    /// local creation in flight.
    pub fn forget(&self, path: &str) {
        let mut tree = self.tree.write();
        if self.is_sealed() || path == "/" || tree.get(path).is_some_and(|n| n.is_pending()) {
            return;
        }
        self.bump(&[path]);
        let _ = tree.remove(path, true);
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        if self.is_sealed() {
            return Ok(());
        }
        let mut tree = self.tree.write();
        self.bump(&[from, to]);
        tree.rename_subtree(from, to)
    }

    /// Mark `path` and its parent listing stale.
    pub fn invalidate(&self, path: &str) {
        let mut tree = self.tree.write();
        self.bump(&[path]);
        if let Some(node) = tree.get_mut(path) {
            node.verified_at = None;
            if let Some(listing) = node.listing.as_mut() {
                listing.listed_at = None;
            }
        }
        if let Some(parent) = path::parent(path) {
            if let Some(listing) = tree.get_mut(parent).and_then(|n| n.listing.as_mut()) {
                listing.listed_at = None;
            }
        }
    }

    /// Mark `path` and everything cached below it stale.
    pub fn invalidate_subtree(&self, path: &str) {
        let mut tree = self.tree.write();
        self.bump(&[path]);
        let mut keys = tree.descendants(path);
        keys.push(path.to_string());
        if let Some(parent) = path::parent(path) {
            keys.push(parent.to_string());
        }
        for key in keys {
            if let Some(node) = tree.get_mut(&key) {
                node.verified_at = None;
                if let Some(listing) = node.listing.as_mut() {
                    listing.listed_at = None;
                    listing.hash = None;
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.tree.read().len()
    }

    pub fn check_invariants(&self) -> Result<(), FsError> {
        self.tree.read().check_invariants()
    }
}

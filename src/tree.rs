//! Directory tree: the logical hierarchy of known nodes.
//!
//! The tree owns every [`Node`] and keeps parent/child links independent of
//! the order the remote lists things in. It is not synchronized itself; the
//! metadata cache wraps it in a lock.

use crate::error::FsError;
use crate::path;
use crate::remote::{EntryKind, RemoteEntry, Revision};
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Fixed-shape attribute record of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub kind: EntryKind,
    pub size: u64,
    /// `None` until the remote has assigned one.
    pub revision: Option<Revision>,
    pub mtime: SystemTime,
}

impl NodeAttrs {
    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            revision: None,
            mtime: UNIX_EPOCH,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

impl From<&RemoteEntry> for NodeAttrs {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            kind: entry.kind,
            size: if entry.is_dir() { 0 } else { entry.size },
            revision: Some(entry.revision.clone()),
            mtime: entry.modified.unwrap_or(UNIX_EPOCH),
        }
    }
}

/// Whether the node reflects remote truth or a local mutation in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Confirmed,
    /// Locally mutated; holds the attributes to roll back to.
    Pending { previous: Option<NodeAttrs> },
}

/// Cached listing of a directory.
#[derive(Debug, Clone)]
pub struct Listing {
    /// Child names in the order the remote returned them.
    pub names: Vec<String>,
    pub hash: Option<String>,
    pub listed_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: String,
    pub attrs: NodeAttrs,
    /// `None` once invalidated.
    pub verified_at: Option<Instant>,
    pub state: NodeState,
    pub listing: Option<Listing>,
}

impl Node {
    fn new(path: &str, attrs: NodeAttrs) -> Self {
        Self {
            path: path.to_string(),
            attrs,
            verified_at: Some(Instant::now()),
            state: NodeState::Confirmed,
            listing: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, NodeState::Pending { .. })
    }
}

/// Hierarchy of nodes keyed by normalized path.
///
/// A `BTreeMap` keeps every subtree in one contiguous key range, which makes
/// subtree removal and relinking a range walk.
#[derive(Debug)]
pub struct DirectoryTree {
    nodes: BTreeMap<String, Node>,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new("/", NodeAttrs::directory()));
        Self { nodes }
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Strict descendants of `root`, in key order.
    pub fn descendants(&self, root: &str) -> Vec<String> {
        let prefix = path::descendant_prefix(root);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != root)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Insert or update a node. The parent must already be a known directory.
    ///
    /// Replacing a directory by a file drops the old subtree.
    pub fn insert(&mut self, path: &str, attrs: NodeAttrs) -> Result<(), FsError> {
        if path == "/" {
            if !attrs.is_dir() {
                return Err(FsError::Internal("root must stay a directory".to_string()));
            }
            if let Some(root) = self.nodes.get_mut("/") {
                root.attrs = attrs;
                root.verified_at = Some(Instant::now());
            }
            return Ok(());
        }

        let parent = path::parent(path).unwrap_or("/");
        match self.nodes.get(parent) {
            Some(p) if p.attrs.is_dir() => {}
            Some(_) => {
                return Err(FsError::Internal(format!(
                    "parent of {} is not a directory",
                    path
                )))
            }
            None => return Err(FsError::Internal(format!("orphan node {}", path))),
        }

        let kind_changed = self
            .nodes
            .get(path)
            .is_some_and(|n| n.attrs.kind != attrs.kind);
        if kind_changed {
            self.remove_descendants(path);
        }

        match self.nodes.get_mut(path) {
            Some(node) => {
                node.attrs = attrs;
                node.verified_at = Some(Instant::now());
                node.state = NodeState::Confirmed;
                if kind_changed {
                    node.listing = None;
                }
            }
            None => {
                self.nodes.insert(path.to_string(), Node::new(path, attrs));
            }
        }

        self.link_child(parent, path::file_name(path));
        Ok(())
    }

    fn link_child(&mut self, parent: &str, name: &str) {
        if let Some(listing) = self.nodes.get_mut(parent).and_then(|p| p.listing.as_mut()) {
            if !listing.names.iter().any(|n| n == name) {
                listing.names.push(name.to_string());
            }
        }
    }

    fn unlink_child(&mut self, parent: &str, name: &str) {
        if let Some(listing) = self.nodes.get_mut(parent).and_then(|p| p.listing.as_mut()) {
            listing.names.retain(|n| n != name);
        }
    }

    fn remove_descendants(&mut self, root: &str) -> Vec<String> {
        let keys = self.descendants(root);
        for key in &keys {
            self.nodes.remove(key);
        }
        keys
    }

    /// True if the directory has children in the cached view.
    pub fn has_children(&self, path: &str) -> bool {
        let listed = self
            .nodes
            .get(path)
            .and_then(|n| n.listing.as_ref())
            .is_some_and(|l| !l.names.is_empty());
        listed || !self.descendants(path).is_empty()
    }

    /// Remove a node. Directories with known children need `recursive`.
    /// Returns every removed path.
    pub fn remove(&mut self, path: &str, recursive: bool) -> Result<Vec<String>, FsError> {
        if path == "/" {
            return Err(FsError::InvalidArgument("cannot remove the root".to_string()));
        }
        if !self.nodes.contains_key(path) {
            return Ok(Vec::new());
        }
        if !recursive && self.has_children(path) {
            return Err(FsError::NotEmpty(path.to_string()));
        }
        let mut removed = self.remove_descendants(path);
        self.nodes.remove(path);
        removed.push(path.to_string());
        if let Some(parent) = path::parent(path) {
            self.unlink_child(parent, path::file_name(path));
        }
        Ok(removed)
    }

    /// Cached children of a directory, in listing order. `None` if never listed.
    pub fn children(&self, path: &str) -> Option<Vec<&Node>> {
        let listing = self.nodes.get(path)?.listing.as_ref()?;
        Some(
            listing
                .names
                .iter()
                .filter_map(|name| self.nodes.get(&path::join(path, name)))
                .collect(),
        )
    }

    /// Reconcile a fresh remote listing of `dir` into the tree.
    ///
    /// Children the remote no longer reports are removed with their subtrees,
    /// unless they are pending local creations.
    pub fn set_listing(
        &mut self,
        dir: &str,
        entries: &[RemoteEntry],
        hash: Option<String>,
    ) -> Result<(), FsError> {
        match self.nodes.get(dir) {
            Some(n) if n.attrs.is_dir() => {}
            Some(_) => return Err(FsError::NotADirectory(dir.to_string())),
            None => return Err(FsError::Internal(format!("listing for unknown node {}", dir))),
        }

        let mut names: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = path::file_name(&entry.path).to_string();
            if name.is_empty() || names.contains(&name) {
                continue;
            }
            let child = path::join(dir, &name);
            let keep_local = self.nodes.get(&child).is_some_and(|n| n.is_pending());
            if !keep_local {
                let attrs = NodeAttrs::from(entry);
                let kind_changed = self
                    .nodes
                    .get(&child)
                    .is_some_and(|n| n.attrs.kind != attrs.kind);
                if kind_changed {
                    self.remove_descendants(&child);
                }
                let node = self
                    .nodes
                    .entry(child.clone())
                    .or_insert_with(|| Node::new(&child, attrs.clone()));
                node.attrs = attrs;
                node.verified_at = Some(Instant::now());
                if kind_changed {
                    node.listing = None;
                }
            }
            names.push(name);
        }

        // Direct children we know of that the remote did not report.
        let prefix = path::descendant_prefix(dir);
        let known: Vec<(String, bool)> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != dir && !k[prefix.len()..].contains('/'))
            .map(|(k, n)| (k.clone(), n.is_pending()))
            .collect();
        for (child, pending) in known {
            let name = path::file_name(&child).to_string();
            if names.contains(&name) {
                continue;
            }
            if pending {
                names.push(name);
            } else {
                self.remove_descendants(&child);
                self.nodes.remove(&child);
            }
        }

        if let Some(node) = self.nodes.get_mut(dir) {
            node.listing = Some(Listing {
                names,
                hash,
                listed_at: Some(Instant::now()),
            });
        }
        Ok(())
    }

    /// Relink the whole subtree at `from` under `to` in one step.
    ///
    /// Any node already at `to` (and below) is replaced.
    pub fn rename_subtree(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        if from == "/" || to == "/" {
            return Err(FsError::InvalidArgument("cannot rename the root".to_string()));
        }
        if path::is_within(to, from) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} into itself ({})",
                from, to
            )));
        }
        let to_parent = path::parent(to).unwrap_or("/");
        match self.nodes.get(to_parent) {
            Some(p) if p.attrs.is_dir() => {}
            _ => return Err(FsError::Internal(format!("orphan rename target {}", to))),
        }
        if !self.nodes.contains_key(from) {
            return Err(FsError::Internal(format!("rename of unknown node {}", from)));
        }

        if self.nodes.contains_key(to) {
            self.remove(to, true)?;
        }

        let mut keys = self.descendants(from);
        keys.push(from.to_string());
        let moved: Vec<Node> = keys.iter().filter_map(|k| self.nodes.remove(k)).collect();
        for mut node in moved {
            node.path = path::rebase(&node.path, from, to);
            self.nodes.insert(node.path.clone(), node);
        }

        if let Some(parent) = path::parent(from) {
            self.unlink_child(parent, path::file_name(from));
        }
        self.link_child(to_parent, path::file_name(to));
        Ok(())
    }

    /// Verify every non-root node has a directory parent.
    pub fn check_invariants(&self) -> Result<(), FsError> {
        for key in self.nodes.keys() {
            if key == "/" {
                continue;
            }
            let parent = path::parent(key).unwrap_or("/");
            match self.nodes.get(parent) {
                Some(p) if p.attrs.is_dir() => {}
                _ => return Err(FsError::Internal(format!("node {} has no directory parent", key))),
            }
        }
        Ok(())
    }
}

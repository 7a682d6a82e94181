//! In-process remote storage.
//!
//! Backs scratch mounts (`cloudfs-fuse mount --memory`), tests and benches.
//! Mimics the remote API's revision semantics and lets callers inject
//! failures and perform out-of-band changes as if another client made them.

use crate::error::RemoteError;
use crate::path;
use crate::remote::{
    Downloaded, EntryKind, Listing, RemoteEntry, RemoteStorage, Revision, SpaceUsage, WriteMode,
};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::time::{Duration, SystemTime};

/// Failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    RateLimited,
    Network,
    AuthExpired,
    Conflict,
    /// Apply the call, then lose the response with a network error.
    LostResponse,
}

impl Fault {
    fn to_error(self, op: &str) -> RemoteError {
        match self {
            Self::RateLimited => RemoteError::RateLimited {
                retry_after: Some(Duration::ZERO),
            },
            Self::Network | Self::LostResponse => {
                RemoteError::Network(format!("injected failure in {}", op))
            }
            Self::AuthExpired => RemoteError::AuthExpired,
            Self::Conflict => RemoteError::Conflict(format!("injected conflict in {}", op)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    kind: EntryKind,
    data: Vec<u8>,
    revision: Revision,
    modified: SystemTime,
}

#[derive(Debug)]
struct State {
    entries: BTreeMap<String, StoredEntry>,
    next_revision: u64,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    calls: HashMap<&'static str, u64>,
    quota: u64,
}

impl State {
    fn bump(&mut self) -> Revision {
        self.next_revision += 1;
        Revision::new(format!("r{:08x}", self.next_revision))
    }

    fn entry(&self, p: &str) -> Option<RemoteEntry> {
        self.entries.get(p).map(|e| RemoteEntry {
            path: p.to_string(),
            kind: e.kind,
            size: e.data.len() as u64,
            revision: e.revision.clone(),
            modified: Some(e.modified),
        })
    }

    fn require_parent_dir(&self, p: &str) -> Result<(), RemoteError> {
        let parent = path::parent(p).unwrap_or("/");
        match self.entries.get(parent) {
            Some(e) if e.kind == EntryKind::Directory => Ok(()),
            Some(_) => Err(RemoteError::Conflict(format!("parent of {} is a file", p))),
            None => Err(RemoteError::NotFound(parent.to_string())),
        }
    }

    fn children(&self, dir: &str) -> Vec<RemoteEntry> {
        let prefix = path::descendant_prefix(dir);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != dir && !k[prefix.len()..].contains('/'))
            .filter_map(|(k, _)| self.entry(k))
            .collect()
    }

    fn subtree_keys(&self, root: &str) -> Vec<String> {
        let prefix = path::descendant_prefix(root);
        let mut keys: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .filter(|k| k != "/")
            .collect();
        if root != "/" {
            keys.push(root.to_string());
        }
        keys
    }

    /// Every mutation also bumps the root, which acts as the account cursor.
    fn touch_root(&mut self) {
        let rev = self.bump();
        if let Some(root) = self.entries.get_mut("/") {
            root.revision = rev;
            root.modified = SystemTime::now();
        }
    }
}

/// Remote storage held entirely in memory.
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            StoredEntry {
                kind: EntryKind::Directory,
                data: Vec::new(),
                revision: Revision::new("r00000000"),
                modified: SystemTime::now(),
            },
        );
        Self {
            state: Mutex::new(State {
                entries,
                next_revision: 0,
                faults: HashMap::new(),
                calls: HashMap::new(),
                quota: 1 << 40,
            }),
        }
    }

    /// Queue `fault` for the next `times` calls of operation `op`
    /// (`"list"`, `"metadata"`, `"download"`, `"upload"`, `"delete"`,
    /// `"move"`, `"create_folder"`).
    pub fn inject(&self, op: &'static str, fault: Fault, times: usize) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat(fault).take(times));
    }

    /// Number of calls made to `op` so far.
    pub fn calls(&self, op: &'static str) -> u64 {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Out-of-band write by another client; creates missing parents.
    pub fn put_file(&self, p: &str, data: &[u8]) -> Revision {
        let p = path::normalize(p);
        let mut state = self.state.lock();
        for dir in path::ancestors(&p).into_iter().rev() {
            if !state.entries.contains_key(dir) {
                let rev = state.bump();
                state.entries.insert(
                    dir.to_string(),
                    StoredEntry {
                        kind: EntryKind::Directory,
                        data: Vec::new(),
                        revision: rev,
                        modified: SystemTime::now(),
                    },
                );
            }
        }
        let rev = state.bump();
        state.entries.insert(
            p,
            StoredEntry {
                kind: EntryKind::File,
                data: data.to_vec(),
                revision: rev.clone(),
                modified: SystemTime::now(),
            },
        );
        state.touch_root();
        rev
    }

    /// Out-of-band directory creation; creates missing parents.
    pub fn put_dir(&self, p: &str) {
        let p = path::normalize(p);
        let mut state = self.state.lock();
        let mut dirs: Vec<&str> = path::ancestors(&p);
        dirs.reverse();
        dirs.push(&p);
        for dir in dirs {
            if !state.entries.contains_key(dir) {
                let rev = state.bump();
                state.entries.insert(
                    dir.to_string(),
                    StoredEntry {
                        kind: EntryKind::Directory,
                        data: Vec::new(),
                        revision: rev,
                        modified: SystemTime::now(),
                    },
                );
            }
        }
        state.touch_root();
    }

    /// Out-of-band removal of a path and everything below it.
    pub fn remove_tree(&self, p: &str) {
        let p = path::normalize(p);
        let mut state = self.state.lock();
        for key in state.subtree_keys(&p) {
            state.entries.remove(&key);
        }
        state.touch_root();
    }

    /// Current content of a file, bypassing call counting.
    pub fn contents(&self, p: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .entries
            .get(&path::normalize(p))
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.data.clone())
    }

    pub fn exists(&self, p: &str) -> bool {
        self.state.lock().entries.contains_key(&path::normalize(p))
    }

    /// Number of files stored under `root` (inclusive).
    pub fn file_count(&self, root: &str) -> usize {
        let state = self.state.lock();
        state
            .subtree_keys(&path::normalize(root))
            .iter()
            .filter(|k| state.entries.get(*k).is_some_and(|e| e.kind == EntryKind::File))
            .count()
    }

    pub fn set_quota(&self, bytes: u64) {
        self.state.lock().quota = bytes;
    }

    /// Record the call and pop an injected fault, if any.
    fn begin(&self, op: &'static str) -> Option<Fault> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        state.faults.get_mut(op).and_then(|q| q.pop_front())
    }

    fn listing_hash(children: &[RemoteEntry]) -> String {
        let mut hasher = DefaultHasher::new();
        for child in children {
            child.path.hash(&mut hasher);
            child.revision.hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }
}

/// Fail before applying unless the fault is `LostResponse`.
macro_rules! precheck {
    ($fault:expr, $op:expr) => {
        if let Some(f) = $fault {
            if f != Fault::LostResponse {
                return Err(f.to_error($op));
            }
        }
    };
}

/// Fail after applying if the fault is `LostResponse`.
macro_rules! postcheck {
    ($fault:expr, $op:expr) => {
        if $fault == Some(Fault::LostResponse) {
            return Err(Fault::LostResponse.to_error($op));
        }
    };
}

impl RemoteStorage for MemoryStorage {
    fn list(&self, p: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let fault = self.begin("list");
        precheck!(fault, "list");
        let state = self.state.lock();
        match state.entries.get(p) {
            Some(e) if e.kind == EntryKind::Directory => {}
            Some(_) => return Err(RemoteError::Conflict(format!("{} is not a folder", p))),
            None => return Err(RemoteError::NotFound(p.to_string())),
        }
        let children = state.children(p);
        postcheck!(fault, "list");
        Ok(children)
    }

    fn list_if_changed(&self, p: &str, hash: Option<&str>) -> Result<Listing, RemoteError> {
        let entries = self.list(p)?;
        let current = Self::listing_hash(&entries);
        if hash == Some(current.as_str()) {
            return Ok(Listing::NotModified);
        }
        Ok(Listing::Entries {
            entries,
            hash: Some(current),
        })
    }

    fn metadata(&self, p: &str) -> Result<RemoteEntry, RemoteError> {
        let fault = self.begin("metadata");
        precheck!(fault, "metadata");
        let state = self.state.lock();
        let entry = state
            .entry(p)
            .ok_or_else(|| RemoteError::NotFound(p.to_string()))?;
        postcheck!(fault, "metadata");
        Ok(entry)
    }

    fn download(&self, p: &str, range: Range<u64>) -> Result<Downloaded, RemoteError> {
        let fault = self.begin("download");
        precheck!(fault, "download");
        let state = self.state.lock();
        let entry = match state.entries.get(p) {
            Some(e) if e.kind == EntryKind::File => e,
            Some(_) => return Err(RemoteError::Conflict(format!("{} is a folder", p))),
            None => return Err(RemoteError::NotFound(p.to_string())),
        };
        let len = entry.data.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len) as usize;
        let data = entry.data[start..end.max(start)].to_vec();
        let revision = entry.revision.clone();
        postcheck!(fault, "download");
        Ok(Downloaded { data, revision })
    }

    fn upload(&self, p: &str, data: &[u8], mode: WriteMode) -> Result<RemoteEntry, RemoteError> {
        let fault = self.begin("upload");
        precheck!(fault, "upload");
        let mut state = self.state.lock();
        state.require_parent_dir(p)?;
        match (state.entries.get(p), &mode) {
            (Some(e), _) if e.kind == EntryKind::Directory => {
                return Err(RemoteError::Conflict(format!("{} is a folder", p)));
            }
            (Some(_), WriteMode::Add) => return Err(RemoteError::AlreadyExists(p.to_string())),
            (Some(e), WriteMode::Update(rev)) if &e.revision != rev => {
                return Err(RemoteError::Conflict(format!(
                    "{} is at {}, not {}",
                    p, e.revision, rev
                )));
            }
            (None, WriteMode::Update(rev)) => {
                return Err(RemoteError::Conflict(format!("{} vanished since {}", p, rev)));
            }
            _ => {}
        }
        let revision = state.bump();
        state.entries.insert(
            p.to_string(),
            StoredEntry {
                kind: EntryKind::File,
                data: data.to_vec(),
                revision,
                modified: SystemTime::now(),
            },
        );
        state.touch_root();
        let entry = state
            .entry(p)
            .ok_or_else(|| RemoteError::InvalidResponse(format!("{} missing after upload", p)))?;
        postcheck!(fault, "upload");
        Ok(entry)
    }

    fn delete(&self, p: &str) -> Result<(), RemoteError> {
        let fault = self.begin("delete");
        precheck!(fault, "delete");
        let mut state = self.state.lock();
        if p == "/" {
            return Err(RemoteError::ServerError {
                status: 400,
                message: "cannot delete root".to_string(),
            });
        }
        if !state.entries.contains_key(p) {
            return Err(RemoteError::NotFound(p.to_string()));
        }
        for key in state.subtree_keys(p) {
            state.entries.remove(&key);
        }
        state.touch_root();
        postcheck!(fault, "delete");
        Ok(())
    }

    fn move_path(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError> {
        let fault = self.begin("move");
        precheck!(fault, "move");
        let mut state = self.state.lock();
        if !state.entries.contains_key(from) {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        if state.entries.contains_key(to) {
            return Err(RemoteError::AlreadyExists(to.to_string()));
        }
        state.require_parent_dir(to)?;
        let keys = state.subtree_keys(from);
        let moved: Vec<(String, StoredEntry)> = keys
            .iter()
            .filter_map(|k| state.entries.remove(k).map(|e| (path::rebase(k, from, to), e)))
            .collect();
        state.entries.extend(moved);
        state.touch_root();
        let entry = state
            .entry(to)
            .ok_or_else(|| RemoteError::InvalidResponse(format!("{} missing after move", to)))?;
        postcheck!(fault, "move");
        Ok(entry)
    }

    fn create_folder(&self, p: &str) -> Result<RemoteEntry, RemoteError> {
        let fault = self.begin("create_folder");
        precheck!(fault, "create_folder");
        let mut state = self.state.lock();
        state.require_parent_dir(p)?;
        if state.entries.contains_key(p) {
            return Err(RemoteError::AlreadyExists(p.to_string()));
        }
        let revision = state.bump();
        state.entries.insert(
            p.to_string(),
            StoredEntry {
                kind: EntryKind::Directory,
                data: Vec::new(),
                revision,
                modified: SystemTime::now(),
            },
        );
        state.touch_root();
        let entry = state
            .entry(p)
            .ok_or_else(|| RemoteError::InvalidResponse(format!("{} missing after mkdir", p)))?;
        postcheck!(fault, "create_folder");
        Ok(entry)
    }

    fn space_usage(&self) -> Result<Option<SpaceUsage>, RemoteError> {
        let state = self.state.lock();
        let used = state.entries.values().map(|e| e.data.len() as u64).sum();
        Ok(Some(SpaceUsage {
            used,
            allocated: state.quota,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_requires_matching_revision() {
        let store = MemoryStorage::new();
        let rev = store.put_file("/a.txt", b"one");
        let entry = store
            .upload("/a.txt", b"two", WriteMode::Update(rev.clone()))
            .unwrap();
        assert_ne!(entry.revision, rev);
        let err = store.upload("/a.txt", b"three", WriteMode::Update(rev)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.contents("/a.txt").unwrap(), b"two");
    }

    #[test]
    fn test_add_refuses_existing() {
        let store = MemoryStorage::new();
        store.put_file("/a.txt", b"x");
        let err = store.upload("/a.txt", b"y", WriteMode::Add).unwrap_err();
        assert!(matches!(err, RemoteError::AlreadyExists(_)));
    }

    #[test]
    fn test_listing_hash_detects_changes() {
        let store = MemoryStorage::new();
        store.put_file("/d/a", b"1");
        let hash = match store.list_if_changed("/d", None).unwrap() {
            Listing::Entries { entries, hash } => {
                assert_eq!(entries.len(), 1);
                hash.unwrap()
            }
            Listing::NotModified => panic!("expected entries"),
        };
        assert!(matches!(
            store.list_if_changed("/d", Some(&hash)).unwrap(),
            Listing::NotModified
        ));
        store.put_file("/d/b", b"2");
        assert!(matches!(
            store.list_if_changed("/d", Some(&hash)).unwrap(),
            Listing::Entries { .. }
        ));
    }

    #[test]
    fn test_lost_response_still_applies() {
        let store = MemoryStorage::new();
        store.inject("upload", Fault::LostResponse, 1);
        let err = store.upload("/x", b"data", WriteMode::Overwrite).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.contents("/x").unwrap(), b"data");
        assert_eq!(store.calls("upload"), 1);
    }

    #[test]
    fn test_move_relinks_subtree() {
        let store = MemoryStorage::new();
        store.put_file("/src/a/b.txt", b"b");
        store.move_path("/src", "/dst").unwrap();
        assert!(!store.exists("/src/a/b.txt"));
        assert_eq!(store.contents("/dst/a/b.txt").unwrap(), b"b");
    }
}

//! Remote storage boundary.
//!
//! The filesystem core only talks to the remote through [`RemoteStorage`].
//! Implementations: [`crate::client::CloudClient`] (HTTP) and
//! [`crate::memory::MemoryStorage`] (in-process).

use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::SystemTime;

/// Opaque remote-assigned version token of a file's content state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata of one remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub revision: Revision,
    pub modified: Option<SystemTime>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// How an upload treats an existing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Create only; fails with `AlreadyExists` if the path exists.
    Add,
    /// Replace whatever is there.
    Overwrite,
    /// Replace only if the current revision matches, else `Conflict`.
    Update(Revision),
}

/// Result of a conditional directory listing.
#[derive(Debug, Clone)]
pub enum Listing {
    Entries {
        entries: Vec<RemoteEntry>,
        hash: Option<String>,
    },
    /// The listing hash still matches; the cached listing is current.
    NotModified,
}

/// Bytes returned by a ranged download, with the revision they belong to.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub data: Vec<u8>,
    pub revision: Revision,
}

/// Account space usage for statfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocated: u64,
}

/// Authenticated remote storage session.
///
/// Every call blocks until the remote answers. Implementations must be
/// shareable across worker threads.
pub trait RemoteStorage: Send + Sync {
    /// Immediate children of a directory, in remote order.
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Listing that short-circuits when `hash` still describes the directory.
    fn list_if_changed(&self, path: &str, hash: Option<&str>) -> Result<Listing, RemoteError> {
        let _ = hash;
        Ok(Listing::Entries {
            entries: self.list(path)?,
            hash: None,
        })
    }

    fn metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError>;

    /// Bytes of `range` (clamped to the file size) of the current revision.
    fn download(&self, path: &str, range: Range<u64>) -> Result<Downloaded, RemoteError>;

    /// Replace the whole content of `path`; returns the entry with its new revision.
    fn upload(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<RemoteEntry, RemoteError>;

    /// Delete a file or a directory (with everything below it).
    fn delete(&self, path: &str) -> Result<(), RemoteError>;

    fn move_path(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError>;

    fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError>;

    fn space_usage(&self) -> Result<Option<SpaceUsage>, RemoteError> {
        Ok(None)
    }
}

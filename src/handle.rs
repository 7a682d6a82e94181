//! Handle table: open files, their mode and their state.

use crate::error::FsError;
use crate::path;
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub access: AccessMode,
    pub append: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        access: AccessMode::Read,
        append: false,
    };
    pub const READ_WRITE: OpenMode = OpenMode {
        access: AccessMode::ReadWrite,
        append: false,
    };

    /// Decode POSIX open flags.
    pub fn from_flags(flags: i32) -> Self {
        let access = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::Write,
            libc::O_RDWR => AccessMode::ReadWrite,
            _ => AccessMode::Read,
        };
        Self {
            access,
            append: flags & libc::O_APPEND != 0,
        }
    }

    pub fn can_read(&self) -> bool {
        matches!(self.access, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self.access, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Per-handle lifecycle.
///
/// ```text
/// Opening -> Clean -> Dirty -> Flushing -> Clean
///               \        \                   \
///                +--------+-----> Closed <----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Opening,
    Clean,
    Dirty,
    Flushing,
    Closed,
}

impl HandleState {
    pub fn can_transition(self, to: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, to),
            (Opening, Clean)
                | (Opening, Closed)
                | (Clean, Dirty)
                | (Clean, Flushing)
                | (Clean, Closed)
                | (Dirty, Dirty)
                | (Dirty, Flushing)
                | (Dirty, Closed)
                | (Flushing, Clean)
                | (Flushing, Dirty)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub id: HandleId,
    pub path: String,
    pub mode: OpenMode,
    pub state: HandleState,
}

pub struct HandleTable {
    handles: Mutex<HashMap<HandleId, Handle>>,
    next_id: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handle in `Opening`.
    pub fn allocate(&self, path: &str, mode: OpenMode) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(
            id,
            Handle {
                id,
                path: path.to_string(),
                mode,
                state: HandleState::Opening,
            },
        );
        id
    }

    pub fn get(&self, id: HandleId) -> Result<Handle, FsError> {
        self.handles
            .lock()
            .get(&id)
            .cloned()
            .ok_or(FsError::BadHandle(id))
    }

    pub fn transition(&self, id: HandleId, to: HandleState) -> Result<(), FsError> {
        let mut handles = self.handles.lock();
        let handle = handles.get_mut(&id).ok_or(FsError::BadHandle(id))?;
        if !handle.state.can_transition(to) {
            return Err(FsError::Internal(format!(
                "handle {} cannot go from {:?} to {:?}",
                id, handle.state, to
            )));
        }
        trace!("handle {} {:?} -> {:?}", id, handle.state, to);
        handle.state = to;
        if to == HandleState::Closed {
            handles.remove(&id);
        }
        Ok(())
    }

    pub fn has_writer(&self, path: &str) -> bool {
        self.handles
            .lock()
            .values()
            .any(|h| h.path == path && h.mode.can_write())
    }

    /// Move handles that point into `from` to the matching path under `to`.
    pub fn rename(&self, from: &str, to: &str) {
        for handle in self.handles.lock().values_mut() {
            if path::is_within(&handle.path, from) {
                handle.path = path::rebase(&handle.path, from, to);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_from_flags() {
        assert_eq!(OpenMode::from_flags(libc::O_RDONLY), OpenMode::READ);
        let m = OpenMode::from_flags(libc::O_WRONLY | libc::O_APPEND);
        assert_eq!(m.access, AccessMode::Write);
        assert!(m.append);
        assert!(!m.can_read());
        assert!(OpenMode::from_flags(libc::O_RDWR).can_write());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let table = HandleTable::new();
        let id = table.allocate("/f", OpenMode::READ_WRITE);
        table.transition(id, HandleState::Clean).unwrap();
        table.transition(id, HandleState::Dirty).unwrap();
        table.transition(id, HandleState::Flushing).unwrap();
        table.transition(id, HandleState::Clean).unwrap();
        table.transition(id, HandleState::Closed).unwrap();
        assert!(matches!(table.get(id), Err(FsError::BadHandle(_))));
    }

    #[test]
    fn test_invalid_transition_is_internal() {
        let table = HandleTable::new();
        let id = table.allocate("/f", OpenMode::READ);
        let err = table.transition(id, HandleState::Dirty).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(table.get(id).unwrap().state, HandleState::Opening);
    }

    #[test]
    fn test_rename_rekeys_handles() {
        let table = HandleTable::new();
        let a = table.allocate("/d/a", OpenMode::READ);
        let b = table.allocate("/dd", OpenMode::READ);
        table.rename("/d", "/e");
        assert_eq!(table.get(a).unwrap().path, "/e/a");
        assert_eq!(table.get(b).unwrap().path, "/dd");
    }
}

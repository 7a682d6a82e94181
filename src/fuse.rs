//! FUSE front-end: maps inodes to paths and dispatches every request onto
//! a blocking worker so operations on unrelated paths run in parallel.

use crate::error::FsError;
use crate::fs::{CloudFs, DirEntry};
use crate::path;
use crate::remote::EntryKind;
use crate::tree::NodeAttrs;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, ENOENT};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;

/// Default block size.
const BLOCK_SIZE: u32 = 512;

const MAX_NAME_LEN: u32 = 255;

/// `renameat2` flag.
const RENAME_NOREPLACE: u32 = 1;

#[derive(Default)]
struct InodeMaps {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

/// Stable inode numbers for paths seen by the kernel.
pub struct InodeTable {
    maps: Mutex<InodeMaps>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = InodeMaps {
            next: FUSE_ROOT_ID + 1,
            ..InodeMaps::default()
        };
        maps.by_ino.insert(FUSE_ROOT_ID, "/".to_string());
        maps.by_path.insert("/".to_string(), FUSE_ROOT_ID);
        Self {
            maps: Mutex::new(maps),
        }
    }

    pub fn path(&self, ino: u64) -> Option<String> {
        self.maps.lock().by_ino.get(&ino).cloned()
    }

    /// Get or create the inode for a path.
    pub fn ino(&self, path: &str) -> u64 {
        let mut maps = self.maps.lock();
        if let Some(&ino) = maps.by_path.get(path) {
            return ino;
        }
        let ino = maps.next;
        maps.next += 1;
        maps.by_path.insert(path.to_string(), ino);
        maps.by_ino.insert(ino, path.to_string());
        ino
    }

    /// Re-point every inode under `from` to the matching path under `to`.
    pub fn rename(&self, from: &str, to: &str) {
        if path::is_within(from, to) {
            return;
        }
        let mut maps = self.maps.lock();
        let InodeMaps { by_ino, by_path, .. } = &mut *maps;
        by_path.retain(|p, ino| {
            let replaced = path::is_within(p, to);
            if replaced {
                by_ino.remove(ino);
            }
            !replaced
        });
        let moved: Vec<(String, u64)> = by_path
            .iter()
            .filter(|(p, _)| path::is_within(p, from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let new = path::rebase(&old, from, to);
            by_path.remove(&old);
            by_path.insert(new.clone(), ino);
            by_ino.insert(ino, new);
        }
    }

    /// Drop inodes of `path` and everything below it.
    pub fn remove(&self, path: &str) {
        let mut maps = self.maps.lock();
        let InodeMaps { by_ino, by_path, .. } = &mut *maps;
        by_path.retain(|p, ino| {
            let gone = path::is_within(p, path);
            if gone {
                by_ino.remove(ino);
            }
            !gone
        });
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a FileAttr from cached attributes.
fn make_attr(ino: u64, attrs: &NodeAttrs) -> FileAttr {
    let kind = match attrs.kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
    };
    let nlink = if kind == FileType::Directory { 2 } else { 1 };
    // Access control is the remote's business; expose permissive modes.
    let perm = if kind == FileType::Directory { 0o755 } else { 0o644 };

    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(BLOCK_SIZE as u64),
        atime: attrs.mtime,
        mtime: attrs.mtime,
        ctime: attrs.mtime,
        crtime: attrs.mtime,
        kind,
        perm,
        nlink,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn file_type(attrs: &NodeAttrs) -> FileType {
    if attrs.is_dir() {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

fn errno(op: &str, path: &str, err: &FsError) -> c_int {
    if err.is_internal() {
        error!("{} {}: {}", op, path, err);
    } else {
        debug!("{} {}: {}", op, path, err);
    }
    err.to_errno()
}

/// `fuser::Filesystem` over a shared [`CloudFs`].
pub struct FuseAdapter {
    fs: Arc<CloudFs>,
    inodes: Arc<InodeTable>,
    runtime: Runtime,
    ttl: Duration,
}

impl FuseAdapter {
    pub fn new(fs: Arc<CloudFs>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("cloudfs-worker")
            .build()?;
        let ttl = fs.config().attr_ttl;
        Ok(Self {
            fs,
            inodes: Arc::new(InodeTable::new()),
            runtime,
            ttl,
        })
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.inodes.path(parent)?;
        Some(path::join(&parent, &name.to_string_lossy()))
    }

    /// Run `f` on the blocking pool with shared handles to the filesystem.
    fn dispatch<F>(&self, f: F)
    where
        F: FnOnce(&CloudFs, &InodeTable) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.runtime.spawn_blocking(move || f(&fs, &inodes));
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("Filesystem mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("Unmounting, flushing pending writes");
        self.fs.shutdown();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let ttl = self.ttl;
        self.dispatch(move |fs, inodes| match fs.getattr(&path) {
            Ok(attrs) => reply.entry(&ttl, &make_attr(inodes.ino(&path), &attrs), 0),
            Err(e) => reply.error(errno("lookup", &path, &e)),
        });
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let ttl = self.ttl;
        self.dispatch(move |fs, _| match fs.getattr(&path) {
            Ok(attrs) => reply.attr(&ttl, &make_attr(ino, &attrs)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let ttl = self.ttl;
        // Only size changes reach the remote; mode, owner and times are ignored.
        self.dispatch(move |fs, _| {
            let result = match size {
                Some(size) => fs.truncate(&path, size, fh),
                None => fs.getattr(&path),
            };
            match result {
                Ok(attrs) => reply.attr(&ttl, &make_attr(ino, &attrs)),
                Err(e) => reply.error(errno("setattr", &path, &e)),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let ttl = self.ttl;
        self.dispatch(move |fs, inodes| match fs.mkdir(&path) {
            Ok(attrs) => reply.entry(&ttl, &make_attr(inodes.ino(&path), &attrs), 0),
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        self.dispatch(move |fs, inodes| match fs.unlink(&path) {
            Ok(()) => {
                inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, &e)),
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        self.dispatch(move |fs, inodes| match fs.rmdir(&path) {
            Ok(()) => {
                inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, &e)),
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (self.child_path(parent, name), self.child_path(newparent, newname))
        else {
            reply.error(ENOENT);
            return;
        };
        if flags & !RENAME_NOREPLACE != 0 {
            // RENAME_EXCHANGE and RENAME_WHITEOUT have no remote equivalent.
            reply.error(libc::EINVAL);
            return;
        }
        let no_replace = flags & RENAME_NOREPLACE != 0;
        self.dispatch(move |fs, inodes| match fs.rename(&from, &to, no_replace) {
            Ok(()) => {
                inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &from, &e)),
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        self.dispatch(move |fs, _| match fs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &path, &e)),
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let ttl = self.ttl;
        self.dispatch(move |fs, inodes| {
            let opened = fs
                .create(&path, flags)
                .and_then(|fh| fs.getattr(&path).map(|attrs| (fh, attrs)));
            match opened {
                Ok((fh, attrs)) => {
                    reply.created(&ttl, &make_attr(inodes.ino(&path), &attrs), 0, fh, 0)
                }
                Err(e) => reply.error(errno("create", &path, &e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        self.dispatch(move |fs, _| match fs.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &format!("handle {}", fh), &e)),
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let data = data.to_vec();
        self.dispatch(move |fs, _| match fs.write(fh, offset as u64, &data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", &format!("handle {}", fh), &e)),
        });
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.dispatch(move |fs, _| match fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &format!("handle {}", fh), &e)),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(move |fs, _| match fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &format!("handle {}", fh), &e)),
        });
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        self.dispatch(move |fs, _| match fs.getattr(&path) {
            Ok(attrs) if attrs.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno("opendir", &path, &e)),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(ENOENT);
            return;
        };
        self.dispatch(move |fs, inodes| {
            let children = match fs.readdir(&path) {
                Ok(children) => children,
                Err(e) => {
                    reply.error(errno("readdir", &path, &e));
                    return;
                }
            };

            let parent_ino = path::parent(&path).map_or(ino, |p| inodes.ino(p));
            let mut entries: Vec<(u64, FileType, String)> = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent_ino, FileType::Directory, "..".to_string()),
            ];
            for DirEntry { name, attrs } in children {
                let child_ino = inodes.ino(&path::join(&path, &name));
                entries.push((child_ino, file_type(&attrs), name));
            }

            for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
                if reply.add(*ino, (i + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        self.dispatch(move |fs, inodes| match fs.statfs() {
            Ok(stats) => {
                let bsize = BLOCK_SIZE as u64;
                let blocks = stats.total_bytes / bsize;
                let free = stats.total_bytes.saturating_sub(stats.used_bytes) / bsize;
                let files = inodes.len() as u64;
                reply.statfs(
                    blocks,
                    free,
                    free,
                    files,
                    u64::MAX - files,
                    BLOCK_SIZE,
                    MAX_NAME_LEN,
                    BLOCK_SIZE,
                );
            }
            Err(e) => reply.error(errno("statfs", "/", &e)),
        });
    }
}

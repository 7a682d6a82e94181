//! Mount a remote cloud-storage account as a local filesystem.
//!
//! [`fs::CloudFs`] implements POSIX-shaped operations on top of a
//! [`remote::RemoteStorage`] with metadata, content and write-staging
//! caches; [`fuse::FuseAdapter`] exposes it to the kernel through `fuser`.

pub mod client;
pub mod config;
pub mod content;
pub mod disk_cache;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod handle;
pub mod lock;
pub mod memory;
pub mod metadata;
pub mod path;
pub mod remote;
pub mod resolver;
pub mod retry;
pub mod spool;
pub mod staging;
pub mod tree;

pub use config::{FsConfig, WriterPolicy};
pub use error::{FsError, RemoteError};
pub use fs::CloudFs;
pub use remote::RemoteStorage;

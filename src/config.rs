//! Filesystem configuration.

use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What a second writer gets while another handle owns unflushed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterPolicy {
    /// Fail with `Busy` (EAGAIN).
    #[default]
    Reject,
    /// Wait for the owner's flush, up to the lock timeout.
    Queue,
}

impl FromStr for WriterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown writer policy {:?} (expected reject or queue)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    /// `None` uses the user cache directory.
    pub dir: Option<PathBuf>,
    pub max_size: u64,
}

#[derive(Debug, Clone)]
pub struct FsConfig {
    pub attr_ttl: Duration,
    pub dir_ttl: Duration,
    /// In-memory content cache budget in bytes.
    pub cache_budget: u64,
    pub chunk_size: u64,
    /// Staged buffers above this size live in a temp file.
    pub spool_threshold: u64,
    pub writer_policy: WriterPolicy,
    pub retry: RetryPolicy,
    pub lock_timeout: Duration,
    /// `None` disables the disk cache.
    pub disk_cache: Option<DiskCacheConfig>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            attr_ttl: Duration::from_secs(5),
            dir_ttl: Duration::from_secs(5),
            cache_budget: 256 * 1024 * 1024,
            chunk_size: 4 * 1024 * 1024,
            spool_threshold: 5 * 1024 * 1024,
            writer_policy: WriterPolicy::Reject,
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(30),
            disk_cache: None,
        }
    }
}

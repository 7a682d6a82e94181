//! Bounded exponential backoff for remote calls.

use crate::error::{FsError, RemoteError};
use log::{debug, warn};
use std::fmt;
use std::time::{Duration, Instant};

/// Remote operation kinds, for logging and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    List,
    Metadata,
    Download,
    Upload,
    Delete,
    Move,
    CreateFolder,
    SpaceUsage,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::List => "list",
            Self::Metadata => "metadata",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::CreateFolder => "create_folder",
            Self::SpaceUsage => "space_usage",
        };
        f.write_str(name)
    }
}

/// A remote call waiting for its next attempt.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub kind: OpKind,
    pub path: String,
    pub attempt: u32,
    pub next_retry_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    /// A server hint wins but is still capped by `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        backoff.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `live` is checked before every retry; once it returns false the call
    /// gives up with [`FsError::Unmounted`].
    pub fn run<T>(
        &self,
        kind: OpKind,
        path: &str,
        live: impl Fn() -> bool,
        mut op: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, FsError> {
        let mut pending: Option<PendingOperation> = None;
        loop {
            match op() {
                Ok(value) => {
                    if let Some(p) = pending {
                        debug!("{} {} succeeded after {} attempts", kind, path, p.attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    let attempt = pending.as_ref().map_or(1, |p| p.attempt + 1);
                    if attempt >= self.max_attempts {
                        warn!("{} {} giving up after {} attempts: {}", kind, path, attempt, e);
                        return Err(FsError::RetriesExhausted {
                            op: kind,
                            path: path.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.delay_for(attempt, e.retry_after());
                    warn!("{} {} failed (attempt {}): {}, retrying in {:?}", kind, path, attempt, e, delay);
                    pending = Some(PendingOperation {
                        kind,
                        path: path.to_string(),
                        attempt,
                        next_retry_at: Instant::now() + delay,
                    });
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    if !live() {
                        return Err(FsError::Unmounted);
                    }
                }
                Err(e) => return Err(FsError::from_remote(path, e)),
            }
        }
    }
}

//! Error types for the cloudfs FUSE client.
//!
//! Two layers of errors exist:
//! - [`RemoteError`]: what the remote storage API (or the transport) said.
//! - [`FsError`]: what a filesystem operation surfaces to the host, after
//!   retries and consistency handling.
//!
//! Both map to errno codes so the FUSE layer can reply with the right value
//! (e.g., EAGAIN is retry-able, ENOENT is not).

use crate::retry::OpKind;
use std::time::Duration;
use thiserror::Error;

/// Remote storage errors with errno mapping.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// File or directory not found (HTTP 404 or "not found" in message).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Revision mismatch (HTTP 409): the remote changed since we last looked.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Destination already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Directory delete refused because it still has children.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Rate limited by server (HTTP 429).
    #[error("Rate limited (HTTP 429), retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Capability token rejected (HTTP 401).
    #[error("Authentication expired")]
    AuthExpired,

    /// Network timeout occurred.
    #[error("Network timeout after {duration:?}")]
    Timeout {
        duration: Duration,
        #[source]
        source: reqwest::Error,
    },

    /// Connection refused (server not reachable).
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Any other transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Server error (HTTP 5xx) or unexpected status.
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Invalid or malformed response from server.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// HTTP client error.
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

impl RemoteError {
    /// Map error to errno code.
    ///
    /// - ENOENT: not found (don't retry)
    /// - EAGAIN: rate limited (retry with delay)
    /// - EACCES: token expired (re-authenticate outside the mount)
    /// - ETIMEDOUT / ECONNREFUSED: network trouble (retry later)
    /// - EIO: conflicts, server errors, unknown errors
    /// - EPROTO: invalid response format (don't retry, likely bug)
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::RateLimited { .. } => libc::EAGAIN,
            Self::AuthExpired => libc::EACCES,
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::ConnectionRefused(_) => libc::ECONNREFUSED,
            Self::Conflict(_) | Self::Network(_) | Self::ServerError { .. } => libc::EIO,
            Self::InvalidResponse(_) | Self::JsonError(_) | Self::Base64Error(_) => libc::EPROTO,
            Self::HttpError(e) => {
                if e.is_timeout() {
                    libc::ETIMEDOUT
                } else if e.is_connect() {
                    libc::ECONNREFUSED
                } else {
                    libc::EIO
                }
            }
        }
    }

    /// Check if error is transient and potentially retry-able.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::ConnectionRefused(_)
            | Self::Network(_)
            | Self::HttpError(_) => true,
            // 4xx other than the ones classified above will not get better.
            Self::ServerError { status, .. } => (500..600).contains(status),
            Self::NotFound(_)
            | Self::Conflict(_)
            | Self::AlreadyExists(_)
            | Self::NotEmpty(_)
            | Self::AuthExpired
            | Self::InvalidResponse(_)
            | Self::JsonError(_)
            | Self::Base64Error(_) => false,
        }
    }

    /// Check if error indicates resource not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if error is a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Server-provided hint for how long to back off.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors surfaced by filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Path is held by another writer or lock wait timed out.
    #[error("busy: {0}")]
    Busy(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("bad file handle {0}")]
    BadHandle(u64),

    /// Remote revision changed again after one refresh-and-retry.
    #[error("conflicting remote change on {0}")]
    Conflict(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Transient remote failure that outlived the retry budget.
    #[error("{op} {path} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: OpKind,
        path: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// Any other remote-caused failure.
    #[error(transparent)]
    Remote(RemoteError),

    /// Local spool or disk cache I/O failure.
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The filesystem has been shut down.
    #[error("filesystem is unmounted")]
    Unmounted,

    /// Broken internal invariant (our cache is corrupt, not the remote).
    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Map error to errno code.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::Busy(_) => libc::EAGAIN,
            Self::Unsupported(_) => libc::ENOTSUP,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::BadHandle(_) => libc::EBADF,
            Self::Conflict(_) => libc::EIO,
            Self::AccessDenied(_) => libc::EACCES,
            Self::RetriesExhausted { source, .. } => match source {
                RemoteError::RateLimited { .. } => libc::EAGAIN,
                _ => libc::EIO,
            },
            Self::Remote(e) => e.to_errno(),
            Self::Io(_) => libc::EIO,
            Self::Unmounted => libc::ENOTCONN,
            Self::Internal(_) => libc::EIO,
        }
    }

    /// True for errors caused by our own state rather than the remote.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify a remote error that is final for `path` (no retry left).
    pub fn from_remote(path: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(_) => Self::NotFound(path.to_string()),
            RemoteError::AlreadyExists(_) => Self::AlreadyExists(path.to_string()),
            RemoteError::NotEmpty(_) => Self::NotEmpty(path.to_string()),
            RemoteError::Conflict(_) => Self::Conflict(path.to_string()),
            RemoteError::AuthExpired => Self::AccessDenied(path.to_string()),
            other => Self::Remote(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_enoent() {
        let err = RemoteError::NotFound("/path".to_string());
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(!err.is_transient());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rate_limited_maps_to_eagain() {
        let err = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.to_errno(), libc::EAGAIN);
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_server_error_maps_to_eio() {
        let err = RemoteError::ServerError {
            status: 500,
            message: "Internal Server Error".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.is_transient());

        let err = RemoteError::ServerError {
            status: 400,
            message: "bad request".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invalid_response_maps_to_eproto() {
        let err = RemoteError::InvalidResponse("bad json".to_string());
        assert_eq!(err.to_errno(), libc::EPROTO);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_auth_expired_is_access_denied() {
        let err = FsError::from_remote("/a", RemoteError::AuthExpired);
        assert!(matches!(err, FsError::AccessDenied(_)));
        assert_eq!(err.to_errno(), libc::EACCES);
        assert!(!err.is_internal());
    }

    #[test]
    fn test_exhausted_rate_limit_maps_to_eagain() {
        let err = FsError::RetriesExhausted {
            op: OpKind::Upload,
            path: "/a".to_string(),
            attempts: 5,
            source: RemoteError::RateLimited { retry_after: None },
        };
        assert_eq!(err.to_errno(), libc::EAGAIN);

        let err = FsError::RetriesExhausted {
            op: OpKind::Download,
            path: "/a".to_string(),
            attempts: 5,
            source: RemoteError::Network("reset".to_string()),
        };
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_internal_is_distinguishable() {
        let err = FsError::Internal("orphan node /x".to_string());
        assert!(err.is_internal());
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(!FsError::from_remote("/x", RemoteError::Conflict("rev".into())).is_internal());
    }
}

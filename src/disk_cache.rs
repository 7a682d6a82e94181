//! SQLite-backed persistent content cache.
//!
//! Chunks are keyed by (path, revision, chunk index) so a stale chunk can
//! never be served for a newer revision. The account root revision seen at
//! the previous unmount is stored alongside; if it differs at the next
//! mount the whole cache is dropped, since other clients may have rewritten
//! anything while we were away.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default on-disk budget (500 MB).
pub const DEFAULT_MAX_SIZE: u64 = 500 * 1024 * 1024;

const ROOT_REVISION_KEY: &str = "root_revision";

pub struct PersistentCache {
    conn: Mutex<Connection>,
    max_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCacheStats {
    pub chunk_count: u64,
    pub total_size: u64,
}

impl PersistentCache {
    /// Open the cache for `remote_key` under `dir`, or the user cache dir.
    pub fn open(dir: Option<&Path>, remote_key: &str, max_size: u64) -> Result<Self> {
        let cache_path = Self::cache_path(dir, remote_key)?;
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening disk cache at: {}", cache_path.display());
        Self::open_at(&cache_path, max_size)
    }

    pub fn open_at(db_path: &Path, max_size: u64) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chunks (
                path TEXT NOT NULL,
                revision TEXT NOT NULL,
                chunk INTEGER NOT NULL,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                cached_at INTEGER NOT NULL,
                PRIMARY KEY (path, revision, chunk)
            );

            CREATE TABLE IF NOT EXISTS cache_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_cached_at ON chunks(cached_at);
            ",
        )?;

        let cache = Self {
            conn: Mutex::new(conn),
            max_size,
        };

        if let Err(e) = cache.prune() {
            warn!("Disk cache cleanup failed: {}", e);
        }

        Ok(cache)
    }

    fn cache_path(dir: Option<&Path>, remote_key: &str) -> Result<PathBuf> {
        let cache_dir = match dir {
            Some(d) => d.to_path_buf(),
            None => dirs::cache_dir()
                .ok_or_else(|| anyhow!("Could not determine cache directory"))?
                .join("cloudfs-fuse"),
        };

        // Percent-encoding keeps distinct remotes in distinct files and
        // leaves no path separators in the name.
        Ok(cache_dir.join(format!("{}.db", urlencoding::encode(remote_key))))
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn get(&self, path: &str, revision: &str, chunk: u64) -> Option<Vec<u8>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT data FROM chunks WHERE path = ? AND revision = ? AND chunk = ?",
                params![path, revision, chunk as i64],
                |row| row.get(0),
            )
            .optional();
        match result {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Disk cache lookup failed for {}: {}", path, e);
                None
            }
        }
    }

    pub fn put(&self, path: &str, revision: &str, chunk: u64, data: &[u8]) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO chunks (path, revision, chunk, data, size, cached_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![path, revision, chunk as i64, data, data.len() as i64, Self::now()],
        ) {
            error!("Failed to cache chunk {} of {}: {}", chunk, path, e);
        }
    }

    /// Drop every chunk of `path` and of anything below it.
    pub fn invalidate(&self, path: &str) {
        let conn = self.conn.lock();
        let like = format!("{}/%", path.trim_end_matches('/'));
        if let Err(e) = conn.execute(
            "DELETE FROM chunks WHERE path = ? OR path LIKE ?",
            params![path, like],
        ) {
            warn!("Failed to invalidate disk cache for {}: {}", path, e);
        }
    }

    /// Drop chunks of `path` that belong to any revision except `keep`.
    pub fn retain_revision(&self, path: &str, keep: &str) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "DELETE FROM chunks WHERE path = ? AND revision != ?",
            params![path, keep],
        );
    }

    pub fn root_revision(&self) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM cache_state WHERE key = ?",
            params![ROOT_REVISION_KEY],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    pub fn set_root_revision(&self, revision: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cache_state (key, value) VALUES (?, ?)",
            params![ROOT_REVISION_KEY, revision],
        )?;
        Ok(())
    }

    /// Wipe the cache if the remote moved on since the last unmount.
    /// Returns true if it was wiped.
    pub fn reconcile_root(&self, current: &str) -> Result<bool> {
        match self.root_revision() {
            Some(stored) if stored == current => {
                debug!("Disk cache root revision {} still current", current);
                Ok(false)
            }
            stored => {
                if stored.is_some() {
                    info!("Remote changed since last mount, clearing disk cache");
                }
                self.clear()?;
                self.set_root_revision(current)?;
                Ok(stored.is_some())
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chunks", [])?;
        conn.execute("DELETE FROM cache_state", [])?;
        Ok(())
    }

    /// Delete oldest chunks until the total size fits the budget.
    pub fn prune(&self) -> Result<()> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM chunks", [], |row| {
            row.get(0)
        })?;
        let mut excess = total - self.max_size as i64;
        if excess <= 0 {
            return Ok(());
        }
        info!(
            "Disk cache size {} MB exceeds limit {} MB, pruning...",
            total / 1024 / 1024,
            self.max_size / 1024 / 1024
        );

        let victims: Vec<(String, String, i64, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT path, revision, chunk, size FROM chunks ORDER BY cached_at ASC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;
            let mut out = Vec::new();
            for row in rows {
                let row = row?;
                if excess <= 0 {
                    break;
                }
                excess -= row.3;
                out.push(row);
            }
            out
        };
        for (path, revision, chunk, _) in victims {
            conn.execute(
                "DELETE FROM chunks WHERE path = ? AND revision = ? AND chunk = ?",
                params![path, revision, chunk],
            )?;
        }
        Ok(())
    }

    pub fn stats(&self) -> DiskCacheStats {
        let conn = self.conn.lock();
        let (count, size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));
        DiskCacheStats {
            chunk_count: count as u64,
            total_size: size as u64,
        }
    }
}

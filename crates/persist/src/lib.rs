//! Tern persistence: release-history documents keyed by (namespace, release name).
//! Every write carries the version token read earlier; a mismatch is a conflict.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use metrics::{counter, histogram};
use tern_core::ResourceId;
use tracing::debug;

/// A stored history blob plus the token guarding the next write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHistory {
    pub blob: String,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: history {namespace}/{name} changed since version {expected:?}")]
    Conflict { namespace: String, name: String, expected: Option<String> },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<StoredHistory>>;

    /// Write `blob`. `expected` is the version from the last read, `None` when
    /// the document must not exist yet. Returns the new version.
    async fn put(&self, namespace: &str, name: &str, blob: &str, expected: Option<&str>) -> StoreResult<String>;

    /// Cluster object holding the document, if it lives in the cluster.
    fn backing_object(&self, _namespace: &str, _name: &str) -> Option<ResourceId> { None }
}

fn conflict(namespace: &str, name: &str, expected: Option<&str>) -> StoreError {
    counter!("history_conflict_total", 1u64);
    StoreError::Conflict { namespace: namespace.to_string(), name: name.to_string(), expected: expected.map(|s| s.to_string()) }
}

/// In-process store. Versions are a per-key counter.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<(String, String), (String, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Raw blob without version checks.
    pub fn peek(&self, namespace: &str, name: &str) -> Option<String> {
        let docs = self.docs.lock().ok()?;
        docs.get(&(namespace.to_string(), name.to_string())).map(|(b, _)| b.clone())
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<StoredHistory>> {
        let docs = self.docs.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(docs
            .get(&(namespace.to_string(), name.to_string()))
            .map(|(blob, v)| StoredHistory { blob: blob.clone(), version: v.to_string() }))
    }

    async fn put(&self, namespace: &str, name: &str, blob: &str, expected: Option<&str>) -> StoreResult<String> {
        let mut docs = self.docs.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        let key = (namespace.to_string(), name.to_string());
        let current = docs.get(&key).map(|(_, v)| v.to_string());
        if current.as_deref() != expected {
            return Err(conflict(namespace, name, expected));
        }
        let next = docs.get(&key).map(|(_, v)| v + 1).unwrap_or(1);
        docs.insert(key, (blob.to_string(), next));
        counter!("history_put_total", 1u64);
        Ok(next.to_string())
    }
}

/// SQLite-backed store. Simple, synchronous; a write is one short transaction.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let path = std::env::var("TERN_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS release_history (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                version   INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                blob      BLOB NOT NULL,
                PRIMARY KEY (namespace, name)
            )",
            [],
        ).context("creating release_history table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<StoredHistory>> {
        let started = std::time::Instant::now();
        let db = self.db.lock().map_err(|_| anyhow!("sqlite store poisoned"))?;
        let mut stmt = db
            .prepare("SELECT version, blob FROM release_history WHERE namespace = ?1 AND name = ?2")
            .context("preparing history read")?;
        let mut rows = stmt.query((namespace, name)).context("querying history")?;
        let out = match rows.next().context("reading history row")? {
            Some(row) => {
                let version: i64 = row.get(0).context("history version column")?;
                let blob: Vec<u8> = row.get(1).context("history blob column")?;
                Some(StoredHistory { blob: maybe_decompress(&blob), version: version.to_string() })
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn put(&self, namespace: &str, name: &str, blob: &str, expected: Option<&str>) -> StoreResult<String> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().map_err(|_| anyhow!("sqlite store poisoned"))?;
        let tx = db.transaction().context("opening history transaction")?;
        let current: Option<i64> = {
            let mut stmt = tx
                .prepare("SELECT version FROM release_history WHERE namespace = ?1 AND name = ?2")
                .context("preparing version read")?;
            let mut rows = stmt.query((namespace, name)).context("querying version")?;
            match rows.next().context("reading version row")? {
                Some(row) => Some(row.get(0).context("version column")?),
                None => None,
            }
        };
        if current.map(|v| v.to_string()).as_deref() != expected {
            return Err(conflict(namespace, name, expected));
        }
        let next = current.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO release_history(namespace, name, version, ts, blob) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(namespace, name) DO UPDATE SET version = ?3, ts = ?4, blob = ?5",
            (namespace, name, next, now_ts(), maybe_compress(blob)),
        ).context("writing history row")?;
        tx.commit().context("committing history")?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("history_put_total", 1u64);
        debug!(ns = %namespace, release = %name, version = next, "history stored");
        Ok(next.to_string())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".tern");
        let _ = std::fs::create_dir_all(&p);
        p.push("tern.db");
        return p.to_string_lossy().to_string();
    }
    "tern.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("TERN_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec())
    }
    #[cfg(not(feature = "zstd"))]
    {
        text.as_bytes().to_vec()
    }
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

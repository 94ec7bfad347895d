//! Kairos persistence: KV engine adapter.
//! One engine instance per time partition; SQLite underneath. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod scan;
mod sqlite;

pub use scan::{scan_range, Scan, SCAN_PAGE_SIZE};
pub use sqlite::{SqliteEngine, SqliteFactory, DATA_FILE};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("opening engine at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("engine at {0} is closed")]
    Closed(PathBuf),
    #[error("value codec: {0}")]
    Codec(String),
    /// One stored value could not be unframed. The rest of the scan is unaffected.
    #[error("undecodable value at key {key:02x?}: {reason}")]
    Corrupt { key: Vec<u8>, reason: String },
}

impl EngineError {
    /// Handle was closed underneath the caller (raced with partition deletion).
    pub fn is_closed(&self) -> bool {
        matches!(self, EngineError::Closed(_))
    }

    /// Failure confined to a single record.
    pub fn is_record(&self) -> bool {
        matches!(self, EngineError::Corrupt { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine tuning fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineTuning {
    /// Upper bound for the write-ahead log file kept after checkpoints.
    pub max_wal_bytes: i64,
    /// Page cache per partition, in KiB. Larger keeps more of the tree in memory.
    pub cache_size_kib: i64,
    /// `synchronous=FULL` instead of `NORMAL`.
    pub sync_full: bool,
    /// Emit every executed statement at trace level.
    pub log_statements: bool,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self { max_wal_bytes: 64 * 1024 * 1024, cache_size_kib: 8 * 1024, sync_full: false, log_statements: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    Reclaimed { freed_pages: i64 },
    NoGcNeeded,
}

pub type Entry = (Vec<u8>, Vec<u8>);

/// Ordered byte-keyed engine rooted at one directory.
pub trait KvEngine: Send + Sync {
    fn path(&self) -> &Path;
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;
    /// Apply all ops atomically.
    fn write_batch(&self, ops: Vec<BatchOp>) -> EngineResult<()>;
    /// Up to `limit` entries with `start <= key < end` (no upper bound when `end` is None), ascending.
    /// Values come back still framed; [`Scan`] unframes them one by one.
    fn scan_page(&self, start: &[u8], end: Option<&[u8]>, limit: usize) -> EngineResult<Vec<Entry>>;
    /// Reclaim space held by obsolete values once at least `discard_ratio` of the file is garbage.
    fn run_value_log_gc(&self, discard_ratio: f64) -> EngineResult<GcOutcome>;
    /// Release the handle. Later calls fail with [`EngineError::Closed`].
    fn close(&self);
    fn is_closed(&self) -> bool;

    fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_batch(vec![BatchOp::Put(key.to_vec(), value.to_vec())])
    }
}

/// Opens engines; the partitioned store owns one factory.
pub trait EngineFactory: Send + Sync {
    fn open(&self, path: &Path, tuning: &EngineTuning) -> EngineResult<Arc<dyn KvEngine>>;
}

const RAW: u8 = 0;
#[cfg(feature = "zstd")]
const ZSTD: u8 = 1;

/// Frame a value for storage, compressing when the `zstd` feature is on.
pub fn encode_value(value: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KAIROS_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(mut z) = zstd::encode_all(value, lvl) {
            z.insert(0, ZSTD);
            return z;
        }
    }
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(RAW);
    out.extend_from_slice(value);
    out
}

pub fn decode_value(stored: &[u8]) -> EngineResult<Vec<u8>> {
    match stored.split_first() {
        Some((&RAW, rest)) => Ok(rest.to_vec()),
        #[cfg(feature = "zstd")]
        Some((&ZSTD, rest)) => zstd::decode_all(std::io::Cursor::new(rest)).map_err(|e| EngineError::Codec(e.to_string())),
        Some((tag, _)) => Err(EngineError::Codec(format!("unknown value frame {}", tag))),
        None => Err(EngineError::Codec("empty value".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_frame_roundtrip() {
        let framed = encode_value(b"hello");
        assert_eq!(decode_value(&framed).unwrap(), b"hello");
    }

    #[test]
    fn value_frame_rejects_garbage() {
        assert!(decode_value(&[]).is_err());
        assert!(decode_value(&[9, 1, 2]).is_err());
    }
}

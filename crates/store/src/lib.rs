//! Kairos untyped store: byte keys bucketed into fixed-duration time partitions.
//!
//! Each partition is an independent engine under `<root>/<partition-key>/`. Handles are
//! opened lazily and cached until the partition is deleted or the store is closed.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kairos_core::{partitions_between, PartitionKey};
use kairos_persist::{BatchOp, EngineError, EngineFactory, EngineTuning, KvEngine, SqliteFactory};
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

mod range;
mod restore;

pub use range::{PartitionEntry, RangeRead};
pub use restore::RestoreReport;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store config: {0}")]
    Config(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("partition {partition}: {source}")]
    Partition {
        partition: PartitionKey,
        #[source]
        source: EngineError,
    },
    #[error("partition {partition}: {source}")]
    Record {
        partition: PartitionKey,
        #[source]
        source: EngineError,
    },
}

impl StoreError {
    /// Only one record was lost; the rest of the read is intact.
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record { .. })
    }

    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    fn partition(partition: PartitionKey, source: EngineError) -> Self {
        Self::Partition { partition, source }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fixed at startup; never changed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// `<store_root>/<kube_context>`
    pub root_path: PathBuf,
    pub partition_duration: Duration,
    pub tuning: EngineTuning,
}

impl StoreConfig {
    pub fn for_context(store_root: impl AsRef<Path>, context: &str) -> Self {
        Self {
            root_path: store_root.as_ref().join(context),
            partition_duration: Duration::from_secs(3600),
            tuning: EngineTuning::default(),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.root_path.as_os_str().is_empty() {
            return Err(StoreError::Config("root path is empty".into()));
        }
        if self.partition_duration < Duration::from_secs(60) {
            return Err(StoreError::Config(format!(
                "partition duration must be at least 60s (got {}s)",
                self.partition_duration.as_secs()
            )));
        }
        if self.tuning.max_wal_bytes <= 0 || self.tuning.cache_size_kib <= 0 {
            return Err(StoreError::Config("engine sizes must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Handles {
    open: BTreeMap<PartitionKey, Arc<dyn KvEngine>>,
    /// Partitions whose directory is being removed. Never reopened meanwhile.
    deleting: BTreeSet<PartitionKey>,
}

pub struct PartitionedStore {
    cfg: StoreConfig,
    factory: Box<dyn EngineFactory>,
    handles: RwLock<Handles>,
}

impl PartitionedStore {
    /// Open a SQLite-backed store.
    pub fn open(cfg: StoreConfig) -> StoreResult<Arc<Self>> {
        Self::open_with(cfg, Box::new(SqliteFactory))
    }

    pub fn open_with(cfg: StoreConfig, factory: Box<dyn EngineFactory>) -> StoreResult<Arc<Self>> {
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.root_path).map_err(|e| StoreError::io(&cfg.root_path, e))?;
        info!(root = %cfg.root_path.display(), partition_secs = cfg.partition_duration.as_secs(), "store opened");
        Ok(Arc::new(Self { cfg, factory, handles: RwLock::new(Handles::default()) }))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn partition_duration(&self) -> Duration {
        self.cfg.partition_duration
    }

    pub fn partition_for(&self, ts: DateTime<Utc>) -> PartitionKey {
        PartitionKey::for_time(ts, self.cfg.partition_duration)
    }

    pub fn partition_path(&self, key: PartitionKey) -> PathBuf {
        self.cfg.root_path.join(key.dir_name())
    }

    /// Cached handle, or open one. Reads pass `create = false` and never create a partition.
    ///
    /// Opening happens under the cache write lock. A partition being deleted reads as
    /// absent and refuses writes until its directory is gone.
    fn handle(&self, key: PartitionKey, create: bool) -> StoreResult<Option<Arc<dyn KvEngine>>> {
        if let Some(h) = self.handles.read().open.get(&key) {
            return Ok(Some(h.clone()));
        }
        let mut handles = self.handles.write();
        if let Some(h) = handles.open.get(&key) {
            return Ok(Some(h.clone()));
        }
        let path = self.partition_path(key);
        if handles.deleting.contains(&key) {
            return if create { Err(StoreError::partition(key, EngineError::Closed(path))) } else { Ok(None) };
        }
        if !create && !path.join(kairos_persist::DATA_FILE).exists() {
            return Ok(None);
        }
        let h = self.factory.open(&path, &self.cfg.tuning).map_err(|e| StoreError::partition(key, e))?;
        counter!("store_partitions_opened_total", 1u64);
        debug!(partition = %key, create, "partition handle opened");
        handles.open.insert(key, h.clone());
        Ok(Some(h))
    }

    pub fn write(&self, ts: DateTime<Utc>, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.write_batch(ts, vec![BatchOp::Put(key.to_vec(), value.to_vec())])
    }

    /// Apply ops atomically inside the partition owning `ts`.
    pub fn write_batch(&self, ts: DateTime<Utc>, ops: Vec<BatchOp>) -> StoreResult<()> {
        let started = Instant::now();
        let pk = self.partition_for(ts);
        let Some(h) = self.handle(pk, true)? else {
            return Err(StoreError::partition(pk, EngineError::Closed(self.partition_path(pk))));
        };
        h.write_batch(ops).map_err(|e| StoreError::partition(pk, e))?;
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Point read in the partition owning `ts`. Missing or vanished partitions read as absent.
    pub fn get(&self, ts: DateTime<Utc>, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let pk = self.partition_for(ts);
        let Some(h) = self.handle(pk, false)? else { return Ok(None) };
        match h.get(key) {
            Ok(v) => Ok(v),
            Err(e) if e.is_closed() => Ok(None),
            Err(e) => Err(StoreError::partition(pk, e)),
        }
    }

    /// Lazily scan every partition overlapping `[start, end]` for keys starting with `prefix`,
    /// partitions in time order. Boundary partitions may hold keys outside the window;
    /// callers that encode time in the key filter on it.
    pub fn read_range(self: &Arc<Self>, start: DateTime<Utc>, end: DateTime<Utc>, prefix: &[u8]) -> RangeRead {
        let parts = partitions_between(start, end, self.cfg.partition_duration);
        RangeRead::new(Arc::clone(self), parts, prefix.to_vec())
    }

    /// Partitions present on disk, oldest first.
    pub fn list_partitions(&self) -> StoreResult<Vec<PartitionKey>> {
        let root = &self.cfg.root_path;
        let rd = match std::fs::read_dir(root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(root, e)),
        };
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| StoreError::io(root, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match entry.file_name().to_str().and_then(PartitionKey::parse_dir_name) {
                Some(k) => out.push(k),
                None => debug!(name = ?entry.file_name(), "ignoring non-partition directory"),
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Close the cached handle (waiting for in-flight engine calls) and remove the directory.
    /// The cache lock is only held to swap the handle for a tombstone. Idempotent.
    pub fn delete_partition(&self, key: PartitionKey) -> StoreResult<()> {
        let evicted = {
            let mut handles = self.handles.write();
            handles.deleting.insert(key);
            handles.open.remove(&key)
        };
        if let Some(h) = evicted {
            h.close();
        }
        let path = self.partition_path(key);
        let removed = std::fs::remove_dir_all(&path);
        self.handles.write().deleting.remove(&key);
        match removed {
            Ok(()) => {
                counter!("store_partitions_deleted_total", 1u64);
                info!(partition = %key, "partition deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Bytes on disk for one partition; 0 when absent.
    pub fn partition_size(&self, key: PartitionKey) -> u64 {
        dir_size(&self.partition_path(key))
    }

    pub fn total_size(&self) -> StoreResult<u64> {
        Ok(self.list_partitions()?.into_iter().map(|k| self.partition_size(k)).sum())
    }

    /// Currently cached handles, oldest first.
    pub fn open_partitions(&self) -> Vec<(PartitionKey, Arc<dyn KvEngine>)> {
        self.handles.read().open.iter().map(|(k, h)| (*k, h.clone())).collect()
    }

    /// Close every cached handle. Used at process shutdown.
    pub fn close(&self) {
        let open = std::mem::take(&mut self.handles.write().open);
        for (key, h) in open {
            h.close();
            debug!(partition = %key, "partition handle closed");
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    let rd = match std::fs::read_dir(path) {
        Ok(rd) => rd,
        Err(_) => return 0,
    };
    let mut total = 0u64;
    for entry in rd.flatten() {
        match entry.metadata() {
            Ok(m) if m.is_dir() => total += dir_size(&entry.path()),
            Ok(m) => total += m.len(),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "stat failed while sizing partition"),
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn store(dir: &TempDir) -> Arc<PartitionedStore> {
        PartitionedStore::open(StoreConfig::for_context(dir.path(), "kind-test")).unwrap()
    }

    #[test]
    fn config_validation() {
        let mut cfg = StoreConfig::for_context("/tmp/x", "ctx");
        assert!(cfg.validate().is_ok());
        cfg.partition_duration = Duration::from_secs(5);
        assert!(matches!(cfg.validate(), Err(StoreError::Config(_))));
        let empty = StoreConfig { root_path: PathBuf::new(), ..StoreConfig::for_context("/tmp/x", "ctx") };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn writes_land_in_their_time_bucket() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.write(ts("2024-03-01T10:15:00Z"), b"a", b"1").unwrap();
        s.write(ts("2024-03-01T11:15:00Z"), b"b", b"2").unwrap();
        let parts: Vec<_> = s.list_partitions().unwrap().iter().map(|k| k.dir_name()).collect();
        assert_eq!(parts, vec!["20240301T100000Z", "20240301T110000Z"]);
        assert!(dir.path().join("kind-test").join("20240301T100000Z").is_dir());
        assert_eq!(s.get(ts("2024-03-01T10:59:00Z"), b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(s.get(ts("2024-03-01T11:00:00Z"), b"a").unwrap(), None);
    }

    #[test]
    fn reads_do_not_create_partitions() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert_eq!(s.get(ts("2024-03-01T10:00:00Z"), b"a").unwrap(), None);
        let n = s.read_range(ts("2024-03-01T00:00:00Z"), ts("2024-03-01T05:00:00Z"), b"").count();
        assert_eq!(n, 0);
        assert!(s.list_partitions().unwrap().is_empty());
        assert!(s.open_partitions().is_empty());
    }

    #[test]
    fn delete_is_idempotent_and_drops_handle() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let t = ts("2024-03-01T10:00:00Z");
        s.write(t, b"a", b"1").unwrap();
        let pk = s.partition_for(t);
        assert!(s.partition_size(pk) > 0);
        s.delete_partition(pk).unwrap();
        s.delete_partition(pk).unwrap();
        assert!(s.open_partitions().is_empty());
        assert_eq!(s.get(t, b"a").unwrap(), None);
        assert_eq!(s.partition_size(pk), 0);
    }

    #[test]
    fn ignores_foreign_directories() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        std::fs::create_dir_all(dir.path().join("kind-test").join("lost+found")).unwrap();
        s.write(ts("2024-03-01T10:00:00Z"), b"a", b"1").unwrap();
        assert_eq!(s.list_partitions().unwrap().len(), 1);
    }
}

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kairos_persist::{
    BatchOp, EngineError, EngineFactory, EngineResult, EngineTuning, Entry, GcOutcome, KvEngine, SqliteFactory,
};
use kairos_store::{PartitionedStore, StoreConfig, StoreError};
use tempfile::TempDir;

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn key(i: u32) -> Vec<u8> {
    let mut k = b"pod/".to_vec();
    k.extend_from_slice(&i.to_be_bytes());
    k
}

#[test]
fn same_bucket_write_is_visible_to_range_read() {
    let dir = TempDir::new().unwrap();
    let s = PartitionedStore::open(StoreConfig::for_context(dir.path(), "ctx")).unwrap();
    s.write(ts("2024-03-01T10:05:00Z"), b"pod/a", b"v").unwrap();
    // Window only touches the same bucket at a different instant.
    let got: Vec<_> = s
        .read_range(ts("2024-03-01T10:50:00Z"), ts("2024-03-01T10:55:00Z"), b"pod/")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].key, b"pod/a");
}

#[test]
fn deleting_partition_mid_scan_skips_rest_without_error() {
    let dir = TempDir::new().unwrap();
    let s = PartitionedStore::open(StoreConfig::for_context(dir.path(), "ctx")).unwrap();
    let early = ts("2024-03-01T10:00:00Z");
    let late = ts("2024-03-01T11:00:00Z");
    for i in 0..600 {
        s.write(early, &key(i), b"early").unwrap();
    }
    for i in 0..3 {
        s.write(late, &key(i), b"late").unwrap();
    }

    let mut read = s.read_range(early, late, b"pod/");
    let first = read.next().unwrap().unwrap();
    assert_eq!(first.value, b"early");

    s.delete_partition(s.partition_for(early)).unwrap();

    let rest: Vec<_> = read.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
    assert!(rest.len() < 600 + 3 - 1, "scan must stop reading the deleted partition");
    assert_eq!(rest.iter().filter(|e| e.value == b"late").count(), 3);
    assert_eq!(read.vanished(), 1);

    // Later reads see nothing from the deleted bucket.
    let after: Vec<_> = s.read_range(early, early, b"pod/").collect();
    assert!(after.is_empty());
}

/// Fails to open one particular partition directory.
struct FlakyFactory {
    bad: String,
}

impl EngineFactory for FlakyFactory {
    fn open(&self, path: &Path, tuning: &EngineTuning) -> EngineResult<Arc<dyn KvEngine>> {
        if path.ends_with(&self.bad) {
            return Err(EngineError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            });
        }
        SqliteFactory.open(path, tuning)
    }
}

#[test]
fn unopenable_partition_yields_error_item_and_scan_continues() {
    let dir = TempDir::new().unwrap();
    let cfg = StoreConfig::for_context(dir.path(), "ctx");
    {
        let s = PartitionedStore::open(cfg.clone()).unwrap();
        s.write(ts("2024-03-01T10:00:00Z"), b"pod/a", b"1").unwrap();
        s.write(ts("2024-03-01T11:00:00Z"), b"pod/b", b"2").unwrap();
        s.close();
    }
    let s = PartitionedStore::open_with(cfg, Box::new(FlakyFactory { bad: "20240301T100000Z".into() })).unwrap();
    let mut read = s.read_range(ts("2024-03-01T10:00:00Z"), ts("2024-03-01T11:30:00Z"), b"pod/");
    let items: Vec<_> = read.by_ref().collect();
    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], Err(StoreError::Partition { .. })));
    assert_eq!(items[1].as_ref().unwrap().value, b"2");
    assert_eq!(read.failed(), 1);

    // Writes into the broken bucket surface the error to the caller only.
    assert!(s.write(ts("2024-03-01T10:30:00Z"), b"pod/c", b"3").is_err());
    assert!(s.write(ts("2024-03-01T11:30:00Z"), b"pod/c", b"3").is_ok());
}

/// Engine whose `close` takes a while, as a large partition would.
struct SlowClose(Arc<dyn KvEngine>);

impl KvEngine for SlowClose {
    fn path(&self) -> &Path {
        self.0.path()
    }
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.0.get(key)
    }
    fn write_batch(&self, ops: Vec<BatchOp>) -> EngineResult<()> {
        self.0.write_batch(ops)
    }
    fn scan_page(&self, start: &[u8], end: Option<&[u8]>, limit: usize) -> EngineResult<Vec<Entry>> {
        self.0.scan_page(start, end, limit)
    }
    fn run_value_log_gc(&self, discard_ratio: f64) -> EngineResult<GcOutcome> {
        self.0.run_value_log_gc(discard_ratio)
    }
    fn close(&self) {
        std::thread::sleep(Duration::from_millis(400));
        self.0.close();
    }
    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

struct SlowCloseFactory;

impl EngineFactory for SlowCloseFactory {
    fn open(&self, path: &Path, tuning: &EngineTuning) -> EngineResult<Arc<dyn KvEngine>> {
        Ok(Arc::new(SlowClose(SqliteFactory.open(path, tuning)?)))
    }
}

#[test]
fn deletion_does_not_stall_other_partitions() {
    let dir = TempDir::new().unwrap();
    let s = PartitionedStore::open_with(StoreConfig::for_context(dir.path(), "ctx"), Box::new(SlowCloseFactory)).unwrap();
    let doomed = ts("2024-03-01T10:00:00Z");
    let other = ts("2024-03-01T11:00:00Z");
    s.write(doomed, b"pod/a", b"1").unwrap();
    s.write(other, b"pod/b", b"2").unwrap();

    let deleter = {
        let s = s.clone();
        std::thread::spawn(move || s.delete_partition(s.partition_for(doomed)))
    };
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    assert_eq!(s.get(other, b"pod/b").unwrap(), Some(b"2".to_vec()));
    s.write(other, b"pod/c", b"3").unwrap();
    assert!(started.elapsed() < Duration::from_millis(250), "other partitions waited on the deletion");

    // The tombstoned bucket reads as absent and is not reopened.
    assert_eq!(s.get(doomed, b"pod/a").unwrap(), None);
    assert!(s.write(doomed, b"pod/z", b"x").is_err());

    deleter.join().unwrap().unwrap();
    assert!(!s.partition_path(s.partition_for(doomed)).exists());
    s.write(doomed, b"pod/new", b"4").unwrap();
    assert_eq!(s.get(doomed, b"pod/new").unwrap(), Some(b"4".to_vec()));
}

use std::path::Path;

use kairos_core::PartitionKey;
use kairos_persist::{scan_range, BatchOp, SCAN_PAGE_SIZE};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{PartitionedStore, StoreError, StoreResult};

/// Outcome of merging a backup into a live store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub partitions: usize,
    pub records: u64,
    /// Records whose value could not be read back from the backup.
    pub skipped: u64,
}

impl PartitionedStore {
    /// Merge every partition found under `backup` (a copy of some `<store_root>/<context>`)
    /// into this store. Keys already present are overwritten by the backup's value.
    ///
    /// Run before ingestion starts. Backup partitions are re-bucketed by their start time,
    /// so a backup taken with a different partition duration still lands where reads look.
    pub fn restore_from(&self, backup: &Path) -> StoreResult<RestoreReport> {
        if backup == self.cfg.root_path {
            return Err(StoreError::Config("cannot restore a store into itself".into()));
        }
        let rd = std::fs::read_dir(backup).map_err(|e| StoreError::io(backup, e))?;
        let mut sources = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| StoreError::io(backup, e))?;
            let parsed = entry.file_name().to_str().and_then(PartitionKey::parse_dir_name);
            match parsed {
                Some(k) if entry.path().join(kairos_persist::DATA_FILE).exists() => sources.push((k, entry.path())),
                _ => debug!(name = ?entry.file_name(), "not a partition; skipped during restore"),
            }
        }
        sources.sort_unstable_by_key(|(k, _)| *k);

        let mut report = RestoreReport::default();
        for (src_key, path) in sources {
            let dest = self.partition_for(src_key.start());
            let src = self.factory.open(&path, &self.cfg.tuning).map_err(|e| StoreError::partition(src_key, e))?;
            let Some(h) = self.handle(dest, true)? else {
                src.close();
                return Err(StoreError::partition(dest, kairos_persist::EngineError::Closed(self.partition_path(dest))));
            };
            let mut batch = Vec::with_capacity(SCAN_PAGE_SIZE);
            for item in scan_range(src.clone(), &[], None) {
                match item {
                    Ok((k, v)) => batch.push(BatchOp::Put(k, v)),
                    Err(e) if e.is_record() => {
                        warn!(partition = %src_key, error = %e, "unreadable record in backup; skipped");
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        src.close();
                        return Err(StoreError::partition(src_key, e));
                    }
                }
                if batch.len() >= SCAN_PAGE_SIZE {
                    report.records += batch.len() as u64;
                    h.write_batch(std::mem::take(&mut batch)).map_err(|e| StoreError::partition(dest, e))?;
                }
            }
            report.records += batch.len() as u64;
            if !batch.is_empty() {
                h.write_batch(batch).map_err(|e| StoreError::partition(dest, e))?;
            }
            src.close();
            report.partitions += 1;
            debug!(from = %src_key, into = %dest, "partition restored");
        }
        counter!("store_restored_records_total", report.records);
        info!(
            backup = %backup.display(),
            partitions = report.partitions,
            records = report.records,
            skipped = report.skipped,
            "restore finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn backup_merges_into_existing_store() {
        let dir = TempDir::new().unwrap();
        let backup = {
            let b = PartitionedStore::open(StoreConfig::for_context(dir.path(), "old")).unwrap();
            b.write(ts("2024-03-01T10:05:00Z"), b"pod/a", b"from-backup").unwrap();
            b.write(ts("2024-03-01T12:05:00Z"), b"pod/b", b"later").unwrap();
            b.close();
            b.config().root_path.clone()
        };
        std::fs::create_dir_all(backup.join("lost+found")).unwrap();

        let live = PartitionedStore::open(StoreConfig::for_context(dir.path(), "live")).unwrap();
        live.write(ts("2024-03-01T10:30:00Z"), b"pod/c", b"live").unwrap();
        let report = live.restore_from(&backup).unwrap();
        assert_eq!(report, RestoreReport { partitions: 2, records: 2, skipped: 0 });

        assert_eq!(live.get(ts("2024-03-01T10:05:00Z"), b"pod/a").unwrap(), Some(b"from-backup".to_vec()));
        assert_eq!(live.get(ts("2024-03-01T10:05:00Z"), b"pod/c").unwrap(), Some(b"live".to_vec()));
        assert_eq!(live.get(ts("2024-03-01T12:05:00Z"), b"pod/b").unwrap(), Some(b"later".to_vec()));
        assert_eq!(live.list_partitions().unwrap().len(), 2);
    }

    #[test]
    fn rebuckets_partitions_of_a_finer_backup() {
        let dir = TempDir::new().unwrap();
        let fine = StoreConfig { partition_duration: Duration::from_secs(600), ..StoreConfig::for_context(dir.path(), "fine") };
        let backup = {
            let b = PartitionedStore::open(fine).unwrap();
            b.write(ts("2024-03-01T10:05:00Z"), b"k1", b"1").unwrap();
            b.write(ts("2024-03-01T10:45:00Z"), b"k2", b"2").unwrap();
            b.close();
            b.config().root_path.clone()
        };
        let live = PartitionedStore::open(StoreConfig::for_context(dir.path(), "live")).unwrap();
        live.restore_from(&backup).unwrap();
        assert_eq!(live.list_partitions().unwrap(), vec![live.partition_for(ts("2024-03-01T10:00:00Z"))]);
        let keys: Vec<_> = live
            .read_range(ts("2024-03-01T10:00:00Z"), ts("2024-03-01T10:59:00Z"), b"k")
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn missing_backup_or_self_restore_is_an_error() {
        let dir = TempDir::new().unwrap();
        let live = PartitionedStore::open(StoreConfig::for_context(dir.path(), "live")).unwrap();
        assert!(matches!(live.restore_from(&dir.path().join("nope")), Err(StoreError::Io { .. })));
        let own = live.config().root_path.clone();
        assert!(matches!(live.restore_from(&own), Err(StoreError::Config(_))));
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, trace};

use crate::{decode_value, encode_value, BatchOp, EngineError, EngineFactory, EngineResult, EngineTuning, Entry, GcOutcome, KvEngine};

/// Database file inside each partition directory.
pub const DATA_FILE: &str = "data.sqlite";

/// SQLite-backed ordered KV. A `WITHOUT ROWID` table is a B-tree keyed by the blob.
pub struct SqliteEngine {
    path: PathBuf,
    db: Mutex<Option<Connection>>,
}

fn log_statement(sql: &str) {
    trace!(target: "kairos_persist::sql", sql, "statement");
}

impl SqliteEngine {
    pub fn open(path: &Path, tuning: &EngineTuning) -> EngineResult<Self> {
        let started = Instant::now();
        std::fs::create_dir_all(path).map_err(|e| EngineError::Io { path: path.to_path_buf(), source: e })?;
        let file = path.join(DATA_FILE);
        let open_err = |source| EngineError::Open { path: path.to_path_buf(), source };
        let mut db = Connection::open(&file).map_err(open_err)?;
        db.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0)).map_err(open_err)?;
        db.pragma_update(None, "synchronous", if tuning.sync_full { "FULL" } else { "NORMAL" }).map_err(open_err)?;
        db.pragma_update_and_check(None, "journal_size_limit", tuning.max_wal_bytes, |r| r.get::<_, i64>(0))
            .map_err(open_err)?;
        db.pragma_update(None, "cache_size", -tuning.cache_size_kib).map_err(open_err)?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY NOT NULL,
                value BLOB NOT NULL
            ) WITHOUT ROWID",
            [],
        )
        .map_err(open_err)?;
        if tuning.log_statements {
            db.trace(Some(log_statement));
        }
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path.display(), "engine opened");
        Ok(Self { path: path.to_path_buf(), db: Mutex::new(Some(db)) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> EngineResult<T>) -> EngineResult<T> {
        let mut guard = self.db.lock();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(EngineError::Closed(self.path.clone())),
        }
    }
}

impl KvEngine for SqliteEngine {
    fn path(&self) -> &Path {
        &self.path
    }

    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.with_conn(|db| {
            let stored: Option<Vec<u8>> = db
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))
                .optional()?;
            stored.map(|v| decode_value(&v)).transpose()
        })
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> EngineResult<()> {
        let started = Instant::now();
        let n = ops.len() as u64;
        self.with_conn(|db| {
            let tx = db.transaction()?;
            {
                let mut put = tx.prepare_cached("INSERT OR REPLACE INTO kv(key, value) VALUES (?1, ?2)")?;
                let mut del = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
                for op in ops {
                    match op {
                        BatchOp::Put(k, v) => {
                            put.execute(params![k, encode_value(&v)])?;
                        }
                        BatchOp::Delete(k) => {
                            del.execute([k])?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        histogram!("persist_write_batch_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_ops_total", n);
        Ok(())
    }

    fn scan_page(&self, start: &[u8], end: Option<&[u8]>, limit: usize) -> EngineResult<Vec<Entry>> {
        self.with_conn(|db| {
            let mut out = Vec::new();
            match end {
                Some(end) => {
                    let mut stmt = db.prepare_cached(
                        "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key LIMIT ?3",
                    )?;
                    let mut rows = stmt.query(params![start, end, limit as i64])?;
                    while let Some(row) = rows.next()? {
                        out.push((row.get(0)?, row.get(1)?));
                    }
                }
                None => {
                    let mut stmt =
                        db.prepare_cached("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key LIMIT ?2")?;
                    let mut rows = stmt.query(params![start, limit as i64])?;
                    while let Some(row) = rows.next()? {
                        out.push((row.get(0)?, row.get(1)?));
                    }
                }
            }
            Ok(out)
        })
    }

    fn run_value_log_gc(&self, discard_ratio: f64) -> EngineResult<GcOutcome> {
        let started = Instant::now();
        let outcome = self.with_conn(|db| {
            db.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            let pages: i64 = db.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let free: i64 = db.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
            if pages == 0 || free == 0 || (free as f64 / pages as f64) < discard_ratio {
                return Ok(GcOutcome::NoGcNeeded);
            }
            db.execute_batch("VACUUM")?;
            Ok(GcOutcome::Reclaimed { freed_pages: free })
        })?;
        if let GcOutcome::Reclaimed { freed_pages } = outcome {
            debug!(path = %self.path.display(), freed_pages, "value gc reclaimed space");
            histogram!("persist_gc_ms", started.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(outcome)
    }

    fn close(&self) {
        // Taking the lock waits for any in-flight page read or batch.
        if let Some(db) = self.db.lock().take() {
            if let Err((_, e)) = db.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "engine close failed");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.db.lock().is_none()
    }
}

impl Drop for SqliteEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteFactory;

impl EngineFactory for SqliteFactory {
    fn open(&self, path: &Path, tuning: &EngineTuning) -> EngineResult<Arc<dyn KvEngine>> {
        Ok(Arc::new(SqliteEngine::open(path, tuning)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SqliteEngine {
        SqliteEngine::open(&dir.path().join("p"), &EngineTuning::default()).unwrap()
    }

    #[test]
    fn put_get_overwrite() {
        let dir = TempDir::new().unwrap();
        let e = open(&dir);
        assert_eq!(e.get(b"k").unwrap(), None);
        e.put(b"k", b"v1").unwrap();
        e.put(b"k", b"v2").unwrap();
        assert_eq!(e.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn batch_puts_and_deletes() {
        let dir = TempDir::new().unwrap();
        let e = open(&dir);
        e.put(b"gone", b"x").unwrap();
        e.write_batch(vec![
            BatchOp::Put(b"a".to_vec(), b"1".to_vec()),
            BatchOp::Put(b"b".to_vec(), b"2".to_vec()),
            BatchOp::Delete(b"gone".to_vec()),
        ])
        .unwrap();
        assert_eq!(e.get(b"gone").unwrap(), None);
        let page = e.scan_page(b"", None, 10).unwrap();
        assert_eq!(decode_value(&page[0].1).unwrap(), b"1");
        let keys: Vec<_> = page.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn scan_page_respects_bounds_and_limit() {
        let dir = TempDir::new().unwrap();
        let e = open(&dir);
        for i in 0u8..10 {
            e.put(&[i], &[i]).unwrap();
        }
        let page = e.scan_page(&[2], Some(&[8]), 3).unwrap();
        assert_eq!(page.iter().map(|(k, _)| k[0]).collect::<Vec<_>>(), vec![2, 3, 4]);
        let tail = e.scan_page(&[7], Some(&[8]), 10).unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn closed_handle_reports_closed() {
        let dir = TempDir::new().unwrap();
        let e = open(&dir);
        e.put(b"k", b"v").unwrap();
        e.close();
        assert!(e.is_closed());
        assert!(e.get(b"k").unwrap_err().is_closed());
        assert!(e.scan_page(b"", None, 1).unwrap_err().is_closed());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let e = open(&dir);
            e.put(b"k", b"v").unwrap();
            e.close();
        }
        let e = open(&dir);
        assert_eq!(e.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn gc_reclaims_after_mass_delete() {
        let dir = TempDir::new().unwrap();
        let e = open(&dir);
        let blob = vec![7u8; 4096];
        let puts = (0u32..200).map(|i| BatchOp::Put(i.to_be_bytes().to_vec(), blob.clone())).collect();
        e.write_batch(puts).unwrap();
        assert_eq!(e.run_value_log_gc(0.5).unwrap(), GcOutcome::NoGcNeeded);
        let dels = (0u32..200).map(|i| BatchOp::Delete(i.to_be_bytes().to_vec())).collect();
        e.write_batch(dels).unwrap();
        assert!(matches!(e.run_value_log_gc(0.5).unwrap(), GcOutcome::Reclaimed { .. }));
        assert_eq!(e.run_value_log_gc(0.5).unwrap(), GcOutcome::NoGcNeeded);
    }
}

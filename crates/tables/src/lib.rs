//! Kairos typed tables: named, typed views over the partitioned store.
//!
//! This is the read surface for query code. Reads decode record by record; a record that
//! fails to decode is logged and skipped, and a partition that could not be read marks
//! the result as partial instead of failing it.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kairos_core::{ChangeKind, PartitionKey};
use kairos_store::{PartitionedStore, RangeRead, StoreError};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod key;

pub use key::{namespace_prefix, resource_prefix, TableKey};

pub const WATCH_TABLE: &str = "watch";
pub const ACTIVITY_TABLE: &str = "activity";

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encoding {table} record: {source}")]
    Encode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type TableResult<T> = Result<T, TableError>;

/// Snapshot of a resource as observed by the watch source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchRecord {
    pub change: ChangeKind,
    #[serde(default)]
    pub minor: bool,
    #[serde(default)]
    pub resource_version: String,
    pub payload: String,
}

/// Per-resource, per-partition activity: when it changed and when it was seen unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatchActivity {
    pub changed_at: Vec<DateTime<Utc>>,
    pub no_change_at: Vec<DateTime<Utc>>,
}

/// A typed table. Values are stored as JSON.
pub struct Table<V> {
    name: &'static str,
    store: Arc<PartitionedStore>,
    _v: PhantomData<fn() -> V>,
}

impl<V> Clone for Table<V> {
    fn clone(&self) -> Self {
        Self { name: self.name, store: Arc::clone(&self.store), _v: PhantomData }
    }
}

impl<V: Serialize + DeserializeOwned> Table<V> {
    pub fn new(name: &'static str, store: Arc<PartitionedStore>) -> Self {
        Self { name, store, _v: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn put(&self, kind: &str, namespace: &str, name: &str, ts: DateTime<Utc>, value: &V) -> TableResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| TableError::Encode { table: self.name, source })?;
        let key = TableKey::new(self.name, kind, namespace, name, ts).encode();
        self.store.write(ts, &key, &bytes)?;
        Ok(())
    }

    /// Exact-key lookup. A record that fails to decode reads as absent.
    pub fn get(&self, kind: &str, namespace: &str, name: &str, ts: DateTime<Utc>) -> TableResult<Option<V>> {
        let key = TableKey::new(self.name, kind, namespace, name, ts).encode();
        let Some(bytes) = self.store.get(ts, &key)? else { return Ok(None) };
        match serde_json::from_slice(&bytes) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(table = self.name, kind, namespace, name, error = %e, "dropping undecodable record");
                Ok(None)
            }
        }
    }

    /// Lazy, ascending history of one resource within `[start, end]`.
    pub fn get_history(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> History<V> {
        let prefix = resource_prefix(self.name, kind, namespace, name);
        History::new(self.name, self.store.read_range(start, end, &prefix), start, end)
    }

    /// Distinct names of `kind` in `namespace` observed within `[start, end]`.
    pub fn list_resources(
        &self,
        kind: &str,
        namespace: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ResourceList {
        let prefix = namespace_prefix(self.name, kind, namespace);
        let mut out = ResourceList::default();
        for item in self.store.read_range(start, end, &prefix) {
            match item {
                Ok(entry) => match TableKey::decode(&entry.key) {
                    Some(k) if k.ts >= start && k.ts <= end => {
                        out.names.insert(k.name);
                    }
                    Some(_) => {}
                    None => {
                        warn!(table = self.name, partition = %entry.partition, "skipping malformed key");
                        out.skipped += 1;
                    }
                },
                Err(e) if e.is_record() => {
                    warn!(table = self.name, error = %e, "skipping unreadable record");
                    out.skipped += 1;
                }
                Err(e) => {
                    warn!(table = self.name, error = %e, "partition unavailable while listing");
                    out.partial = true;
                }
            }
        }
        out
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceList {
    pub names: BTreeSet<String>,
    /// Some partition in the window could not be read.
    pub partial: bool,
    pub skipped: usize,
}

/// Lazy history scan. Check [`History::is_partial`] after draining it.
pub struct History<V> {
    table: &'static str,
    read: RangeRead,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    partial: bool,
    skipped: usize,
    _v: PhantomData<fn() -> V>,
}

impl<V: DeserializeOwned> History<V> {
    fn new(table: &'static str, read: RangeRead, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { table, read, start, end, partial: false, skipped: 0, _v: PhantomData }
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Records dropped because their key or value failed to decode.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn collect_result(mut self) -> HistoryResult<V> {
        let entries: Vec<_> = self.by_ref().collect();
        HistoryResult { entries, partial: self.partial, skipped: self.skipped }
    }
}

impl<V: DeserializeOwned> Iterator for History<V> {
    type Item = (DateTime<Utc>, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.read.next()? {
                Ok(entry) => entry,
                Err(e) if e.is_record() => {
                    warn!(table = self.table, error = %e, "skipping unreadable record");
                    self.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(table = self.table, error = %e, "partition unavailable; history is partial");
                    self.partial = true;
                    continue;
                }
            };
            let Some(key) = TableKey::decode(&entry.key) else {
                warn!(table = self.table, partition = %entry.partition, "skipping malformed key");
                self.skipped += 1;
                continue;
            };
            if key.ts < self.start || key.ts > self.end {
                continue;
            }
            match serde_json::from_slice::<V>(&entry.value) {
                Ok(v) => return Some((key.ts, v)),
                Err(e) => {
                    warn!(table = self.table, kind = %key.kind, name = %key.name, ts = %key.ts, error = %e, "skipping undecodable record");
                    counter!("tables_decode_errors_total", 1u64);
                    self.skipped += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryResult<V> {
    pub entries: Vec<(DateTime<Utc>, V)>,
    pub partial: bool,
    pub skipped: usize,
}

/// The set of tables backed by one store.
#[derive(Clone)]
pub struct Tables {
    store: Arc<PartitionedStore>,
    watch: Table<WatchRecord>,
    activity: Table<WatchActivity>,
}

impl Tables {
    pub fn new(store: Arc<PartitionedStore>) -> Self {
        Self {
            watch: Table::new(WATCH_TABLE, Arc::clone(&store)),
            activity: Table::new(ACTIVITY_TABLE, Arc::clone(&store)),
            store,
        }
    }

    pub fn store(&self) -> &Arc<PartitionedStore> {
        &self.store
    }

    pub fn watch(&self) -> &Table<WatchRecord> {
        &self.watch
    }

    pub fn activity(&self) -> &Table<WatchActivity> {
        &self.activity
    }

    /// Fold one observation into the resource's activity record for the partition owning `ts`.
    ///
    /// Read-modify-write; relies on the ingestion processor being the only writer.
    pub fn record_activity(&self, kind: &str, namespace: &str, name: &str, ts: DateTime<Utc>, changed: bool) -> TableResult<()> {
        let bucket = PartitionKey::for_time(ts, self.store.partition_duration()).start();
        let mut act = self.activity.get(kind, namespace, name, bucket)?.unwrap_or_default();
        if changed {
            act.changed_at.push(ts);
        } else {
            act.no_change_at.push(ts);
        }
        debug!(kind, namespace, name, changed, "activity recorded");
        self.activity.put(kind, namespace, name, bucket, &act)
    }
}

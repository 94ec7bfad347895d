use chrono::{DateTime, Utc};
use kairos_core::{ChangeEvent, ChangeKind};
use kairos_tables::{Tables, WatchRecord};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{ProcessorConfig, ProcessorStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Persisted,
    MinorSuppressed,
    Duplicate,
    Stale,
    WriteFailed,
}

type ResourceId = (String, String, String);

/// Per-event policy: stale filter, resourceVersion dedup, minor-update suppression, write.
///
/// Synchronous and single-threaded; the processor worker owns it.
pub struct Pipeline {
    tables: Tables,
    cfg: ProcessorConfig,
    last_rv: FxHashMap<ResourceId, String>,
    stats: ProcessorStats,
}

impl Pipeline {
    pub fn new(tables: Tables, cfg: ProcessorConfig) -> Self {
        Self { tables, cfg, last_rv: FxHashMap::default(), stats: ProcessorStats::default() }
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn into_stats(self) -> ProcessorStats {
        self.stats
    }

    pub fn handle(&mut self, ev: ChangeEvent) -> Outcome {
        self.handle_at(ev, Utc::now())
    }

    pub fn handle_at(&mut self, ev: ChangeEvent, now: DateTime<Utc>) -> Outcome {
        self.stats.received += 1;
        counter!("ingest_events_total", 1u64);
        let outcome = self.classify(&ev, now);
        let outcome = match outcome {
            Outcome::Persisted => self.persist(&ev),
            Outcome::MinorSuppressed => {
                if let Err(e) = self.tables.record_activity(&ev.kind, &ev.namespace, &ev.name, ev.observed_at, false) {
                    warn!(resource = %ev.resource_key(), error = %e, "recording no-change activity failed");
                }
                self.remember(&ev);
                outcome
            }
            other => other,
        };
        match outcome {
            Outcome::Persisted => self.stats.persisted += 1,
            Outcome::MinorSuppressed => self.stats.minor_suppressed += 1,
            Outcome::Duplicate => self.stats.duplicates += 1,
            Outcome::Stale => self.stats.stale += 1,
            Outcome::WriteFailed => self.stats.write_errors += 1,
        }
        outcome
    }

    fn classify(&self, ev: &ChangeEvent, now: DateTime<Utc>) -> Outcome {
        let lookback = chrono::Duration::from_std(self.cfg.max_lookback).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        if now.signed_duration_since(ev.observed_at) > lookback {
            debug!(resource = %ev.resource_key(), at = %ev.observed_at, "dropping event older than lookback");
            counter!("ingest_stale_total", 1u64);
            return Outcome::Stale;
        }
        if !ev.resource_version.is_empty() && ev.change != ChangeKind::Delete {
            let id = (ev.kind.clone(), ev.namespace.clone(), ev.name.clone());
            if self.last_rv.get(&id).map(|rv| rv == &ev.resource_version).unwrap_or(false) {
                counter!("ingest_duplicates_total", 1u64);
                return Outcome::Duplicate;
            }
        }
        if ev.minor && ev.change == ChangeKind::Update && !self.cfg.keep_minor_updates {
            counter!("ingest_minor_suppressed_total", 1u64);
            return Outcome::MinorSuppressed;
        }
        Outcome::Persisted
    }

    fn persist(&mut self, ev: &ChangeEvent) -> Outcome {
        let rec = WatchRecord {
            change: ev.change,
            minor: ev.minor,
            resource_version: ev.resource_version.clone(),
            payload: ev.payload.clone(),
        };
        if let Err(e) = self.tables.watch().put(&ev.kind, &ev.namespace, &ev.name, ev.observed_at, &rec) {
            warn!(resource = %ev.resource_key(), at = %ev.observed_at, error = %e, "write failed; dropping event");
            counter!("ingest_write_errors_total", 1u64);
            return Outcome::WriteFailed;
        }
        if let Err(e) = self.tables.record_activity(&ev.kind, &ev.namespace, &ev.name, ev.observed_at, true) {
            warn!(resource = %ev.resource_key(), error = %e, "recording activity failed");
        }
        if ev.change == ChangeKind::Delete {
            self.last_rv.remove(&(ev.kind.clone(), ev.namespace.clone(), ev.name.clone()));
        } else {
            self.remember(ev);
        }
        Outcome::Persisted
    }

    fn remember(&mut self, ev: &ChangeEvent) {
        if !ev.resource_version.is_empty() {
            self.last_rv
                .insert((ev.kind.clone(), ev.namespace.clone(), ev.name.clone()), ev.resource_version.clone());
        }
    }
}

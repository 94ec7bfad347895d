//! Kairos retention: keeps the partition set bounded by age and by bytes on disk.
//!
//! A pass runs three steps in order: age eviction, size eviction (oldest first, capped
//! per pass), then engine GC over the handles that are still open. Passes run on a
//! blocking worker; the periodic loop never starts a new pass once shutdown is requested
//! and [`RetentionManager::shutdown`] resolves only after the in-flight pass finished.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kairos_core::PartitionKey;
use kairos_persist::GcOutcome;
use kairos_store::PartitionedStore;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("invalid retention config: {0}")]
    Config(String),
    #[error("retention manager already started")]
    AlreadyStarted,
}

/// Fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    /// Time between passes.
    pub frequency: Duration,
    /// Partitions whose range ends at or before `now - max_age` are deleted.
    pub max_age: Duration,
    /// Total bytes on disk allowed across partitions. Zero disables size eviction.
    pub max_size_bytes: u64,
    /// Handed to the engine GC; fraction of reclaimable space that justifies a rewrite.
    pub discard_ratio: f64,
    /// Minimum time between engine GC runs. Zero runs GC every pass.
    pub vlog_gc_freq: Duration,
    /// Upper bound on partitions removed by size eviction in one pass.
    pub deletion_batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(30 * 60),
            max_age: Duration::from_secs(14 * 24 * 3600),
            max_size_bytes: 32 * 1024 * 1024 * 1024,
            discard_ratio: 0.99,
            vlog_gc_freq: Duration::from_secs(60),
            deletion_batch_size: 1000,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), RetentionError> {
        if self.frequency.is_zero() {
            return Err(RetentionError::Config("cleanup frequency must be positive".into()));
        }
        if !(self.discard_ratio > 0.0 && self.discard_ratio <= 1.0) {
            return Err(RetentionError::Config(format!("discard ratio must be in (0, 1] (got {})", self.discard_ratio)));
        }
        if self.deletion_batch_size == 0 {
            return Err(RetentionError::Config("deletion batch size must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub deleted_by_age: Vec<PartitionKey>,
    pub deleted_by_size: Vec<PartitionKey>,
    /// Whether the GC step ran this pass.
    pub gc_ran: bool,
    pub gc_reclaimed: usize,
    pub gc_skipped: usize,
    /// Bytes on disk across remaining partitions after the size step.
    pub remaining_bytes: u64,
    pub errors: usize,
}

impl PassReport {
    pub fn deleted(&self) -> usize {
        self.deleted_by_age.len() + self.deleted_by_size.len()
    }
}

struct Pass {
    store: Arc<PartitionedStore>,
    cfg: RetentionConfig,
    last_gc: Mutex<Option<DateTime<Utc>>>,
}

impl Pass {
    fn run(&self, now: DateTime<Utc>) -> PassReport {
        let started = Instant::now();
        let mut report = PassReport::default();
        let current = self.store.partition_for(now);
        let partitions = match self.store.list_partitions() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "listing partitions failed; skipping pass");
                report.errors += 1;
                return report;
            }
        };

        let remaining = self.evict_by_age(partitions, current, now, &mut report);
        self.evict_by_size(remaining, current, &mut report);
        if self.gc_due(now) {
            self.collect_garbage(&mut report);
            *self.last_gc.lock() = Some(now);
        }

        counter!("retention_passes_total", 1u64);
        counter!("retention_partitions_deleted_total", report.deleted() as u64);
        histogram!("retention_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            by_age = report.deleted_by_age.len(),
            by_size = report.deleted_by_size.len(),
            gc_ran = report.gc_ran,
            gc_reclaimed = report.gc_reclaimed,
            remaining_bytes = report.remaining_bytes,
            errors = report.errors,
            took_ms = started.elapsed().as_millis() as u64,
            "retention pass finished"
        );
        report
    }

    fn evict_by_age(
        &self,
        partitions: Vec<PartitionKey>,
        current: PartitionKey,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Vec<PartitionKey> {
        let dur = self.store.partition_duration();
        // An unrepresentable age means nothing is old enough.
        let cutoff = chrono::Duration::from_std(self.cfg.max_age).ok().and_then(|age| now.checked_sub_signed(age));
        let mut remaining = Vec::with_capacity(partitions.len());
        for key in partitions {
            let expired = match cutoff {
                Some(cutoff) => key != current && key.end(dur) <= cutoff,
                None => false,
            };
            if !expired {
                remaining.push(key);
                continue;
            }
            match self.store.delete_partition(key) {
                Ok(()) => {
                    debug!(partition = %key, "partition aged out");
                    report.deleted_by_age.push(key);
                }
                Err(e) => {
                    warn!(partition = %key, error = %e, "deleting aged partition failed");
                    report.errors += 1;
                    remaining.push(key);
                }
            }
        }
        remaining
    }

    fn evict_by_size(&self, remaining: Vec<PartitionKey>, current: PartitionKey, report: &mut PassReport) {
        let sized: Vec<(PartitionKey, u64)> = remaining.iter().map(|k| (*k, self.store.partition_size(*k))).collect();
        let mut total: u64 = sized.iter().map(|(_, s)| s).sum();
        let budget = self.cfg.max_size_bytes;
        let newest = remaining.last().copied();
        if budget > 0 && total > budget {
            for (key, size) in sized {
                if total <= budget || report.deleted_by_size.len() >= self.cfg.deletion_batch_size {
                    break;
                }
                if key == current || Some(key) == newest {
                    continue;
                }
                match self.store.delete_partition(key) {
                    Ok(()) => {
                        debug!(partition = %key, bytes = size, "partition evicted for size");
                        total = total.saturating_sub(size);
                        report.deleted_by_size.push(key);
                    }
                    Err(e) => {
                        warn!(partition = %key, error = %e, "deleting partition for size failed");
                        report.errors += 1;
                    }
                }
            }
            if total > budget {
                warn!(total, budget, "store still over size budget after pass");
            }
        }
        report.remaining_bytes = total;
    }

    fn gc_due(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = *self.last_gc.lock() else { return true };
        match chrono::Duration::from_std(self.cfg.vlog_gc_freq) {
            Ok(freq) => now.signed_duration_since(last) >= freq,
            Err(_) => false,
        }
    }

    fn collect_garbage(&self, report: &mut PassReport) {
        report.gc_ran = true;
        for (key, handle) in self.store.open_partitions() {
            match handle.run_value_log_gc(self.cfg.discard_ratio) {
                Ok(GcOutcome::Reclaimed { freed_pages }) => {
                    debug!(partition = %key, freed_pages, "engine gc reclaimed");
                    report.gc_reclaimed += 1;
                }
                Ok(GcOutcome::NoGcNeeded) => report.gc_skipped += 1,
                // Deleted between listing and GC.
                Err(e) if e.is_closed() => {}
                Err(e) => {
                    warn!(partition = %key, error = %e, "engine gc failed");
                    report.errors += 1;
                }
            }
        }
    }
}

pub struct RetentionManager {
    pass: Arc<Pass>,
    state_tx: watch::Sender<RetentionState>,
    state_rx: watch::Receiver<RetentionState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RetentionManager {
    pub fn new(store: Arc<PartitionedStore>, cfg: RetentionConfig) -> Result<Self, RetentionError> {
        cfg.validate()?;
        let (state_tx, state_rx) = watch::channel(RetentionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            pass: Arc::new(Pass { store, cfg, last_gc: Mutex::new(None) }),
            state_tx,
            state_rx,
            shutdown_tx,
            task: None,
        })
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.pass.cfg
    }

    pub fn state(&self) -> RetentionState {
        *self.state_rx.borrow()
    }

    /// One pass against the wall clock. Blocks on disk and engine work.
    pub fn run_pass(&self) -> PassReport {
        self.pass.run(Utc::now())
    }

    /// One pass as if the time were `now`.
    pub fn run_pass_at(&self, now: DateTime<Utc>) -> PassReport {
        self.pass.run(now)
    }

    /// Spawn the periodic loop. The first pass runs immediately.
    pub fn start(&mut self) -> Result<(), RetentionError> {
        if self.state() != RetentionState::Idle {
            return Err(RetentionError::AlreadyStarted);
        }
        let pass = Arc::clone(&self.pass);
        let state_tx = self.state_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = state_tx.send(RetentionState::Running);
        info!(frequency_secs = pass.cfg.frequency.as_secs(), "retention loop started");
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pass.cfg.frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let p = Arc::clone(&pass);
                        if let Err(e) = tokio::task::spawn_blocking(move || p.run(Utc::now())).await {
                            warn!(error = %e, "retention pass ended abnormally");
                        }
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            let _ = state_tx.send(RetentionState::Stopped);
            info!("retention loop stopped");
        }));
        Ok(())
    }

    /// Let the in-flight pass finish, start no more, and resolve once Stopped.
    pub async fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            let _ = self.state_tx.send(RetentionState::Stopped);
            return;
        };
        let _ = self.state_tx.send(RetentionState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = task.await {
            warn!(error = %e, "retention loop ended abnormally");
        }
        let _ = self.state_tx.send(RetentionState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_values() {
        let ok = RetentionConfig::default();
        assert!(ok.validate().is_ok());
        assert!(RetentionConfig { discard_ratio: 0.0, ..ok.clone() }.validate().is_err());
        assert!(RetentionConfig { discard_ratio: 1.5, ..ok.clone() }.validate().is_err());
        assert!(RetentionConfig { deletion_batch_size: 0, ..ok.clone() }.validate().is_err());
        assert!(RetentionConfig { frequency: Duration::ZERO, ..ok }.validate().is_err());
    }

    #[test]
    fn report_counts_both_steps() {
        let r = PassReport {
            deleted_by_age: vec![PartitionKey::from_start_secs(0)],
            deleted_by_size: vec![PartitionKey::from_start_secs(3600), PartitionKey::from_start_secs(7200)],
            ..Default::default()
        };
        assert_eq!(r.deleted(), 3);
    }
}

//! Kairos ingestion: drains the bounded event channel into the typed tables.
//!
//! Lifecycle is `Idle -> Running -> Draining -> Stopped`. The channel owner closes the
//! channel (drops every sender) to request shutdown; the processor finishes whatever is
//! buffered and stops. [`Processor::wait`] resolving means the store will not change
//! further because of ingestion.

#![forbid(unsafe_code)]

use std::time::Duration;

use kairos_core::ChangeEvent;
use kairos_tables::Tables;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod pipeline;
pub mod recorder;

pub use pipeline::{Outcome, Pipeline};
pub use recorder::{play_file, Recorder};

/// Reference capacity for the inbound event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Bounded event channel. Senders wait when it is full.
pub fn event_channel(cap: usize) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
    mpsc::channel(cap.max(1))
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Persist updates classified as minor. When false they only count as no-change activity.
    pub keep_minor_updates: bool,
    /// Events observed earlier than `now - max_lookback` are dropped; retention would delete them.
    pub max_lookback: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { keep_minor_updates: false, max_lookback: Duration::from_secs(14 * 24 * 3600) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    pub received: u64,
    pub persisted: u64,
    pub minor_suppressed: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub write_errors: u64,
}

/// Blocking consume loop. Publishes `Draining` once the channel is closed, even when
/// nothing was left buffered, then `Stopped`.
fn run_worker(
    mut rx: mpsc::Receiver<ChangeEvent>,
    mut pipeline: Pipeline,
    mirror: Option<mpsc::Sender<ChangeEvent>>,
    mut publish: impl FnMut(ProcessorState),
) -> ProcessorStats {
    let mut draining = false;
    while let Some(ev) = rx.blocking_recv() {
        if !draining && rx.is_closed() {
            info!(buffered = rx.len(), "event channel closed; draining");
            draining = true;
            publish(ProcessorState::Draining);
        }
        if let Some(m) = &mirror {
            if m.blocking_send(ev.clone()).is_err() {
                warn!("mirror closed; event not mirrored");
            }
        }
        pipeline.handle(ev);
    }
    if !draining {
        info!("event channel closed; nothing buffered");
        publish(ProcessorState::Draining);
    }
    let stats = pipeline.into_stats();
    publish(ProcessorState::Stopped);
    info!(
        received = stats.received,
        persisted = stats.persisted,
        minor_suppressed = stats.minor_suppressed,
        duplicates = stats.duplicates,
        stale = stats.stale,
        write_errors = stats.write_errors,
        "processor stopped"
    );
    stats
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor already started")]
    AlreadyStarted,
}

pub struct Processor {
    rx: Option<mpsc::Receiver<ChangeEvent>>,
    pipeline: Option<Pipeline>,
    mirror: Option<mpsc::Sender<ChangeEvent>>,
    state_tx: watch::Sender<ProcessorState>,
    state_rx: watch::Receiver<ProcessorState>,
    task: Option<JoinHandle<ProcessorStats>>,
    stats: Option<ProcessorStats>,
}

impl Processor {
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, tables: Tables, cfg: ProcessorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ProcessorState::Idle);
        Self {
            rx: Some(rx),
            pipeline: Some(Pipeline::new(tables, cfg)),
            mirror: None,
            state_tx,
            state_rx,
            task: None,
            stats: None,
        }
    }

    /// Forward every received event to `mirror` (e.g. a [`Recorder`]).
    pub fn with_mirror(mut self, mirror: mpsc::Sender<ChangeEvent>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn state(&self) -> ProcessorState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state_rx.clone()
    }

    /// Begin consuming the channel on a dedicated blocking worker (the engine is synchronous).
    pub fn start(&mut self) -> Result<(), ProcessorError> {
        let (Some(rx), Some(pipeline)) = (self.rx.take(), self.pipeline.take()) else {
            return Err(ProcessorError::AlreadyStarted);
        };
        let mirror = self.mirror.take();
        let state_tx = self.state_tx.clone();
        state_tx.send_replace(ProcessorState::Running);
        info!("processor started");
        self.task = Some(tokio::task::spawn_blocking(move || {
            run_worker(rx, pipeline, mirror, |st| {
                let _ = state_tx.send(st);
            })
        }));
        Ok(())
    }

    /// Resolve once the processor is Stopped. Returns the final counters.
    /// A processor that was never started returns empty counters immediately.
    pub async fn wait(&mut self) -> ProcessorStats {
        if let Some(stats) = &self.stats {
            return stats.clone();
        }
        let Some(task) = self.task.take() else { return ProcessorStats::default() };
        let stats = match task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "processor worker ended abnormally");
                let _ = self.state_tx.send(ProcessorState::Stopped);
                ProcessorStats::default()
            }
        };
        self.stats = Some(stats.clone());
        stats
    }
}

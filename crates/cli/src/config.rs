//! `kairosctl` configuration: YAML file with defaults, overridden by flags and env.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kairos_ingest::{ProcessorConfig, DEFAULT_CHANNEL_CAPACITY};
use kairos_persist::EngineTuning;
use kairos_retention::RetentionConfig;
use kairos_store::StoreConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KairosConfig {
    /// Parent of the per-context store directories.
    pub store_root: PathBuf,
    /// Kube context; the kubeconfig's current context when unset.
    pub context: Option<String>,
    pub partition_duration_secs: u64,
    /// Oldest data kept and queried. Also the retention age limit.
    pub max_lookback_secs: u64,
    pub channel_capacity: usize,
    pub keep_minor_updates: bool,
    /// GVK keys to watch (`v1/Pod`, `apps/v1/Deployment`).
    pub kinds: Vec<String>,
    pub namespace: Option<String>,
    pub cleanup_frequency_secs: u64,
    /// Disk budget across partitions; 0 disables size eviction.
    pub max_disk_bytes: u64,
    pub discard_ratio: f64,
    pub vlog_gc_freq_secs: u64,
    pub deletion_batch_size: usize,
    /// Skip the retention loop while recording; nothing is evicted or collected.
    pub disable_retention: bool,
    /// Also watch every custom resource defined in the cluster at startup.
    pub watch_crds: bool,
    /// Backup (a copy of a context's store directory) merged in before ingestion starts.
    pub restore_from: Option<PathBuf>,
    pub engine: EngineTuning,
}

impl Default for KairosConfig {
    fn default() -> Self {
        let retention = RetentionConfig::default();
        Self {
            store_root: PathBuf::from("./data"),
            context: None,
            partition_duration_secs: 3600,
            max_lookback_secs: 14 * 24 * 3600,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            keep_minor_updates: false,
            kinds: kairos_kubehub::DEFAULT_KINDS.iter().map(|s| s.to_string()).collect(),
            namespace: None,
            cleanup_frequency_secs: retention.frequency.as_secs(),
            max_disk_bytes: retention.max_size_bytes,
            discard_ratio: retention.discard_ratio,
            vlog_gc_freq_secs: retention.vlog_gc_freq.as_secs(),
            deletion_batch_size: retention.deletion_batch_size,
            disable_retention: false,
            watch_crds: false,
            restore_from: None,
            engine: EngineTuning::default(),
        }
    }
}

impl KairosConfig {
    /// Defaults, or the file at `path` layered over them.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else { return Ok(Self::default()) };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: &str| Err(ConfigError::Invalid(m.to_string()));
        if self.store_root.as_os_str().is_empty() {
            return invalid("store_root is empty");
        }
        if self.partition_duration_secs < 60 {
            return invalid("partition_duration_secs must be at least 60");
        }
        if self.max_lookback_secs == 0 {
            return invalid("max_lookback_secs must be positive");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be positive");
        }
        if !(self.discard_ratio > 0.0 && self.discard_ratio <= 1.0) {
            return invalid("discard_ratio must be in (0, 1]");
        }
        if self.deletion_batch_size == 0 {
            return invalid("deletion_batch_size must be at least 1");
        }
        if self.cleanup_frequency_secs == 0 {
            return invalid("cleanup_frequency_secs must be positive");
        }
        if self.engine.max_wal_bytes <= 0 || self.engine.cache_size_kib <= 0 {
            return invalid("engine sizes must be positive");
        }
        if let Some(backup) = &self.restore_from {
            if !backup.is_dir() {
                return Err(ConfigError::Invalid(format!("restore_from {} is not a directory", backup.display())));
            }
        }
        Ok(())
    }

    pub fn max_lookback(&self) -> Duration {
        Duration::from_secs(self.max_lookback_secs)
    }

    pub fn store_config(&self, context: &str) -> StoreConfig {
        StoreConfig {
            partition_duration: Duration::from_secs(self.partition_duration_secs),
            tuning: self.engine.clone(),
            ..StoreConfig::for_context(&self.store_root, context)
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig { keep_minor_updates: self.keep_minor_updates, max_lookback: self.max_lookback() }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            frequency: Duration::from_secs(self.cleanup_frequency_secs),
            max_age: self.max_lookback(),
            max_size_bytes: self.max_disk_bytes,
            discard_ratio: self.discard_ratio,
            vlog_gc_freq: Duration::from_secs(self.vlog_gc_freq_secs),
            deletion_batch_size: self.deletion_batch_size,
        }
    }
}

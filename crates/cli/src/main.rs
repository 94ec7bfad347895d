use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kairos_api::{HistoryResponse, QueryParams, QueryRegistry, ResourcesResponse};
use kairos_ingest::{event_channel, play_file, Processor, Recorder};
use kairos_retention::RetentionManager;
use kairos_store::PartitionedStore;
use kairos_tables::Tables;
use tokio::signal;
use tracing::{info, warn};

mod config;

use config::KairosConfig;

#[derive(Parser, Debug)]
#[command(name = "kairosctl", version, about = "Kairos: record and query cluster resource history")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// YAML config file
    #[arg(long, global = true, env = "KAIROS_CONFIG")]
    config: Option<PathBuf>,

    /// Store root (one directory per kube context underneath)
    #[arg(long = "store-root", global = true, env = "KAIROS_STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// Kube context (default: kubeconfig current context)
    #[arg(long, global = true, env = "KAIROS_CONTEXT")]
    context: Option<String>,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug, Default)]
struct WindowArgs {
    /// Seconds back from the end of the window
    #[arg(long)]
    lookback: Option<u64>,
    /// Window start (RFC 3339 or unix seconds)
    #[arg(long)]
    start: Option<String>,
    /// Window end (RFC 3339 or unix seconds); default now
    #[arg(long)]
    end: Option<String>,
}

impl WindowArgs {
    fn params(&self) -> QueryParams {
        let mut p = QueryParams::new();
        if let Some(l) = self.lookback {
            p.insert("lookback", l.to_string());
        }
        if let Some(s) = &self.start {
            p.insert("start_time", s.clone());
        }
        if let Some(e) = &self.end {
            p.insert("end_time", e.clone());
        }
        p
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record resource changes into the store until interrupted
    Record {
        /// GVK keys to watch, comma separated (e.g. "v1/Pod,apps/v1/Deployment")
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<String>,
        /// Also append every received event to this JSONL file
        #[arg(long = "record-file", env = "KAIROS_RECORD_FILE")]
        record_file: Option<PathBuf>,
        /// Replay a JSONL file instead of watching a cluster
        #[arg(long = "playback-file")]
        playback_file: Option<PathBuf>,
        /// Persist updates that only touch volatile fields
        #[arg(long = "keep-minor", action = ArgAction::SetTrue)]
        keep_minor: bool,
        /// Event channel capacity
        #[arg(long = "channel-capacity", env = "KAIROS_CHANNEL_CAPACITY")]
        channel_capacity: Option<usize>,
        /// Merge this backup (a copied context store directory) in before recording
        #[arg(long = "restore-from", env = "KAIROS_RESTORE_FROM")]
        restore_from: Option<PathBuf>,
        /// Also watch every custom resource defined in the cluster
        #[arg(long = "watch-crds", action = ArgAction::SetTrue)]
        watch_crds: bool,
        /// Do not run retention while recording
        #[arg(long = "no-retention", action = ArgAction::SetTrue)]
        no_retention: bool,
    },
    /// Show the recorded history of one object
    History {
        /// Kind, e.g. "Pod"
        kind: String,
        name: String,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// List objects of a kind seen in the window
    Ls {
        kind: String,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Run a named query and print its JSON
    Query {
        name: String,
        /// Query parameter, repeatable
        #[arg(short = 'p', long = "param", value_parser = parse_kv)]
        params: Vec<(String, String)>,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// List partitions on disk with their sizes
    Partitions,
    /// Run one retention pass now
    Gc,
}

fn parse_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

fn init_tracing() {
    let env = std::env::var("KAIROS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAIROS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAIROS_METRICS_ADDR; expected host:port");
        }
    }
}

fn request_id() -> String {
    format!("cli-{}-{}", std::process::id(), chrono::Utc::now().timestamp_millis())
}

/// Context from flag/config, else the kubeconfig's current one.
fn resolve_context(cfg: &KairosConfig) -> Result<String> {
    match &cfg.context {
        Some(c) => Ok(c.clone()),
        None => kairos_kubehub::current_context(),
    }
}

fn open_tables(cfg: &KairosConfig) -> Result<Tables> {
    let context = resolve_context(cfg)?;
    let store = PartitionedStore::open(cfg.store_config(&context)).context("opening store")?;
    Ok(Tables::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut cfg = KairosConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.store_root.clone() {
        cfg.store_root = root;
    }
    if cli.context.is_some() {
        cfg.context = cli.context.clone();
    }
    if cli.namespace.is_some() {
        cfg.namespace = cli.namespace.clone();
    }

    match cli.command {
        Commands::Record {
            kinds,
            record_file,
            playback_file,
            keep_minor,
            channel_capacity,
            restore_from,
            watch_crds,
            no_retention,
        } => {
            if !kinds.is_empty() {
                cfg.kinds = kinds;
            }
            if keep_minor {
                cfg.keep_minor_updates = true;
            }
            if let Some(cap) = channel_capacity {
                cfg.channel_capacity = cap;
            }
            if restore_from.is_some() {
                cfg.restore_from = restore_from;
            }
            cfg.watch_crds |= watch_crds;
            cfg.disable_retention |= no_retention;
            cfg.validate()?;
            record(cfg, record_file, playback_file).await?;
        }
        Commands::History { kind, name, window } => {
            cfg.validate()?;
            let tables = open_tables(&cfg)?;
            let mut params = window.params().with("kind", kind).with("name", name);
            if let Some(ns) = &cfg.namespace {
                params.insert("namespace", ns.clone());
            }
            let bytes = QueryRegistry::with_builtins()
                .run("history", &params, &tables, cfg.max_lookback(), &request_id())?;
            match cli.output {
                Output::Json => println!("{}", String::from_utf8_lossy(&bytes)),
                Output::Human => {
                    let resp: HistoryResponse = serde_json::from_slice(&bytes)?;
                    for e in &resp.entries {
                        let minor = if e.minor { " (minor)" } else { "" };
                        println!("{}  {:<6}  rv={}{}", e.at.to_rfc3339(), e.change.as_str(), e.resource_version, minor);
                    }
                    if resp.entries.is_empty() {
                        println!("no history in window");
                    }
                    if resp.meta.partial {
                        eprintln!("warning: some partitions were unreadable; history is partial");
                    }
                }
            }
            tables.store().close();
        }
        Commands::Ls { kind, window } => {
            cfg.validate()?;
            let tables = open_tables(&cfg)?;
            let mut params = window.params().with("kind", kind);
            if let Some(ns) = &cfg.namespace {
                params.insert("namespace", ns.clone());
            }
            let bytes = QueryRegistry::with_builtins()
                .run("resources", &params, &tables, cfg.max_lookback(), &request_id())?;
            match cli.output {
                Output::Json => println!("{}", String::from_utf8_lossy(&bytes)),
                Output::Human => {
                    let resp: ResourcesResponse = serde_json::from_slice(&bytes)?;
                    for n in &resp.names {
                        println!("{}", n);
                    }
                    if resp.meta.partial {
                        eprintln!("warning: some partitions were unreadable; list is partial");
                    }
                }
            }
            tables.store().close();
        }
        Commands::Query { name, params, window } => {
            cfg.validate()?;
            let tables = open_tables(&cfg)?;
            let mut qp = window.params();
            if let Some(ns) = &cfg.namespace {
                qp.insert("namespace", ns.clone());
            }
            for (k, v) in params {
                qp.insert(k, v);
            }
            let registry = QueryRegistry::with_builtins();
            let bytes = registry
                .run(&name, &qp, &tables, cfg.max_lookback(), &request_id())?;
            match cli.output {
                Output::Json => println!("{}", String::from_utf8_lossy(&bytes)),
                Output::Human => {
                    let v: serde_json::Value = serde_json::from_slice(&bytes)?;
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
            tables.store().close();
        }
        Commands::Partitions => {
            cfg.validate()?;
            let context = resolve_context(&cfg)?;
            let store = PartitionedStore::open(cfg.store_config(&context)).context("opening store")?;
            let parts = store.list_partitions()?;
            match cli.output {
                Output::Human => {
                    let mut total = 0u64;
                    for key in &parts {
                        let bytes = store.partition_size(*key);
                        total += bytes;
                        println!("{}  {:>12}", key, bytes);
                    }
                    println!("{} partitions, {} bytes", parts.len(), total);
                }
                Output::Json => {
                    let rows: Vec<_> = parts
                        .iter()
                        .map(|k| serde_json::json!({"partition": k.to_string(), "start": k.start(), "bytes": store.partition_size(*k)}))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Gc => {
            cfg.validate()?;
            let context = resolve_context(&cfg)?;
            let store = PartitionedStore::open(cfg.store_config(&context)).context("opening store")?;
            let mgr = RetentionManager::new(store.clone(), cfg.retention_config())?;
            let report = tokio::task::spawn_blocking(move || mgr.run_pass()).await?;
            match cli.output {
                Output::Human => {
                    println!(
                        "deleted {} by age, {} by size; gc reclaimed {} of {} open partitions; {} bytes remain; {} errors",
                        report.deleted_by_age.len(),
                        report.deleted_by_size.len(),
                        report.gc_reclaimed,
                        report.gc_reclaimed + report.gc_skipped,
                        report.remaining_bytes,
                        report.errors
                    );
                }
                Output::Json => {
                    let v = serde_json::json!({
                        "deleted_by_age": report.deleted_by_age.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                        "deleted_by_size": report.deleted_by_size.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                        "gc_ran": report.gc_ran,
                        "gc_reclaimed": report.gc_reclaimed,
                        "gc_skipped": report.gc_skipped,
                        "remaining_bytes": report.remaining_bytes,
                        "errors": report.errors,
                    });
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
            store.close();
        }
    }
    Ok(())
}

/// Open the context's store and merge the configured backup into it. Ingestion has not
/// started yet, so the restored data is in place before the first event lands.
async fn open_for_recording(cfg: &KairosConfig, context: &str) -> Result<Arc<PartitionedStore>> {
    let store = PartitionedStore::open(cfg.store_config(context)).context("opening store")?;
    if let Some(backup) = cfg.restore_from.clone() {
        info!(backup = %backup.display(), context, "restoring backup");
        let target = store.clone();
        let report = tokio::task::spawn_blocking(move || target.restore_from(&backup))
            .await?
            .context("restoring backup")?;
        info!(partitions = report.partitions, records = report.records, skipped = report.skipped, "backup restored");
    }
    Ok(store)
}

enum Source {
    Cluster(kube::Client),
    Playback(PathBuf),
}

/// Run the pipeline until interrupted (or the playback file is consumed), then shut down
/// producer, channel, processor, recorder and retention, in that order.
async fn record(cfg: KairosConfig, record_file: Option<PathBuf>, playback_file: Option<PathBuf>) -> Result<()> {
    let (source, context) = match playback_file {
        Some(path) => (Source::Playback(path), cfg.context.clone().unwrap_or_else(|| "playback".to_string())),
        None => {
            let (client, name) = kairos_kubehub::client_for_context(cfg.context.as_deref()).await?;
            (Source::Cluster(client), name)
        }
    };
    let store = open_for_recording(&cfg, &context).await?;
    let tables = Tables::new(store.clone());

    let (tx, rx) = event_channel(cfg.channel_capacity);
    let mut processor = Processor::new(rx, tables, cfg.processor_config());
    let recorder = match &record_file {
        Some(path) => {
            let (rec, mirror) = Recorder::start(path, cfg.channel_capacity).await?;
            processor = processor.with_mirror(mirror);
            Some(rec)
        }
        None => None,
    };
    processor.start()?;
    let mut retention = if cfg.disable_retention {
        info!("retention disabled");
        None
    } else {
        let mut mgr = RetentionManager::new(store.clone(), cfg.retention_config())?;
        mgr.start()?;
        Some(mgr)
    };
    info!(context = %context, root = %store.config().root_path.display(), "recording");

    match source {
        Source::Playback(path) => {
            // The task owns the only sender; the channel closes when it ends.
            let mut play = tokio::spawn(async move { play_file(&path, &tx).await });
            tokio::select! {
                res = &mut play => match res {
                    Ok(Ok(n)) => info!(events = n, "playback complete"),
                    Ok(Err(e)) => warn!(error = %e, "playback failed"),
                    Err(e) => warn!(error = %e, "playback task ended abnormally"),
                },
                _ = signal::ctrl_c() => {
                    info!("interrupt; stopping playback");
                    play.abort();
                    let _ = play.await;
                }
            }
        }
        Source::Cluster(client) => {
            let watches =
                kairos_kubehub::WatchSet::start(client, &cfg.kinds, cfg.namespace.as_deref(), cfg.watch_crds, tx.clone())
                    .await?;
            signal::ctrl_c().await.context("waiting for interrupt")?;
            info!("interrupt; stopping watchers");
            watches.stop().await;
            drop(tx);
        }
    }

    let stats = processor.wait().await;
    info!(
        received = stats.received,
        persisted = stats.persisted,
        minor_suppressed = stats.minor_suppressed,
        duplicates = stats.duplicates,
        write_errors = stats.write_errors,
        "ingestion drained"
    );
    if let Some(rec) = recorder {
        rec.close().await;
    }
    if let Some(mgr) = retention.as_mut() {
        mgr.shutdown().await;
    }
    store.close();
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn record_flags_parse() {
        let cli = Cli::try_parse_from([
            "kairosctl",
            "record",
            "--restore-from",
            "/backups/prod",
            "--watch-crds",
            "--no-retention",
        ])
        .unwrap();
        match cli.command {
            Commands::Record { restore_from, watch_crds, no_retention, .. } => {
                assert_eq!(restore_from, Some(PathBuf::from("/backups/prod")));
                assert!(watch_crds);
                assert!(no_retention);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backup_is_restored_before_recording() {
        let dir = TempDir::new().unwrap();
        let at = ts("2024-03-01T10:05:00Z");
        let backup = {
            let cfg = KairosConfig { store_root: dir.path().join("old-root"), ..KairosConfig::default() };
            let old = PartitionedStore::open(cfg.store_config("prod")).unwrap();
            old.write(at, b"pod/a", b"kept").unwrap();
            old.close();
            old.config().root_path.clone()
        };
        let cfg = KairosConfig {
            store_root: dir.path().join("root"),
            restore_from: Some(backup),
            ..KairosConfig::default()
        };
        cfg.validate().unwrap();
        let store = open_for_recording(&cfg, "prod").await.unwrap();
        assert_eq!(store.get(at, b"pod/a").unwrap(), Some(b"kept".to_vec()));
        assert_eq!(store.config().root_path, dir.path().join("root").join("prod"));
        store.close();
    }
}

//! Kairos query API (in-process).
//!
//! Queries are named functions over the typed tables. A [`QueryRegistry`] is built once
//! at startup, is read-only afterwards, and is passed by reference to whoever serves
//! requests. Every query receives an already-clamped time window.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kairos_tables::Tables;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod builtins;

pub use builtins::{HistoryEntry, HistoryResponse, Overlay, ResourcesResponse, TimelineRoot, TimelineRow, ViewOptions};

/// Errors suitable for returning to a front end.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueryError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Request parameters, as a front end would pass them (string keys and values).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, String>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Empty values read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &str) -> QueryResult<&str> {
        self.get(key).ok_or_else(|| QueryError::Validation(format!("missing parameter `{key}`")))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Metadata attached to every built-in response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Some partition in the window could not be read.
    pub partial: bool,
    /// Records dropped because they failed to decode.
    pub skipped: usize,
    pub request_id: String,
}

/// Parse RFC 3339 or integer unix seconds.
pub fn parse_time(raw: &str) -> QueryResult<DateTime<Utc>> {
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| QueryError::Validation(format!("timestamp out of range: {raw}")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueryError::Validation(format!("bad time `{raw}`: {e}")))
}

/// Window for a request: `end_time` (default now), then `start_time` or `end - lookback`
/// (lookback in seconds, default `max_lookback`). The start never reaches further back
/// than `end - max_lookback`.
pub fn compute_time_range(
    params: &QueryParams,
    now: DateTime<Utc>,
    max_lookback: Duration,
) -> QueryResult<(DateTime<Utc>, DateTime<Utc>)> {
    let max = chrono::Duration::from_std(max_lookback)
        .map_err(|_| QueryError::Validation("max lookback out of range".into()))?;
    let end = params.get("end_time").map(parse_time).transpose()?.unwrap_or(now);
    let start = match params.get("start_time") {
        Some(raw) => parse_time(raw)?,
        None => {
            let lookback = match params.get("lookback") {
                Some(raw) => {
                    let secs: i64 = raw
                        .parse()
                        .map_err(|_| QueryError::Validation(format!("lookback must be whole seconds (got `{raw}`)")))?;
                    if secs < 0 {
                        return Err(QueryError::Validation("lookback must not be negative".into()));
                    }
                    // Anything past the cap is clamped below anyway.
                    chrono::Duration::seconds(secs.min(max.num_seconds()))
                }
                None => max,
            };
            end.checked_sub_signed(lookback).unwrap_or(DateTime::<Utc>::MIN_UTC)
        }
    };
    if start > end {
        return Err(QueryError::Validation(format!("start {start} is after end {end}")));
    }
    let floor = end.checked_sub_signed(max).unwrap_or(DateTime::<Utc>::MIN_UTC);
    Ok((start.max(floor), end))
}

/// Query function: params, tables, window, request id. Returns JSON bytes.
pub type QueryFn =
    Arc<dyn Fn(&QueryParams, &Tables, DateTime<Utc>, DateTime<Utc>, &str) -> QueryResult<Vec<u8>> + Send + Sync>;

/// Named queries. Build at startup, then share by reference.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    queries: BTreeMap<String, QueryFn>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry").field("queries", &self.names()).finish()
    }
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `history`, `resources` and `timeline`.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.queries.insert("history".into(), Arc::new(builtins::history));
        r.queries.insert("resources".into(), Arc::new(builtins::resources));
        r.queries.insert("timeline".into(), Arc::new(builtins::timeline));
        r
    }

    /// Add a query. Names are unique.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> QueryResult<()>
    where
        F: Fn(&QueryParams, &Tables, DateTime<Utc>, DateTime<Utc>, &str) -> QueryResult<Vec<u8>> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(QueryError::Validation("query name is empty".into()));
        }
        if self.queries.contains_key(&name) {
            return Err(QueryError::Validation(format!("query already registered: {name}")));
        }
        self.queries.insert(name, Arc::new(f));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&QueryFn> {
        self.queries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.queries.keys().map(String::as_str).collect()
    }

    pub fn run(
        &self,
        name: &str,
        params: &QueryParams,
        tables: &Tables,
        max_lookback: Duration,
        request_id: &str,
    ) -> QueryResult<Vec<u8>> {
        self.run_at(name, params, tables, max_lookback, request_id, Utc::now())
    }

    /// Resolve the window against `now`, then run the named query.
    pub fn run_at(
        &self,
        name: &str,
        params: &QueryParams,
        tables: &Tables,
        max_lookback: Duration,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> QueryResult<Vec<u8>> {
        let started = Instant::now();
        let (start, end) = compute_time_range(params, now, max_lookback)?;
        let f = self.get(name).ok_or_else(|| QueryError::NotFound(format!("query not found: {name}")))?;
        let out = f(params, tables, start, end, request_id);
        let took_ms = started.elapsed().as_millis() as u64;
        histogram!("query_ms", took_ms as f64);
        match &out {
            Ok(bytes) => {
                counter!("queries_total", 1u64);
                info!(query = name, request_id, %start, %end, bytes = bytes.len(), took_ms, "query");
            }
            Err(e) => {
                counter!("query_errors_total", 1u64);
                warn!(query = name, request_id, error = %e, took_ms, "query failed");
            }
        }
        out
    }
}

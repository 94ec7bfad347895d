use chrono::{DateTime, Utc};
use kairos_core::{ChangeKind, PartitionKey};
use kairos_tables::Tables;
use serde::{Deserialize, Serialize};

use crate::{QueryError, QueryParams, QueryResult, ResponseMeta};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub change: ChangeKind,
    pub minor: bool,
    pub resource_version: String,
    /// Stored object; raw string when it is not valid JSON.
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryResponse {
    pub meta: ResponseMeta,
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcesResponse {
    pub meta: ResponseMeta,
    pub kind: String,
    pub namespace: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewOptions {
    pub sort: String,
}

/// Labelled span drawn over a timeline row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Overlay {
    pub text: String,
    /// Unix seconds.
    pub start_date: i64,
    /// Seconds.
    pub duration: i64,
}

/// One resource on the timeline: when it changed and when it was seen unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineRow {
    pub text: String,
    pub kind: String,
    pub namespace: String,
    /// Window start, unix seconds.
    pub start_date: i64,
    /// Window length in seconds.
    pub duration: i64,
    /// Always present in the payload; the built-in timeline emits none.
    #[serde(default)]
    pub overlays: Vec<Overlay>,
    pub changed_at: Vec<i64>,
    pub no_change_at: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineRoot {
    pub meta: ResponseMeta,
    pub view_opt: ViewOptions,
    pub rows: Vec<TimelineRow>,
}

fn to_json<T: Serialize>(v: &T) -> QueryResult<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| QueryError::Internal(format!("encoding response: {e}")))
}

/// Params: `kind`, `name`, optional `namespace`.
pub(crate) fn history(
    params: &QueryParams,
    tables: &Tables,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    request_id: &str,
) -> QueryResult<Vec<u8>> {
    let kind = params.required("kind")?;
    let name = params.required("name")?;
    let namespace = params.get("namespace").unwrap_or("");
    let h = tables.watch().get_history(kind, namespace, name, start, end).collect_result();
    let entries = h
        .entries
        .into_iter()
        .map(|(at, rec)| HistoryEntry {
            at,
            change: rec.change,
            minor: rec.minor,
            resource_version: rec.resource_version,
            payload: serde_json::from_str(&rec.payload).unwrap_or(serde_json::Value::String(rec.payload)),
        })
        .collect();
    to_json(&HistoryResponse {
        meta: ResponseMeta { partial: h.partial, skipped: h.skipped, request_id: request_id.to_string() },
        entries,
    })
}

/// Params: `kind`, optional `namespace`.
pub(crate) fn resources(
    params: &QueryParams,
    tables: &Tables,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    request_id: &str,
) -> QueryResult<Vec<u8>> {
    let kind = params.required("kind")?;
    let namespace = params.get("namespace").unwrap_or("");
    let list = tables.watch().list_resources(kind, namespace, start, end);
    to_json(&ResourcesResponse {
        meta: ResponseMeta { partial: list.partial, skipped: list.skipped, request_id: request_id.to_string() },
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        names: list.names.into_iter().collect(),
    })
}

/// Params: `kind`, optional `namespace`, optional `sort` (default `MostEvents`).
/// One row per resource seen in the window, rows with the most changes first.
pub(crate) fn timeline(
    params: &QueryParams,
    tables: &Tables,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    request_id: &str,
) -> QueryResult<Vec<u8>> {
    let kind = params.required("kind")?;
    let namespace = params.get("namespace").unwrap_or("");
    let sort = params.get("sort").unwrap_or("MostEvents");
    let list = tables.watch().list_resources(kind, namespace, start, end);
    let mut meta = ResponseMeta { partial: list.partial, skipped: list.skipped, request_id: request_id.to_string() };
    // Activity records sit at their partition start, which may precede the window.
    let bucket_start = PartitionKey::for_time(start, tables.store().partition_duration()).start();
    let in_window = |t: &DateTime<Utc>| *t >= start && *t <= end;

    let mut rows = Vec::with_capacity(list.names.len());
    for name in list.names {
        let act = tables.activity().get_history(kind, namespace, &name, bucket_start, end).collect_result();
        meta.partial |= act.partial;
        meta.skipped += act.skipped;
        let mut row = TimelineRow {
            text: name,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            start_date: start.timestamp(),
            duration: (end - start).num_seconds(),
            overlays: Vec::new(),
            changed_at: Vec::new(),
            no_change_at: Vec::new(),
        };
        for (_, a) in act.entries {
            row.changed_at.extend(a.changed_at.iter().filter(|t| in_window(t)).map(DateTime::timestamp));
            row.no_change_at.extend(a.no_change_at.iter().filter(|t| in_window(t)).map(DateTime::timestamp));
        }
        row.changed_at.sort_unstable();
        row.no_change_at.sort_unstable();
        rows.push(row);
    }
    if sort == "MostEvents" {
        rows.sort_by(|a, b| b.changed_at.len().cmp(&a.changed_at.len()).then_with(|| a.text.cmp(&b.text)));
    }
    to_json(&TimelineRoot { meta, view_opt: ViewOptions { sort: sort.to_string() }, rows })
}

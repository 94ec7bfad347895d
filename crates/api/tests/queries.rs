#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kairos_api::{HistoryResponse, QueryError, QueryParams, QueryRegistry, ResourcesResponse, TimelineRoot};
use kairos_core::ChangeKind;
use kairos_store::{PartitionedStore, StoreConfig};
use kairos_tables::{Tables, WatchRecord};
use tempfile::TempDir;

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn rec(rv: &str) -> WatchRecord {
    WatchRecord { change: ChangeKind::Update, minor: false, resource_version: rv.into(), payload: format!("{{\"rv\":\"{rv}\"}}") }
}

fn seeded(dir: &TempDir) -> Tables {
    let tables = Tables::new(PartitionedStore::open(StoreConfig::for_context(dir.path(), "ctx")).unwrap());
    let t0 = ts("2024-03-01T10:00:00Z");
    for (i, name) in ["web-0", "web-0", "web-0", "web-1"].iter().enumerate() {
        let at = t0 + ChronoDuration::minutes(20 * i as i64);
        tables.watch().put("Pod", "default", name, at, &rec(&i.to_string())).unwrap();
        tables.record_activity("Pod", "default", name, at, true).unwrap();
    }
    tables.record_activity("Pod", "default", "web-1", t0 + ChronoDuration::minutes(70), false).unwrap();
    tables
}

fn window() -> QueryParams {
    QueryParams::new().with("start_time", "2024-03-01T09:30:00Z").with("end_time", "2024-03-01T12:00:00Z")
}

fn now() -> DateTime<Utc> {
    ts("2024-03-02T00:00:00Z")
}

#[test]
fn history_query_returns_entries_in_order() {
    let dir = TempDir::new().unwrap();
    let tables = seeded(&dir);
    let reg = QueryRegistry::with_builtins();
    let params = window().with("kind", "Pod").with("namespace", "default").with("name", "web-0");
    let bytes = reg.run_at("history", &params, &tables, WEEK, "req-1", now()).unwrap();
    let resp: HistoryResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(!resp.meta.partial);
    assert_eq!(resp.meta.request_id, "req-1");
    let rvs: Vec<_> = resp.entries.iter().map(|e| e.resource_version.as_str()).collect();
    assert_eq!(rvs, vec!["0", "1", "2"]);
    assert_eq!(resp.entries[0].payload["rv"], "0");
}

#[test]
fn resources_query_lists_names() {
    let dir = TempDir::new().unwrap();
    let tables = seeded(&dir);
    let reg = QueryRegistry::with_builtins();
    let params = window().with("kind", "Pod").with("namespace", "default");
    let resp: ResourcesResponse =
        serde_json::from_slice(&reg.run_at("resources", &params, &tables, WEEK, "r", now()).unwrap()).unwrap();
    assert_eq!(resp.names, vec!["web-0", "web-1"]);
}

#[test]
fn timeline_rows_carry_activity() {
    let dir = TempDir::new().unwrap();
    let tables = seeded(&dir);
    let reg = QueryRegistry::with_builtins();
    let params = window().with("kind", "Pod").with("namespace", "default");
    let bytes = reg.run_at("timeline", &params, &tables, WEEK, "r", now()).unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(raw["rows"][0]["overlays"], serde_json::json!([]));
    let root: TimelineRoot = serde_json::from_slice(&bytes).unwrap();
    assert!(root.rows.iter().all(|r| r.overlays.is_empty()));
    assert_eq!(root.view_opt.sort, "MostEvents");
    assert_eq!(root.rows.len(), 2);
    assert_eq!(root.rows[0].text, "web-0");
    assert_eq!(root.rows[0].changed_at.len(), 3);
    assert_eq!(root.rows[1].text, "web-1");
    assert_eq!(root.rows[1].changed_at.len(), 1);
    assert_eq!(root.rows[1].no_change_at, vec![ts("2024-03-01T11:10:00Z").timestamp()]);
    assert_eq!(root.rows[0].start_date, ts("2024-03-01T09:30:00Z").timestamp());
}

#[test]
fn unknown_query_and_missing_params_are_reported() {
    let dir = TempDir::new().unwrap();
    let tables = seeded(&dir);
    let reg = QueryRegistry::with_builtins();
    assert!(matches!(reg.run_at("nope", &window(), &tables, WEEK, "r", now()), Err(QueryError::NotFound(_))));
    assert!(matches!(reg.run_at("history", &window(), &tables, WEEK, "r", now()), Err(QueryError::Validation(_))));
}

#[test]
fn custom_query_receives_clamped_window() {
    let dir = TempDir::new().unwrap();
    let tables = seeded(&dir);
    let mut reg = QueryRegistry::new();
    reg.register("window", |_: &QueryParams, _: &Tables, start: DateTime<Utc>, end: DateTime<Utc>, id: &str| {
        Ok(format!("{id}:{}:{}", start.timestamp(), end.timestamp()).into_bytes())
    })
    .unwrap();
    let params = QueryParams::new().with("start_time", "2020-01-01T00:00:00Z");
    let out = reg.run_at("window", &params, &tables, WEEK, "x", now()).unwrap();
    let expected_start = (now() - ChronoDuration::weeks(1)).timestamp();
    assert_eq!(String::from_utf8(out).unwrap(), format!("x:{}:{}", expected_start, now().timestamp()));
}

#[test]
fn oversized_lookback_runs_against_the_capped_window() {
    let dir = TempDir::new().unwrap();
    let tables = seeded(&dir);
    let reg = QueryRegistry::with_builtins();
    let params = QueryParams::new()
        .with("lookback", "10000000000000000")
        .with("end_time", "2024-03-01T12:00:00Z")
        .with("kind", "Pod")
        .with("namespace", "default");
    let bytes = reg.run_at("resources", &params, &tables, WEEK, "req-big", now()).unwrap();
    let resp: ResourcesResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(resp.names, vec!["web-0", "web-1"]);
}

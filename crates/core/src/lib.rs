//! Kairos core types: change events, partition keys and the ordered key codec.

#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod minor;

pub use minor::is_minor_update;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One observed state transition of a cluster resource.
///
/// Produced by a watch source, consumed once by the ingestion processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub kind: String,
    /// Empty for cluster-scoped resources.
    pub namespace: String,
    pub name: String,
    pub observed_at: DateTime<Utc>,
    /// `metadata.resourceVersion` of the object; empty when unknown.
    #[serde(default)]
    pub resource_version: String,
    pub change: ChangeKind,
    /// Update that only touched volatile fields (heartbeats, resourceVersion).
    #[serde(default)]
    pub minor: bool,
    /// Serialized resource body (JSON).
    pub payload: String,
}

impl ChangeEvent {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        observed_at: DateTime<Utc>,
        change: ChangeKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            observed_at,
            resource_version: String::new(),
            change,
            minor: false,
            payload: payload.into(),
        }
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.resource_version = rv.into();
        self
    }

    pub fn with_minor(mut self, minor: bool) -> Self {
        self.minor = minor;
        self
    }

    /// `kind/namespace/name`, or `kind/name` for cluster-scoped objects.
    pub fn resource_key(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.kind, self.name)
        } else {
            format!("{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

// ---- time partitioning ----

const PARTITION_DIR_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Start of a fixed-duration time bucket, in unix seconds.
///
/// Orders chronologically; the directory name sorts the same way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(i64);

impl PartitionKey {
    /// Bucket containing `ts` for the given partition duration (whole seconds, >= 1).
    pub fn for_time(ts: DateTime<Utc>, duration: Duration) -> Self {
        let step = duration.as_secs().max(1) as i64;
        Self(ts.timestamp().div_euclid(step) * step)
    }

    pub fn from_start_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn start_secs(&self) -> i64 {
        self.0
    }

    pub fn start(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.0, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Exclusive end of the bucket.
    pub fn end(&self, duration: Duration) -> DateTime<Utc> {
        let step = duration.as_secs().max(1) as i64;
        DateTime::<Utc>::from_timestamp(self.0.saturating_add(step), 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn next(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs().max(1) as i64))
    }

    pub fn dir_name(&self) -> String {
        self.start().format(PARTITION_DIR_FORMAT).to_string()
    }

    /// Parse a directory name produced by [`PartitionKey::dir_name`].
    pub fn parse_dir_name(name: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(name, PARTITION_DIR_FORMAT)
            .ok()
            .map(|dt| Self(dt.and_utc().timestamp()))
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Ordered set of partition keys overlapping `[start, end]` (inclusive).
pub fn partitions_between(start: DateTime<Utc>, end: DateTime<Utc>, duration: Duration) -> Vec<PartitionKey> {
    if end < start {
        return Vec::new();
    }
    let last = PartitionKey::for_time(end, duration);
    let mut cur = PartitionKey::for_time(start, duration);
    let mut out = Vec::new();
    while cur <= last {
        out.push(cur);
        cur = cur.next(duration);
    }
    out
}

// ---- ordered key codec ----

/// Separator between string key segments. Kubernetes names never contain NUL.
pub const KEY_SEP: u8 = 0;

/// Encode a timestamp so that byte order equals time order.
pub fn encode_ts(ts: DateTime<Utc>) -> [u8; 8] {
    let nanos = ts.timestamp_nanos_opt().unwrap_or(if ts.timestamp() < 0 { i64::MIN } else { i64::MAX });
    ((nanos as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub fn decode_ts(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    let nanos = (u64::from_be_bytes(arr) ^ (1u64 << 63)) as i64;
    DateTime::<Utc>::from_timestamp(nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000) as u32)
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// `None` when the prefix is all `0xff` (unbounded).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn same_bucket_same_partition() {
        let a = PartitionKey::for_time(ts("2024-03-01T10:00:00Z"), HOUR);
        let b = PartitionKey::for_time(ts("2024-03-01T10:59:59Z"), HOUR);
        let c = PartitionKey::for_time(ts("2024-03-01T11:00:00Z"), HOUR);
        assert_eq!(a, b);
        assert!(c > a);
        assert_eq!(a.end(HOUR), c.start());
    }

    #[test]
    fn dir_name_roundtrip_and_sorts() {
        let a = PartitionKey::for_time(ts("2024-03-01T09:30:00Z"), HOUR);
        let b = PartitionKey::for_time(ts("2024-03-01T10:30:00Z"), HOUR);
        assert_eq!(a.dir_name(), "20240301T090000Z");
        assert_eq!(PartitionKey::parse_dir_name(&a.dir_name()), Some(a));
        assert!(a.dir_name() < b.dir_name());
        assert_eq!(PartitionKey::parse_dir_name("not-a-partition"), None);
    }

    #[test]
    fn partitions_between_covers_both_ends() {
        let keys = partitions_between(ts("2024-03-01T09:59:00Z"), ts("2024-03-01T12:00:00Z"), HOUR);
        let names: Vec<_> = keys.iter().map(|k| k.dir_name()).collect();
        assert_eq!(names, vec!["20240301T090000Z", "20240301T100000Z", "20240301T110000Z", "20240301T120000Z"]);
        assert!(partitions_between(ts("2024-03-01T12:00:00Z"), ts("2024-03-01T09:00:00Z"), HOUR).is_empty());
    }

    #[test]
    fn ts_codec_preserves_order() {
        let early = ts("1969-12-31T23:59:59Z");
        let mid = ts("2024-03-01T10:00:00.000000001Z");
        let late = ts("2024-03-01T10:00:00.000000002Z");
        assert!(encode_ts(early) < encode_ts(mid));
        assert!(encode_ts(mid) < encode_ts(late));
        assert_eq!(decode_ts(&encode_ts(mid)), Some(mid));
        assert_eq!(decode_ts(&encode_ts(early)), Some(early));
        assert_eq!(decode_ts(&[1, 2, 3]), None);
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(&[1, 0xff]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn resource_key_omits_empty_namespace() {
        let t = ts("2024-03-01T10:00:00Z");
        let pod = ChangeEvent::new("Pod", "default", "web-0", t, ChangeKind::Create, "{}");
        let node = ChangeEvent::new("Node", "", "n1", t, ChangeKind::Update, "{}");
        assert_eq!(pod.resource_key(), "Pod/default/web-0");
        assert_eq!(node.resource_key(), "Node/n1");
    }
}

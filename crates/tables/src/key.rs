//! Ordered composite key: `table \0 kind \0 namespace \0 name \0 ts[8]`.

use chrono::{DateTime, Utc};
use kairos_core::{decode_ts, encode_ts, KEY_SEP};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKey {
    pub table: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub ts: DateTime<Utc>,
}

fn push_segment(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(KEY_SEP);
}

impl TableKey {
    pub fn new(table: &str, kind: &str, namespace: &str, name: &str, ts: DateTime<Utc>) -> Self {
        Self { table: table.into(), kind: kind.into(), namespace: namespace.into(), name: name.into(), ts }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = resource_prefix(&self.table, &self.kind, &self.namespace, &self.name);
        out.extend_from_slice(&encode_ts(self.ts));
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        let (head, ts) = bytes.split_at(bytes.len() - 8);
        let head = head.strip_suffix(&[KEY_SEP])?;
        let mut parts = head.split(|b| *b == KEY_SEP);
        let table = std::str::from_utf8(parts.next()?).ok()?;
        let kind = std::str::from_utf8(parts.next()?).ok()?;
        let namespace = std::str::from_utf8(parts.next()?).ok()?;
        let name = std::str::from_utf8(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(table, kind, namespace, name, decode_ts(ts)?))
    }
}

/// Prefix selecting one resource's history, in timestamp order.
pub fn resource_prefix(table: &str, kind: &str, namespace: &str, name: &str) -> Vec<u8> {
    let mut out = namespace_prefix(table, kind, namespace);
    push_segment(&mut out, name);
    out
}

/// Prefix selecting every resource of `kind` in `namespace`.
pub fn namespace_prefix(table: &str, kind: &str, namespace: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(table.len() + kind.len() + namespace.len() + 3);
    push_segment(&mut out, table);
    push_segment(&mut out, kind);
    push_segment(&mut out, namespace);
    out
}

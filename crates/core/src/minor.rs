//! Classification of "minor" updates: changes that only touch volatile fields.

use serde_json::Value;

/// Metadata fields that change on every write without altering observable state.
const VOLATILE_METADATA: &[&str] = &["resourceVersion", "managedFields"];

/// Per-condition timestamps bumped by kubelet/node heartbeats.
const VOLATILE_CONDITION: &[&str] = &["lastHeartbeatTime", "lastProbeTime"];

/// True when `next` differs from `prev` only in volatile fields.
pub fn is_minor_update(prev: &Value, next: &Value) -> bool {
    let mut a = prev.clone();
    let mut b = next.clone();
    mask_volatile(&mut a);
    mask_volatile(&mut b);
    a == b
}

fn mask_volatile(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in VOLATILE_METADATA {
            meta.remove(*f);
        }
    }
    if let Some(conds) = v
        .get_mut("status")
        .and_then(|s| s.get_mut("conditions"))
        .and_then(|c| c.as_array_mut())
    {
        for c in conds.iter_mut().filter_map(|c| c.as_object_mut()) {
            for f in VOLATILE_CONDITION {
                c.remove(*f);
            }
        }
    }
}

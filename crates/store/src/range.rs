use std::collections::VecDeque;
use std::sync::Arc;

use kairos_core::{prefix_end, PartitionKey};
use kairos_persist::{scan_range, Scan};
use metrics::counter;
use tracing::{debug, warn};

use crate::{PartitionedStore, StoreError};

/// One entry yielded by a range read, tagged with its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub partition: PartitionKey,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Lazy concatenation of per-partition prefix scans, in partition time order.
///
/// A partition that is missing, or whose handle is closed mid-scan by retention, is
/// skipped. A partition that fails to open or read yields one `Err` item and the
/// read moves on to the next partition. An undecodable value yields an `Err` item
/// for that record only and the partition scan continues.
pub struct RangeRead {
    store: Arc<PartitionedStore>,
    pending: VecDeque<PartitionKey>,
    prefix: Vec<u8>,
    end: Option<Vec<u8>>,
    current: Option<(PartitionKey, Scan)>,
    vanished: usize,
    failed: usize,
}

impl RangeRead {
    pub(crate) fn new(store: Arc<PartitionedStore>, parts: Vec<PartitionKey>, prefix: Vec<u8>) -> Self {
        let end = prefix_end(&prefix);
        Self { store, pending: parts.into(), prefix, end, current: None, vanished: 0, failed: 0 }
    }

    /// Partitions that disappeared underneath the read.
    pub fn vanished(&self) -> usize {
        self.vanished
    }

    /// Partitions that produced an error item.
    pub fn failed(&self) -> usize {
        self.failed
    }

    fn advance(&mut self) -> Option<Result<(), StoreError>> {
        while let Some(pk) = self.pending.pop_front() {
            match self.store.handle(pk, false) {
                Ok(Some(h)) => {
                    self.current = Some((pk, scan_range(h, &self.prefix, self.end.as_deref())));
                    return Some(Ok(()));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.failed += 1;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl Iterator for RangeRead {
    type Item = Result<PartitionEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((pk, scan)) = self.current.as_mut() {
                let pk = *pk;
                match scan.next() {
                    Some(Ok((key, value))) => return Some(Ok(PartitionEntry { partition: pk, key, value })),
                    Some(Err(e)) if e.is_record() => {
                        return Some(Err(StoreError::Record { partition: pk, source: e }));
                    }
                    Some(Err(e)) if e.is_closed() => {
                        debug!(partition = %pk, "partition closed mid-scan; skipping");
                        counter!("store_scan_vanished_total", 1u64);
                        self.vanished += 1;
                        self.current = None;
                    }
                    Some(Err(e)) => {
                        warn!(partition = %pk, error = %e, "partition scan failed");
                        self.failed += 1;
                        self.current = None;
                        return Some(Err(StoreError::Partition { partition: pk, source: e }));
                    }
                    None => self.current = None,
                }
                continue;
            }
            match self.advance()? {
                Ok(()) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

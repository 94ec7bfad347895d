use std::collections::VecDeque;
use std::sync::Arc;

use metrics::counter;
use tracing::warn;

use crate::{decode_value, EngineError, EngineResult, Entry, KvEngine};

/// Entries fetched per engine round-trip. The handle lock is released between pages.
pub const SCAN_PAGE_SIZE: usize = 256;

/// Lazy ascending scan over `[start, end)`, restartable from its cursor.
///
/// A value that fails to unframe yields [`EngineError::Corrupt`] for that key and the
/// scan carries on. Any other error ends the scan.
pub struct Scan {
    engine: Arc<dyn KvEngine>,
    next_start: Vec<u8>,
    end: Option<Vec<u8>>,
    buf: VecDeque<Entry>,
    cursor: Option<Vec<u8>>,
    page: usize,
    exhausted: bool,
}

pub fn scan_range(engine: Arc<dyn KvEngine>, start: &[u8], end: Option<&[u8]>) -> Scan {
    Scan {
        engine,
        next_start: start.to_vec(),
        end: end.map(|e| e.to_vec()),
        buf: VecDeque::new(),
        cursor: None,
        page: SCAN_PAGE_SIZE,
        exhausted: false,
    }
}

impl Scan {
    /// Resume after `cursor` (exclusive), as returned by [`Scan::cursor`].
    pub fn resume(engine: Arc<dyn KvEngine>, cursor: &[u8], end: Option<&[u8]>) -> Scan {
        let mut start = cursor.to_vec();
        start.push(0);
        let mut scan = scan_range(engine, &start, end);
        scan.cursor = Some(cursor.to_vec());
        scan
    }

    pub fn with_page_size(mut self, page: usize) -> Self {
        self.page = page.max(1);
        self
    }

    /// Last key yielded so far.
    pub fn cursor(&self) -> Option<&[u8]> {
        self.cursor.as_deref()
    }

    fn fill(&mut self) -> EngineResult<()> {
        let page = self.engine.scan_page(&self.next_start, self.end.as_deref(), self.page)?;
        if page.len() < self.page {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.next_start = last.clone();
            self.next_start.push(0);
        }
        self.buf.extend(page);
        Ok(())
    }
}

impl Iterator for Scan {
    type Item = EngineResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let (key, framed) = self.buf.pop_front()?;
        self.cursor = Some(key.clone());
        match decode_value(&framed) {
            Ok(value) => Some(Ok((key, value))),
            Err(e) => {
                warn!(path = %self.engine.path().display(), error = %e, "undecodable value in scan");
                counter!("persist_corrupt_values_total", 1u64);
                Some(Err(EngineError::Corrupt { key, reason: e.to_string() }))
            }
        }
    }
}

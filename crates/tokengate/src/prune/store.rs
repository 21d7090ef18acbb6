//! Time-bounded store of redaction records.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::types::RedactionRecord;
use crate::error::{GateError, Result};

/// Default record lifetime.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30 * 60);

/// Default maximum number of live records.
pub const DEFAULT_MAX_RECORDS: usize = 4096;

/// Concurrent store of [`RedactionRecord`]s keyed by `prune_id`.
///
/// Lookups after a record's TTL fail with [`GateError::RecordExpired`];
/// unknown ids fail with [`GateError::RecordNotFound`]. Expired records stay
/// distinguishable until [`purge_expired`](Self::purge_expired) drops them.
#[derive(Debug)]
pub struct RedactionStore {
    records: DashMap<String, RedactionRecord>,
    max_records: usize,
}

impl Default for RedactionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl RedactionStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_records: max_records.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record. Insert-once: an existing `prune_id` is kept.
    ///
    /// At capacity, expired records are purged first, then the oldest live
    /// record is dropped.
    pub fn insert(&self, record: RedactionRecord) {
        if self.records.contains_key(&record.prune_id) {
            return;
        }
        if self.records.len() >= self.max_records {
            self.purge_expired();
        }
        while self.records.len() >= self.max_records {
            let oldest = self
                .records
                .iter()
                .min_by_key(|r| r.created_at)
                .map(|r| r.key().clone());
            match oldest {
                Some(id) => {
                    self.records.remove(&id);
                    debug!("Dropped redaction record {id} at capacity");
                }
                None => break,
            }
        }
        self.records
            .entry(record.prune_id.clone())
            .or_insert(record);
    }

    /// Fetch a live record.
    pub fn get(&self, prune_id: &str) -> Result<RedactionRecord> {
        let record = self
            .records
            .get(prune_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| GateError::RecordNotFound(prune_id.to_string()))?;
        if record.is_expired_at(Utc::now()) {
            return Err(GateError::RecordExpired(prune_id.to_string()));
        }
        Ok(record)
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired_at(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!("Purged {removed} expired redaction record(s)");
        }
        removed
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Source name → records, oldest first.
pub type ClickMap = BTreeMap<String, Vec<ClickRecord>>;

/// One captured click identifier.
/// Field names are camelCase on disk so the blob matches what a browser build writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickRecord {
    /// The identifier value. Unique within its source bucket.
    pub value: String,
    /// Epoch milliseconds when the identifier was last seen.
    pub timestamp: i64,
    /// Epoch milliseconds after which the record is dropped by cleanup.
    pub expires_at: i64,
    /// Page URL the identifier was captured on (empty when unknown).
    #[serde(default)]
    pub landing: String,
    /// Document referrer at capture time (empty when unknown).
    #[serde(default)]
    pub referrer: String,
}

impl ClickRecord {
    /// Returns true once `now` has reached the expiry instant.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Drop expired records, then keep only the newest `max` entries.
/// Returns the number of records removed.
pub fn prune_records(records: &mut Vec<ClickRecord>, now: i64, max: usize) -> usize {
    let before = records.len();
    records.retain(|r| !r.is_expired(now));
    trim_front(records, max);
    before - records.len()
}

/// Evict from the front until at most `max` records remain.
pub fn trim_front(records: &mut Vec<ClickRecord>, max: usize) -> usize {
    let excess = records.len().saturating_sub(max);
    records.drain(..excess);
    excess
}

/// Most recent record by timestamp. The first one encountered wins ties.
pub fn latest(records: &[ClickRecord]) -> Option<&ClickRecord> {
    records.iter().fold(None, |newest, current| match newest {
        Some(n) if current.timestamp <= n.timestamp => Some(n),
        _ => Some(current),
    })
}

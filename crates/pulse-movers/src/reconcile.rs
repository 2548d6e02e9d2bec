//! Row reconciliation.
//!
//! Consumers compare rows by pointer to skip work on unchanged entries. The
//! reconciler hands back the previous `Arc` for every row whose fields did
//! not change, so `Arc::ptr_eq` holds exactly for untouched rows.

use pulse_core::{RankedEntry, RankedList};
use std::collections::HashMap;
use std::sync::Arc;

/// Counts from one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Rows taken from the previous list.
    pub reused: usize,
    /// Rows taken from the next list.
    pub replaced: usize,
}

/// Reconcile `next` against `prev`.
///
/// The result has the length and order of `next`. Neither input is modified.
pub fn reconcile(next: &[Arc<RankedEntry>], prev: &[Arc<RankedEntry>]) -> RankedList {
    reconcile_with_stats(next, prev).0
}

/// [`reconcile`], also reporting how many rows were reused.
pub fn reconcile_with_stats(
    next: &[Arc<RankedEntry>],
    prev: &[Arc<RankedEntry>],
) -> (RankedList, ReconcileStats) {
    let by_symbol: HashMap<&str, &Arc<RankedEntry>> =
        prev.iter().map(|e| (e.symbol.as_str(), e)).collect();

    let mut stats = ReconcileStats::default();
    let list = next
        .iter()
        .map(|entry| match by_symbol.get(entry.symbol.as_str()) {
            Some(old) if Arc::ptr_eq(old, entry) || **old == *entry => {
                stats.reused += 1;
                Arc::clone(old)
            }
            _ => {
                stats.replaced += 1;
                Arc::clone(entry)
            }
        })
        .collect();

    (list, stats)
}

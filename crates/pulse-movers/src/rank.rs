//! Mover ranking.
//!
//! Produces a bounded, contiguously ranked list from one normalized batch,
//! optionally topped up from the previous list while updates are sparse.

use pulse_core::{CanonicalRow, MoverVariant, RankedEntry, RankedList};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Ranking parameters for one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankOptions {
    pub variant: MoverVariant,
    /// Maximum list length.
    pub limit: usize,
    /// Top up short batches with still-valid entries from the previous list.
    pub continuity: bool,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            variant: MoverVariant::Gainers,
            limit: 20,
            continuity: true,
        }
    }
}

/// Rank a batch against the previously published list.
///
/// Rows are deduplicated by symbol (best metric wins), filtered to the list's
/// direction, sorted by metric, truncated to `limit` and renumbered from 1.
/// A symbol whose fresh row moves the wrong way is evicted, even if the
/// previous list still holds it. With continuity enabled, a batch shorter
/// than `limit` is merged with previous entries that are absent from it and
/// still move in the list's direction. The sort is stable and
/// fresh rows come first, so a merged entry never outranks an equal or
/// better fresh one.
pub fn rank(batch: &[CanonicalRow], prev: &[Arc<RankedEntry>], opts: &RankOptions) -> RankedList {
    if opts.limit == 0 {
        return Vec::new();
    }

    if batch.is_empty() {
        return if opts.continuity {
            renumber(prev.iter().take(opts.limit).cloned())
        } else {
            Vec::new()
        };
    }

    let fresh = dedup(batch, opts.variant);
    let prev_by_symbol: HashMap<&str, &Arc<RankedEntry>> =
        prev.iter().map(|e| (e.symbol.as_str(), e)).collect();

    let mut candidates: Vec<RankedEntry> = fresh
        .iter()
        .filter(|row| opts.variant.is_in_direction(row.change_pct))
        .map(|row| {
            let peak_count = match prev_by_symbol.get(row.symbol.as_str()) {
                Some(p) if opts.variant.is_better(row.change_pct, p.change_pct) => {
                    p.peak_count.saturating_add(1)
                }
                Some(p) => p.peak_count,
                None => 0,
            };
            RankedEntry::from_row(row.clone(), 0, peak_count)
        })
        .collect();

    if opts.continuity && candidates.len() < opts.limit {
        let fresh_symbols: HashSet<&str> = fresh.iter().map(|r| r.symbol.as_str()).collect();
        let before = candidates.len();
        candidates.extend(
            prev.iter()
                .filter(|e| !fresh_symbols.contains(e.symbol.as_str()))
                .filter(|e| opts.variant.is_in_direction(e.change_pct))
                .map(|e| RankedEntry::clone(e)),
        );
        trace!(
            variant = %opts.variant,
            merged = candidates.len() - before,
            "Continuity merge"
        );
    }

    candidates.sort_by(|a, b| opts.variant.compare(a.change_pct, b.change_pct));
    candidates.truncate(opts.limit);

    candidates
        .into_iter()
        .enumerate()
        .map(|(i, entry)| Arc::new(RankedEntry { rank: i as u32 + 1, ..entry }))
        .collect()
}

/// Keep one row per symbol, the one with the best metric. First-seen order
/// is preserved.
fn dedup(batch: &[CanonicalRow], variant: MoverVariant) -> Vec<CanonicalRow> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(batch.len());
    let mut rows: Vec<CanonicalRow> = Vec::with_capacity(batch.len());

    for row in batch {
        match index.get(row.symbol.as_str()) {
            Some(&i) => {
                if variant.is_better(row.change_pct, rows[i].change_pct) {
                    rows[i] = row.clone();
                }
            }
            None => {
                index.insert(row.symbol.as_str(), rows.len());
                rows.push(row.clone());
            }
        }
    }
    rows
}

/// Renumber from 1, keeping the existing allocation where the rank already
/// matches.
fn renumber(entries: impl Iterator<Item = Arc<RankedEntry>>) -> RankedList {
    entries
        .enumerate()
        .map(|(i, entry)| {
            let rank = i as u32 + 1;
            if entry.rank == rank {
                entry
            } else {
                Arc::new(entry.with_rank(rank))
            }
        })
        .collect()
}

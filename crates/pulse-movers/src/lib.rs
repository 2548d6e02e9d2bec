//! Mover lists for pulse.
//!
//! - `rank`: dedup, continuity merge, sort, truncate and renumber
//! - `reconcile`: reuse unchanged rows from the previous list by `Arc`

pub mod rank;
pub mod reconcile;

pub use rank::{rank, RankOptions};
pub use reconcile::{reconcile, reconcile_with_stats, ReconcileStats};

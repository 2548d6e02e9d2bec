//! Row and ranked-list types.
//!
//! `CanonicalRow` is what the normalizer produces; `RankedEntry` is what the
//! ranking engine produces. A `RankedList` holds its entries behind `Arc` so a
//! reconciled list can hand back the exact allocation of an unchanged row.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A normalized market row.
///
/// `symbol` is never empty and `change_pct` is always finite. `price` is
/// `None` when the backend did not send a usable number, which is distinct
/// from a literal zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_pct: f64,
}

impl CanonicalRow {
    pub fn new(symbol: impl Into<String>, price: Option<f64>, change_pct: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            change_pct,
        }
    }
}

/// Which direction a mover list ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoverVariant {
    /// Highest change first.
    #[default]
    Gainers,
    /// Lowest (most negative) change first.
    Losers,
}

impl MoverVariant {
    /// Compare two metrics so that the better one sorts first.
    pub fn compare(&self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::Gainers => ord.reverse(),
            Self::Losers => ord,
        }
    }

    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        self.compare(candidate, incumbent) == Ordering::Less
    }

    /// Whether a metric moves in this list's direction (positive for gainers,
    /// negative for losers). Zero belongs to neither.
    pub fn is_in_direction(&self, change_pct: f64) -> bool {
        match self {
            Self::Gainers => change_pct > 0.0,
            Self::Losers => change_pct < 0.0,
        }
    }
}

impl fmt::Display for MoverVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gainers => write!(f, "gainers"),
            Self::Losers => write!(f, "losers"),
        }
    }
}

impl FromStr for MoverVariant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gainers" | "gainer" => Ok(Self::Gainers),
            "losers" | "loser" => Ok(Self::Losers),
            other => Err(CoreError::UnknownVariant(other.to_string())),
        }
    }
}

/// A ranked row inside a mover list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_pct: f64,
    /// 1-based position in the list.
    pub rank: u32,
    /// How many times this symbol set a new best metric while listed.
    pub peak_count: u32,
}

impl RankedEntry {
    pub fn from_row(row: CanonicalRow, rank: u32, peak_count: u32) -> Self {
        Self {
            symbol: row.symbol,
            price: row.price,
            change_pct: row.change_pct,
            rank,
            peak_count,
        }
    }

    /// Copy with a different rank.
    pub fn with_rank(&self, rank: u32) -> Self {
        Self {
            rank,
            ..self.clone()
        }
    }
}

/// An ordered, bounded mover list. Superseded, never mutated.
pub type RankedList = Vec<Arc<RankedEntry>>;

//! Payload normalization.
//!
//! Backends send movers as bare arrays, `{data: [...]}` or `{rows: [...]}`
//! envelopes, or maps keyed by symbol, and every build spells its fields a
//! little differently. [`normalize`] accepts any JSON value and returns the
//! rows it could make sense of. It never fails: unusable rows are dropped and
//! unusable payloads yield an empty batch.

use crate::error::FeedError;
use pulse_core::{canonical_symbol, CanonicalRow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

const SYMBOL_KEYS: &[&str] = &["symbol", "ticker", "s", "base"];

const PRICE_KEYS: &[&str] = &["price", "last", "p", "close", "current", "current_price"];

/// Percentage aliases, highest priority first.
const PCT_KEYS: &[&str] = &[
    "change_pct",
    "changePct",
    "change_percent",
    "percent_change",
    "pct_change",
    "price_change_percentage_1min",
    "price_change_percentage_3min",
    "price_change_percentage_1h",
    "price_change_percentage_24h",
    "change_1m",
    "change_3m",
    "change_1h",
    "change_24h",
    "gain",
    "change",
];

/// Reference-price aliases used to derive a percentage when none is sent.
const PAST_PRICE_KEYS: &[&str] = &[
    "initial_price_1min",
    "initial_price_3min",
    "initial_price_1h",
    "initial_price",
    "price_1m_ago",
    "price_3m_ago",
    "prev_price",
    "previous_price",
    "open",
];

/// Median |change| below this marks a batch as fractional.
const FRACTION_MEDIAN_THRESHOLD: f64 = 0.02;

/// Declared unit of the percentage fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitHint {
    /// Guess from the batch median.
    #[default]
    Auto,
    /// Values are already percentages (`2.5` = 2.5%).
    Percent,
    /// Values are fractions (`0.025` = 2.5%).
    Fraction,
}

impl fmt::Display for UnitHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Percent => write!(f, "percent"),
            Self::Fraction => write!(f, "fraction"),
        }
    }
}

impl FromStr for UnitHint {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "percent" | "pct" => Ok(Self::Percent),
            "fraction" => Ok(Self::Fraction),
            other => Err(FeedError::InvalidUnitHint(other.to_string())),
        }
    }
}

/// Supported payload shapes, tried in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum Envelope<'a> {
    /// `[row, ...]`
    Array(&'a [Value]),
    /// `{"data": [row, ...]}`
    Data(&'a [Value]),
    /// `{"rows": [row, ...]}`
    Rows(&'a [Value]),
    /// `{"BTC": row | price, ...}`
    Keyed(&'a Map<String, Value>),
    /// Anything else.
    Unsupported,
}

impl<'a> Envelope<'a> {
    pub fn decode(value: &'a Value) -> Self {
        match value {
            Value::Array(rows) => Self::Array(rows),
            Value::Object(map) => {
                if let Some(Value::Array(rows)) = map.get("data") {
                    Self::Data(rows)
                } else if let Some(Value::Array(rows)) = map.get("rows") {
                    Self::Rows(rows)
                } else {
                    Self::Keyed(map)
                }
            }
            _ => Self::Unsupported,
        }
    }

    /// Number of raw rows the envelope carries.
    pub fn len(&self) -> usize {
        match self {
            Self::Array(rows) | Self::Data(rows) | Self::Rows(rows) => rows.len(),
            Self::Keyed(map) => map.len(),
            Self::Unsupported => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A row before unit correction.
struct Candidate {
    row: CanonicalRow,
    /// Whether `change_pct` came from the payload rather than the default.
    pct_resolved: bool,
}

/// Normalize a payload, guessing the percentage unit.
pub fn normalize(value: &Value) -> Vec<CanonicalRow> {
    normalize_with(value, UnitHint::Auto)
}

/// Normalize a payload with a declared percentage unit.
pub fn normalize_with(value: &Value, hint: UnitHint) -> Vec<CanonicalRow> {
    let candidates: Vec<Candidate> = match Envelope::decode(value) {
        Envelope::Array(rows) | Envelope::Data(rows) | Envelope::Rows(rows) => rows
            .iter()
            .filter_map(|row| normalize_row(row, None))
            .collect(),
        Envelope::Keyed(map) => map
            .iter()
            .filter_map(|(key, row)| normalize_keyed(key, row))
            .collect(),
        Envelope::Unsupported => Vec::new(),
    };

    let scale = match hint {
        UnitHint::Percent => false,
        UnitHint::Fraction => true,
        UnitHint::Auto => looks_fractional(&candidates),
    };

    if scale {
        trace!(rows = candidates.len(), "Rescaling fractional batch to percent");
    }

    candidates
        .into_iter()
        .map(|mut c| {
            if scale && c.pct_resolved {
                c.row.change_pct *= 100.0;
            }
            c.row
        })
        .filter(|row| row.change_pct.is_finite())
        .collect()
}

fn normalize_keyed(key: &str, value: &Value) -> Option<Candidate> {
    match value {
        Value::Object(_) => normalize_row(value, Some(key)),
        // `{"BTC": 101.5}` is a bare price.
        Value::Number(_) | Value::String(_) => {
            let price = coerce_number(value)?;
            Some(Candidate {
                row: CanonicalRow::new(canonical_symbol(key)?, Some(price), 0.0),
                pct_resolved: false,
            })
        }
        _ => None,
    }
}

fn normalize_row(value: &Value, fallback_symbol: Option<&str>) -> Option<Candidate> {
    let Value::Object(row) = value else {
        return None;
    };

    let symbol = SYMBOL_KEYS
        .iter()
        .filter_map(|k| row.get(*k).and_then(Value::as_str))
        .find_map(canonical_symbol)
        .or_else(|| fallback_symbol.and_then(canonical_symbol))?;

    let price = first_number(row, PRICE_KEYS);
    let pct = first_number(row, PCT_KEYS).or_else(|| derive_pct(price, row));

    Some(Candidate {
        row: CanonicalRow::new(symbol, price, pct.unwrap_or(0.0)),
        pct_resolved: pct.is_some(),
    })
}

/// `(now - past) / past * 100`, undefined when `past` is zero.
fn derive_pct(now: Option<f64>, row: &Map<String, Value>) -> Option<f64> {
    let now = now?;
    let past = first_number(row, PAST_PRICE_KEYS)?;
    if past == 0.0 {
        return None;
    }
    let pct = (now - past) / past * 100.0;
    pct.is_finite().then_some(pct)
}

fn first_number(row: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| row.get(*k).and_then(coerce_number))
}

/// Numbers and numeric strings (`"2.5"`, `" 2.5% "`, `"1,204.5"`).
fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_end_matches('%')
                .trim_start_matches('$')
                .chars()
                .filter(|c| *c != ',')
                .collect();
            cleaned.trim().parse::<f64>().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn looks_fractional(candidates: &[Candidate]) -> bool {
    let mut magnitudes: Vec<f64> = candidates
        .iter()
        .filter(|c| c.pct_resolved)
        .map(|c| c.row.change_pct.abs())
        .collect();
    if magnitudes.is_empty() {
        return false;
    }
    magnitudes.sort_by(f64::total_cmp);

    let mid = magnitudes.len() / 2;
    let median = if magnitudes.len() % 2 == 0 {
        (magnitudes[mid - 1] + magnitudes[mid]) / 2.0
    } else {
        magnitudes[mid]
    };
    median < FRACTION_MEDIAN_THRESHOLD
}

//! Core domain types for the pulse market-data sync layer.
//!
//! This crate provides the types shared by every stage of the pipeline:
//! - `CanonicalRow`: a normalized `{symbol, price, change_pct}` row
//! - `RankedEntry` / `RankedList`: bounded, ranked mover lists
//! - `MoverVariant`: gainers or losers ordering
//! - `Symbol` helpers: canonical, upper-case, quote-suffix-free symbols

pub mod error;
pub mod symbol;
pub mod types;

pub use error::{CoreError, Result};
pub use symbol::canonical_symbol;
pub use types::{CanonicalRow, MoverVariant, RankedEntry, RankedList};

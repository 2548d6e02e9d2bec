//! Market data normalization for pulse.
//!
//! Turns whatever the backend sends into canonical rows and keeps the latest
//! payload per logical stream so lists can be recomputed on demand.

pub mod error;
pub mod market_state;
pub mod normalize;

pub use error::{FeedError, FeedResult};
pub use market_state::{LatestSlots, PriceBook, Slot, SlotSource};
pub use normalize::{normalize, normalize_with, Envelope, UnitHint};

//! Feed error types.
//!
//! Payload problems never surface here; the normalizer drops bad rows.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Invalid unit hint: {0}")]
    InvalidUnitHint(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

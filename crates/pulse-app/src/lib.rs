//! Pulse: live market-data synchronization layer.
//!
//! Wires the push/poll transport into the mover pipeline and the watchlist,
//! and exposes each mover list as a `tokio::sync::watch` channel.

pub mod app;
pub mod config;
pub mod error;
pub mod pipeline;

pub use app::Application;
pub use config::{AppConfig, DeviceProfile, ListSpec, StorageConfig, StreamSpec};
pub use error::{AppError, AppResult};
pub use pipeline::{MoverPipeline, WatchlistRow};

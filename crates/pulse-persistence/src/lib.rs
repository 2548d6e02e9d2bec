//! Client-side persistence for pulse.
//!
//! - `WatchlistStore`: tracked symbols anchored to their price when added
//! - `KeyValueStore` backends: JSON files on disk, or shared memory
//! - `ChangeObserver`: storage-change notifications from other contexts
//! - `SessionCache`: last payload per stream, for priming on restart

pub mod error;
pub mod file_store;
pub mod session;
pub mod store;
pub mod watchlist;

pub use error::{PersistenceError, PersistenceResult};
pub use file_store::{FileChangeWatcher, JsonFileStore};
pub use session::SessionCache;
pub use store::{
    ChangeObserver, ContextId, KeyValueStore, MemoryStore, StorageChange, EXTERNAL_CONTEXT,
};
pub use watchlist::{WatchlistEntry, WatchlistStore, WATCHLIST_KEY};

//! Watchlist store.
//!
//! A small set of symbols, each anchored to the price seen when it was
//! added. Every mutation is written through to the backing store under one
//! versioned key; changes made by other contexts arrive through a
//! [`ChangeObserver`] and replace the in-memory set.

use crate::store::{ChangeObserver, KeyValueStore, StorageChange};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use pulse_core::canonical_symbol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Storage key for the persisted watchlist.
pub const WATCHLIST_KEY: &str = "pulse.watchlist.v1";

/// A watched symbol and its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchlistEntry {
    pub symbol: String,
    /// Price when added, if one was known.
    pub baseline_price: Option<f64>,
    pub added_at: DateTime<Utc>,
}

impl WatchlistEntry {
    /// Percent change from the baseline, if both prices are usable.
    pub fn delta_pct(&self, price_now: f64) -> Option<f64> {
        let base = self.baseline_price?;
        if base == 0.0 || !base.is_finite() || !price_now.is_finite() {
            return None;
        }
        Some((price_now - base) / base * 100.0)
    }
}

/// On-disk value shape: `{"BTC": {"price": 100.0, "at": 1700000000000}}`.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    price: Option<f64>,
    /// Unix milliseconds.
    at: i64,
}

type Entries = BTreeMap<String, WatchlistEntry>;

pub struct WatchlistStore {
    backend: Arc<dyn KeyValueStore>,
    entries: RwLock<Entries>,
    /// Held from mutation through write-through, so the backend sees
    /// writes in the order memory saw them.
    write_lock: Mutex<()>,
}

impl WatchlistStore {
    /// Load from `backend`. Unreadable or corrupt data yields an empty list.
    pub fn load(backend: Arc<dyn KeyValueStore>) -> Self {
        let entries = match backend.get(WATCHLIST_KEY) {
            Ok(Some(raw)) => decode(&raw),
            Ok(None) => Entries::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read watchlist, starting empty");
                Entries::new()
            }
        };
        info!(entries = entries.len(), "Watchlist loaded");

        Self {
            backend,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    pub fn has(&self, symbol: &str) -> bool {
        canonical_symbol(symbol).is_some_and(|s| self.entries.read().contains_key(&s))
    }

    /// Insert or overwrite `symbol` with `price_now` as its baseline.
    ///
    /// Returns `false` if the symbol is unusable.
    pub fn add(&self, symbol: &str, price_now: Option<f64>) -> bool {
        let Some(symbol) = canonical_symbol(symbol) else {
            return false;
        };
        let entry = WatchlistEntry {
            symbol: symbol.clone(),
            baseline_price: price_now.filter(|p| p.is_finite()),
            added_at: now_millis(),
        };
        self.mutate(|entries| {
            entries.insert(symbol, entry);
        });
        true
    }

    /// Remove `symbol`. No-op if absent.
    pub fn remove(&self, symbol: &str) {
        let Some(symbol) = canonical_symbol(symbol) else {
            return;
        };
        if !self.entries.read().contains_key(&symbol) {
            return;
        }
        self.mutate(|entries| {
            entries.remove(&symbol);
        });
    }

    /// Remove if present, else add. Returns whether `symbol` is now watched.
    pub fn toggle(&self, symbol: &str, price_now: Option<f64>) -> bool {
        if self.has(symbol) {
            self.remove(symbol);
            false
        } else {
            self.add(symbol, price_now)
        }
    }

    pub fn baseline_for(&self, symbol: &str) -> Option<WatchlistEntry> {
        let symbol = canonical_symbol(symbol)?;
        self.entries.read().get(&symbol).cloned()
    }

    /// Live change against the baseline.
    pub fn delta_pct(&self, symbol: &str, price_now: f64) -> Option<f64> {
        self.baseline_for(symbol)?.delta_pct(price_now)
    }

    /// All entries, ordered by symbol.
    pub fn entries(&self) -> Vec<WatchlistEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Apply a change reported by another context.
    ///
    /// Returns `true` if the in-memory set changed.
    pub fn apply_external_change(&self, change: &StorageChange) -> bool {
        if change.key != WATCHLIST_KEY {
            return false;
        }
        let next = change.new_value.as_deref().map(decode).unwrap_or_default();

        let mut entries = self.entries.write();
        if *entries == next {
            return false;
        }
        *entries = next;
        debug!(entries = entries.len(), "Watchlist refreshed from external change");
        true
    }

    /// Re-read from the backing store, e.g. after missed notifications.
    pub fn reload(&self) {
        match self.backend.get(WATCHLIST_KEY) {
            Ok(raw) => {
                *self.entries.write() = raw.as_deref().map(decode).unwrap_or_default();
            }
            Err(e) => warn!(error = %e, "Failed to reload watchlist"),
        }
    }

    /// Follow `observer` until cancelled, ignoring changes made through the
    /// observer's own context.
    pub fn spawn_sync(
        self: Arc<Self>,
        observer: Arc<dyn ChangeObserver>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = observer.subscribe();
        let own_context = observer.context_id();

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    () = token.cancelled() => break,
                    change = rx.recv() => change,
                };
                match change {
                    Ok(change) if change.origin == own_context => {}
                    Ok(change) => {
                        self.apply_external_change(&change);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watchlist sync lagged, reloading");
                        self.reload();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Watchlist sync stopped");
        })
    }

    /// Update in memory, then write through. Write failures are logged and
    /// the in-memory state is kept.
    fn mutate(&self, f: impl FnOnce(&mut Entries)) {
        let _write = self.write_lock.lock();
        let encoded = {
            let mut entries = self.entries.write();
            f(&mut entries);
            encode(&entries)
        };

        let result = encoded.and_then(|raw| self.backend.set(WATCHLIST_KEY, &raw));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist watchlist");
        }
    }
}

fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn encode(entries: &Entries) -> crate::PersistenceResult<String> {
    let persisted: BTreeMap<&str, PersistedEntry> = entries
        .values()
        .map(|e| {
            (
                e.symbol.as_str(),
                PersistedEntry {
                    price: e.baseline_price,
                    at: e.added_at.timestamp_millis(),
                },
            )
        })
        .collect();
    Ok(serde_json::to_string(&persisted)?)
}

fn decode(raw: &str) -> Entries {
    let persisted: BTreeMap<String, PersistedEntry> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "Corrupt watchlist data, ignoring");
            return Entries::new();
        }
    };

    persisted
        .into_iter()
        .filter_map(|(key, value)| {
            let symbol = canonical_symbol(&key)?;
            let entry = WatchlistEntry {
                symbol: symbol.clone(),
                baseline_price: value.price.filter(|p| p.is_finite()),
                added_at: from_millis(value.at),
            };
            Some((symbol, entry))
        })
        .collect()
}

//! Latest-data slots and the live price book.
//!
//! One slot per logical stream key holds the most recent raw payload, from
//! whichever transport delivered it last. Lists are recomputed from these
//! slots, so a push update and a poll update for the same stream simply
//! overwrite each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulse_core::CanonicalRow;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Where a slot's payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    /// Push channel or polling.
    Live,
    /// Restored from the session cache at startup.
    Cache,
}

/// The latest payload for one stream key.
#[derive(Debug, Clone)]
pub struct Slot {
    pub payload: Arc<Value>,
    pub received_at: DateTime<Utc>,
    pub source: SlotSource,
    received_mono: Instant,
}

impl Slot {
    fn new(payload: Arc<Value>, source: SlotSource) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
            source,
            received_mono: Instant::now(),
        }
    }

    /// Age in milliseconds (monotonic).
    pub fn age_ms(&self) -> i64 {
        self.received_mono.elapsed().as_millis() as i64
    }
}

/// Latest payload per stream key.
#[derive(Debug, Default)]
pub struct LatestSlots {
    slots: DashMap<String, Slot>,
}

impl LatestSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a live payload, replacing whatever the slot held.
    pub fn update(&self, key: &str, payload: Arc<Value>) {
        self.slots
            .insert(key.to_string(), Slot::new(payload, SlotSource::Live));
    }

    /// Store a cached payload unless live data already arrived.
    ///
    /// Returns `true` when the slot was primed.
    pub fn prime(&self, key: &str, payload: Arc<Value>) -> bool {
        let mut primed = false;
        self.slots.entry(key.to_string()).or_insert_with(|| {
            primed = true;
            Slot::new(payload, SlotSource::Cache)
        });
        if primed {
            debug!(key = %key, "Primed slot from session cache");
        }
        primed
    }

    pub fn get(&self, key: &str) -> Option<Slot> {
        self.slots.get(key).map(|slot| slot.clone())
    }

    /// The first key in `keys` that has a slot.
    pub fn first_of(&self, keys: &[String]) -> Option<(String, Slot)> {
        keys.iter()
            .find_map(|k| self.get(k).map(|slot| (k.clone(), slot)))
    }

    /// Live payloads only, for persisting to the session cache.
    pub fn live_snapshot(&self) -> Vec<(String, Arc<Value>)> {
        self.slots
            .iter()
            .filter(|entry| entry.source == SlotSource::Live)
            .map(|entry| (entry.key().clone(), entry.payload.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Latest known price per canonical symbol.
#[derive(Debug, Default)]
pub struct PriceBook {
    prices: DashMap<String, f64>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every priced row. Returns how many prices were updated.
    pub fn apply(&self, rows: &[CanonicalRow]) -> usize {
        let mut updated = 0;
        for row in rows {
            if let Some(price) = row.price {
                self.prices.insert(row.symbol.clone(), price);
                updated += 1;
            }
        }
        updated
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).map(|p| *p)
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.prices
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

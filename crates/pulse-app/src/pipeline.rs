//! Mover pipeline: normalize, rank, reconcile, publish.
//!
//! Every table update is filed under its stream key, normalized once, fed to
//! the price book and then re-ranked into each list that reads that key. The
//! latest arrival wins: a list is recomputed from whichever of its keys was
//! just updated, against the list it published last.

use crate::config::ListSpec;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use pulse_core::{canonical_symbol, RankedEntry, RankedList};
use pulse_feed::{normalize_with, Envelope, LatestSlots, PriceBook, UnitHint};
use pulse_movers::{rank, reconcile_with_stats, RankOptions};
use pulse_persistence::WatchlistStore;
use pulse_telemetry::Metrics;
use pulse_transport::TablePayload;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Stream label used for `price_update` metrics.
const PRICE_STREAM: &str = "price_update";

struct ListChannel {
    spec: ListSpec,
    options: RankOptions,
    tx: watch::Sender<RankedList>,
}

/// A watchlist entry joined with the live price.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchlistRow {
    pub symbol: String,
    pub baseline_price: Option<f64>,
    pub price: Option<f64>,
    /// Change since the symbol was added, in percent.
    pub delta_pct: Option<f64>,
    pub added_at: DateTime<Utc>,
}

pub struct MoverPipeline {
    lists: Vec<ListChannel>,
    slots: LatestSlots,
    prices: PriceBook,
    watchlist: Arc<WatchlistStore>,
    unit_hint: UnitHint,
    flat_stream_key: String,
}

impl MoverPipeline {
    pub fn new(
        specs: &[ListSpec],
        unit_hint: UnitHint,
        flat_stream_key: impl Into<String>,
        watchlist: Arc<WatchlistStore>,
    ) -> Self {
        let lists = specs
            .iter()
            .map(|spec| ListChannel {
                options: spec.rank_options(),
                spec: spec.clone(),
                tx: watch::Sender::new(RankedList::new()),
            })
            .collect();

        Self {
            lists,
            slots: LatestSlots::new(),
            prices: PriceBook::new(),
            watchlist,
            unit_hint,
            flat_stream_key: flat_stream_key.into(),
        }
    }

    /// Handle a `tables:update` from push or poll.
    pub fn handle_tables(&self, payload: &TablePayload) {
        match payload {
            TablePayload::Flat(table) => {
                self.slots.update(&self.flat_stream_key, table.clone());
                self.ingest(&self.flat_stream_key, table);
            }
            TablePayload::Keyed(tables) => {
                for (key, table) in tables {
                    self.slots.update(key, table.clone());
                    self.ingest(key, table);
                }
            }
        }
    }

    /// Handle a `price_update`. Prices only; no list is re-ranked.
    pub fn handle_prices(&self, payload: &Value) {
        let rows = normalize_with(payload, self.unit_hint);
        Metrics::rows_normalized(PRICE_STREAM, Envelope::decode(payload).len(), rows.len());
        let updated = self.prices.apply(&rows);
        trace!(updated, "Applied price update");
    }

    /// Seed slots from a previous session. Keys that already received live
    /// data are left alone. Returns how many keys were primed.
    pub fn prime<I>(&self, cached: I) -> usize
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut primed = 0;
        for (key, payload) in cached {
            let payload = Arc::new(payload);
            if self.slots.prime(&key, payload.clone()) {
                self.ingest(&key, &payload);
                primed += 1;
            }
        }
        primed
    }

    pub fn subscribe_list(&self, name: &str) -> AppResult<watch::Receiver<RankedList>> {
        Ok(self.channel(name)?.tx.subscribe())
    }

    pub fn current_list(&self, name: &str) -> AppResult<RankedList> {
        Ok(self.channel(name)?.tx.borrow().clone())
    }

    pub fn list_names(&self) -> Vec<&str> {
        self.lists.iter().map(|l| l.spec.name.as_str()).collect()
    }

    /// Latest known price for `symbol`.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.price(&canonical_symbol(symbol)?)
    }

    /// Add or remove `symbol`, anchoring a new entry at the live price.
    /// Returns whether the symbol is now watched.
    pub fn toggle_watch(&self, symbol: &str) -> bool {
        let watched = self.watchlist.toggle(symbol, self.price(symbol));
        Metrics::watchlist_size(self.watchlist.len());
        watched
    }

    /// Watchlist entries with their live change against the baseline.
    pub fn watchlist_view(&self) -> Vec<WatchlistRow> {
        self.watchlist
            .entries()
            .into_iter()
            .map(|entry| {
                let price = self.prices.price(&entry.symbol);
                WatchlistRow {
                    delta_pct: price.and_then(|p| entry.delta_pct(p)),
                    symbol: entry.symbol,
                    baseline_price: entry.baseline_price,
                    price,
                    added_at: entry.added_at,
                }
            })
            .collect()
    }

    /// Live payloads, for the session cache.
    pub fn session_snapshot(&self) -> Vec<(String, Arc<Value>)> {
        self.slots.live_snapshot()
    }

    pub fn slots(&self) -> &LatestSlots {
        &self.slots
    }

    fn channel(&self, name: &str) -> AppResult<&ListChannel> {
        self.lists
            .iter()
            .find(|l| l.spec.name == name)
            .ok_or_else(|| AppError::UnknownList(name.to_string()))
    }

    fn ingest(&self, key: &str, payload: &Value) {
        let rows = normalize_with(payload, self.unit_hint);
        Metrics::rows_normalized(key, Envelope::decode(payload).len(), rows.len());
        self.prices.apply(&rows);

        for list in self.lists.iter().filter(|l| l.spec.reads(key)) {
            let prev = list.tx.borrow().clone();
            let ranked = rank(&rows, &prev, &list.options);
            let (next, stats) = reconcile_with_stats(&ranked, &prev);

            Metrics::list_published(&list.spec.name, next.len(), stats.reused);
            debug!(
                list = %list.spec.name,
                key = %key,
                len = next.len(),
                reused = stats.reused,
                "Mover list recomputed"
            );

            list.tx.send_if_modified(|current| {
                if same_rows(current, &next) {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }
    }
}

/// Identical lists share every row by pointer.
fn same_rows(a: &[Arc<RankedEntry>], b: &[Arc<RankedEntry>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::MoverVariant;
    use pulse_persistence::MemoryStore;
    use serde_json::json;

    fn pipeline() -> MoverPipeline {
        let specs = vec![
            ListSpec::new("gainers_1m", MoverVariant::Gainers).with_keys(&["t1m"]),
            ListSpec::new("gainers_3m", MoverVariant::Gainers).with_keys(&["t3m"]),
            ListSpec::new("losers_3m", MoverVariant::Losers).with_keys(&["t3m"]),
        ];
        let watchlist = Arc::new(WatchlistStore::load(Arc::new(MemoryStore::new())));
        MoverPipeline::new(&specs, UnitHint::Percent, "t1m", watchlist)
    }

    fn symbols(list: &RankedList) -> Vec<&str> {
        list.iter().map(|e| e.symbol.as_str()).collect()
    }

    #[test]
    fn test_flat_update_goes_to_flat_key() {
        let p = pipeline();
        p.handle_tables(&TablePayload::Flat(Arc::new(json!([
            {"symbol": "BTC-USD", "price": 100.0, "change": 2.0},
            {"symbol": "ETH", "price": 10.0, "change": 5.0},
        ]))));

        let list = p.current_list("gainers_1m").unwrap();
        assert_eq!(symbols(&list), vec!["ETH", "BTC"]);
        assert!(p.current_list("gainers_3m").unwrap().is_empty());
        assert_eq!(p.price("btc-usd"), Some(100.0));
    }

    #[test]
    fn test_shared_window_splits_by_direction() {
        let p = pipeline();
        p.handle_tables(&TablePayload::keyed(
            "t3m",
            json!([
                {"symbol": "A", "change": 3.0},
                {"symbol": "B", "change": -4.0},
                {"symbol": "C", "change": -1.0},
            ]),
        ));

        assert_eq!(symbols(&p.current_list("gainers_3m").unwrap()), vec!["A"]);
        assert_eq!(symbols(&p.current_list("losers_3m").unwrap()), vec!["B", "C"]);
        assert!(p.current_list("gainers_1m").unwrap().is_empty());
    }

    #[test]
    fn test_symbol_flipping_direction_moves_lists() {
        let p = pipeline();
        p.handle_tables(&TablePayload::keyed(
            "t3m",
            json!([{"symbol": "A", "change": 3.0}, {"symbol": "B", "change": 2.0}]),
        ));
        p.handle_tables(&TablePayload::keyed(
            "t3m",
            json!([{"symbol": "A", "change": 1.0}, {"symbol": "B", "change": -1.0}]),
        ));

        assert_eq!(symbols(&p.current_list("gainers_3m").unwrap()), vec!["A"]);
        assert_eq!(symbols(&p.current_list("losers_3m").unwrap()), vec!["B"]);
    }

    #[test]
    fn test_unchanged_update_does_not_notify() {
        let p = pipeline();
        let payload = TablePayload::keyed("t1m", json!([{"symbol": "A", "change": 1.0}]));
        p.handle_tables(&payload);

        let mut rx = p.subscribe_list("gainers_1m").unwrap();
        let _ = rx.borrow_and_update();
        p.handle_tables(&payload);
        assert!(!rx.has_changed().unwrap());

        p.handle_tables(&TablePayload::keyed(
            "t1m",
            json!([{"symbol": "A", "change": 2.0}]),
        ));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_unchanged_rows_keep_identity() {
        let p = pipeline();
        p.handle_tables(&TablePayload::keyed(
            "t1m",
            json!([{"symbol": "A", "change": 5.0}, {"symbol": "B", "change": 3.0}]),
        ));
        let before = p.current_list("gainers_1m").unwrap();

        p.handle_tables(&TablePayload::keyed(
            "t1m",
            json!([{"symbol": "A", "change": 5.0}, {"symbol": "B", "change": 4.0}]),
        ));
        let after = p.current_list("gainers_1m").unwrap();

        assert!(Arc::ptr_eq(&before[0], &after[0]));
        assert!(!Arc::ptr_eq(&before[1], &after[1]));
    }

    #[test]
    fn test_prime_does_not_override_live() {
        let p = pipeline();
        p.handle_tables(&TablePayload::keyed(
            "t1m",
            json!([{"symbol": "LIVE", "change": 1.0}]),
        ));

        let primed = p.prime(vec![
            ("t1m".to_string(), json!([{"symbol": "OLD", "change": 9.0}])),
            ("t3m".to_string(), json!([{"symbol": "C", "change": 2.0}])),
        ]);

        assert_eq!(primed, 1);
        assert_eq!(symbols(&p.current_list("gainers_1m").unwrap()), vec!["LIVE"]);
        assert_eq!(symbols(&p.current_list("gainers_3m").unwrap()), vec!["C"]);
        // Cached payloads are not written back as live data.
        let snapshot = p.session_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "t1m");
    }

    #[test]
    fn test_watchlist_view_uses_live_price() {
        let p = pipeline();
        p.handle_prices(&json!({"BTC": 100.0}));
        assert!(p.toggle_watch("btc"));

        p.handle_prices(&json!([{"symbol": "BTC", "price": 110.0}]));
        let view = p.watchlist_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].baseline_price, Some(100.0));
        assert_eq!(view[0].price, Some(110.0));
        let delta = view[0].delta_pct.unwrap();
        assert!((delta - 10.0).abs() < 1e-9);

        assert!(!p.toggle_watch("BTC"));
        assert!(p.watchlist_view().is_empty());
    }

    #[test]
    fn test_unknown_list() {
        let p = pipeline();
        assert!(matches!(p.current_list("nope"), Err(AppError::UnknownList(_))));
        assert!(p.subscribe_list("nope").is_err());
        assert_eq!(p.list_names(), vec!["gainers_1m", "gainers_3m", "losers_3m"]);
    }
}

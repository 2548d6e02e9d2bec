//! End-to-end mover scenarios: raw payload in, ranked and reconciled list out.

use pulse_core::{MoverVariant, RankedList};
use pulse_feed::normalize;
use pulse_movers::{rank, reconcile, RankOptions};
use serde_json::json;
use std::sync::Arc;

fn summary(list: &RankedList) -> Vec<(String, f64, u32)> {
    list.iter()
        .map(|e| (e.symbol.clone(), e.change_pct, e.rank))
        .collect()
}

#[test]
fn test_duplicate_symbols_across_spellings() {
    let rows = normalize(&json!([
        {"symbol": "BTC-USD", "price": 100, "change": 2},
        {"symbol": "btc-usd", "price": 101, "change": 6}
    ]));
    let list = rank(&rows, &[], &RankOptions::default());

    assert_eq!(list.len(), 1);
    assert_eq!(list[0].symbol, "BTC");
    assert_eq!(list[0].change_pct, 6.0);
    assert_eq!(list[0].price, Some(101.0));
}

#[test]
fn test_sparse_update_continuity() {
    let opts = RankOptions {
        variant: MoverVariant::Gainers,
        limit: 3,
        continuity: true,
    };
    let prev = rank(
        &normalize(&json!([
            {"symbol": "BTC", "change_pct": 5},
            {"symbol": "ETH", "change_pct": 3}
        ])),
        &[],
        &opts,
    );

    let next = rank(
        &normalize(&json!([{"symbol": "SOL", "change_pct": 9}])),
        &prev,
        &opts,
    );

    assert_eq!(
        summary(&next),
        vec![
            ("SOL".to_string(), 9.0, 1),
            ("BTC".to_string(), 5.0, 2),
            ("ETH".to_string(), 3.0, 3)
        ]
    );
}

#[test]
fn test_losers_ordering() {
    let opts = RankOptions {
        variant: MoverVariant::Losers,
        limit: 2,
        continuity: false,
    };
    let list = rank(
        &normalize(&json!([
            {"symbol": "A", "change_pct": -1},
            {"symbol": "B", "change_pct": -9},
            {"symbol": "C", "change_pct": 2}
        ])),
        &[],
        &opts,
    );

    assert_eq!(
        summary(&list),
        vec![("B".to_string(), -9.0, 1), ("A".to_string(), -1.0, 2)]
    );
}

#[test]
fn test_gainers_only_window_yields_no_losers() {
    let losers = RankOptions {
        variant: MoverVariant::Losers,
        ..RankOptions::default()
    };
    let window = normalize(&json!({"rows": [
        {"symbol": "X", "change_pct": 5},
        {"symbol": "Y", "change_pct": 9}
    ]}));

    assert!(rank(&window, &[], &losers).is_empty());
    assert_eq!(rank(&window, &[], &RankOptions::default()).len(), 2);
}

#[test]
fn test_unchanged_rows_keep_identity_across_updates() {
    let opts = RankOptions {
        limit: 3,
        ..RankOptions::default()
    };
    let payload = json!({"data": [
        {"symbol": "BTC", "price": 100, "change_pct": 5},
        {"symbol": "ETH", "price": 10, "change_pct": 3}
    ]});

    let first = rank(&normalize(&payload), &[], &opts);
    let first = reconcile(&first, &[]);

    // Same payload again: every row is reused.
    let second = rank(&normalize(&payload), &first, &opts);
    let second = reconcile(&second, &first);
    assert!(second.iter().zip(&first).all(|(a, b)| Arc::ptr_eq(a, b)));

    // ETH moves: BTC is reused, ETH is not.
    let moved = json!([
        {"symbol": "BTC", "price": 100, "change_pct": 5},
        {"symbol": "ETH", "price": 11, "change_pct": 4}
    ]);
    let third = reconcile(&rank(&normalize(&moved), &second, &opts), &second);
    assert!(Arc::ptr_eq(&third[0], &second[0]));
    assert!(!Arc::ptr_eq(&third[1], &second[1]));
    assert_eq!(third[1].peak_count, 1);
}

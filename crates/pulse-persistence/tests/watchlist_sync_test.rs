//! Watchlist persistence and cross-context sync.

use pulse_persistence::{
    ChangeObserver, JsonFileStore, KeyValueStore, MemoryStore, WatchlistStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let ok = tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "timed out waiting for {what}");
}

#[test]
fn test_baseline_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let backend = Arc::new(JsonFileStore::open(dir.path()).unwrap());
        let store = WatchlistStore::load(backend);
        store.add("ETH", Some(2000.0));
    }

    let backend = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let store = WatchlistStore::load(backend);
    let entry = store.baseline_for("ETH").expect("entry persisted");
    assert_eq!(entry.baseline_price, Some(2000.0));
}

#[test]
fn test_toggle_twice_persists_removal() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(JsonFileStore::open(dir.path()).unwrap());

    let store = WatchlistStore::load(backend.clone());
    store.toggle("ETH", Some(2000.0));
    store.toggle("ETH", Some(2100.0));
    assert!(!store.has("ETH"));

    let reloaded = WatchlistStore::load(backend);
    assert!(!reloaded.has("ETH"));
}

#[tokio::test]
async fn test_memory_contexts_converge() {
    let tab_a = Arc::new(MemoryStore::new());
    let tab_b = Arc::new(tab_a.open_context());

    let store_a = Arc::new(WatchlistStore::load(tab_a.clone()));
    let store_b = Arc::new(WatchlistStore::load(tab_b.clone()));

    let token = CancellationToken::new();
    let observer_a: Arc<dyn ChangeObserver> = tab_a;
    let observer_b: Arc<dyn ChangeObserver> = tab_b;
    let sync_a = store_a.clone().spawn_sync(observer_a, token.clone());
    let sync_b = store_b.clone().spawn_sync(observer_b, token.clone());

    store_a.add("BTC", Some(100.0));
    eventually("tab b sees BTC", || store_b.has("BTC")).await;

    store_b.remove("BTC");
    store_b.add("SOL", Some(20.0));
    eventually("tab a sees SOL", || store_a.has("SOL") && !store_a.has("BTC")).await;

    token.cancel();
    sync_a.await.unwrap();
    sync_b.await.unwrap();
}

#[tokio::test]
async fn test_file_watcher_refreshes_other_process() {
    let dir = TempDir::new().unwrap();

    let ours = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let store = Arc::new(WatchlistStore::load(ours.clone()));
    let watcher = Arc::new(ours.watcher(
        vec![pulse_persistence::WATCHLIST_KEY.to_string()],
        Duration::from_millis(20),
    ));

    let token = CancellationToken::new();
    let poll = watcher.clone().spawn(token.clone());
    let observer: Arc<dyn ChangeObserver> = watcher;
    let sync = store.clone().spawn_sync(observer, token.clone());

    // A second process writes the same key.
    let theirs = JsonFileStore::open(dir.path()).unwrap();
    theirs
        .set(
            pulse_persistence::WATCHLIST_KEY,
            r#"{"DOGE":{"price":0.1,"at":1700000000000}}"#,
        )
        .unwrap();

    eventually("watcher picks up DOGE", || store.has("DOGE")).await;
    assert_eq!(store.baseline_for("DOGE").unwrap().baseline_price, Some(0.1));

    token.cancel();
    poll.await.unwrap();
    sync.await.unwrap();
}

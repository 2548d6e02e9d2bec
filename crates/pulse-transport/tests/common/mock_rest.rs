//! Mock REST backend serving mover snapshots.
//!
//! `/api/slow` answers only after [`SLOW_RESPONSE`], for overrun tests.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const SLOW_RESPONSE: Duration = Duration::from_millis(500);

pub struct MockRestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

async fn gainers(State(hits): State<Arc<AtomicUsize>>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "data": [
            {"symbol": "BTC-USD", "current_price": 100.0, "price_change_percentage_1min": 2.5},
            {"symbol": "ETH-USD", "current_price": 10.0, "price_change_percentage_1min": 1.0}
        ]
    }))
}

async fn slow(State(hits): State<Arc<AtomicUsize>>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(SLOW_RESPONSE).await;
    Json(json!({"data": []}))
}

impl MockRestServer {
    pub async fn start() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/component/gainers-table-1min", get(gainers))
            .route("/api/slow", get(slow))
            .with_state(hits.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, hits, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

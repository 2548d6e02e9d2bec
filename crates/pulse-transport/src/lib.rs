//! Market data transport for pulse.
//!
//! Provides the client side of the movers backend:
//! - One push channel (WebSocket or SSE) with exponential-backoff reconnects
//! - Liveness tracking that degrades a silent channel to REST polling
//! - REST polling fallback once the reconnect budget is spent
//! - A typed event bus routing named wire events to subscribers

pub mod connection;
pub mod error;
pub mod event_bus;
pub mod liveness;
pub mod message;
pub mod poller;
pub mod sse;

pub use connection::{
    calculate_backoff_delay, ConnectionConfig, ConnectionManager, ConnectionState,
    NetworkQuality, PushKind, Visibility,
};
pub use error::{TransportError, TransportResult};
pub use event_bus::{EventBus, StreamEvent, Subscription};
pub use liveness::LivenessMonitor;
pub use message::{
    ConnectionEvent, ConnectionStatus, PollOutcome, PollTick, PriceUpdate, PushMessage,
    TablePayload, TablesUpdate,
};
pub use poller::{PollEndpoint, Poller};
pub use sse::{SseDecoder, SseEvent};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

//! Typed publish/subscribe bus.
//!
//! Each event type names itself and its payload through [`StreamEvent`], so a
//! subscriber receives `&E::Payload` rather than untyped JSON. Named events
//! arriving off the wire are routed with [`EventBus::dispatch_raw`], which
//! decodes the JSON once per event and fans the typed payload out to every
//! subscriber of that name.

use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// A named logical event with a typed payload.
pub trait StreamEvent: 'static {
    /// Event name on the wire (e.g. `"tables:update"`).
    const NAME: &'static str;
    /// Payload handed to subscribers.
    type Payload: Send + Sync + 'static;

    /// Decode a wire payload. `None` drops the message.
    fn decode(data: &Value) -> Option<Self::Payload>;
}

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type WireDecoder = Arc<dyn Fn(&EventBus, &Value) + Send + Sync>;

struct HandlerSlot {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<&'static str, Vec<HandlerSlot>>>,
    decoders: RwLock<HashMap<&'static str, WireDecoder>>,
    next_id: AtomicU64,
}

/// Cheaply clonable event bus. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `E`.
    ///
    /// The callback runs on whichever task publishes the event and must not
    /// block. Dropping the returned [`Subscription`] keeps the callback
    /// registered; call [`Subscription::unsubscribe`] to remove it.
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: StreamEvent,
        F: Fn(&E::Payload) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let handler: Handler = Arc::new(move |payload: &dyn Any| {
            if let Some(payload) = payload.downcast_ref::<E::Payload>() {
                callback(payload);
            }
        });

        self.inner
            .handlers
            .write()
            .entry(E::NAME)
            .or_default()
            .push(HandlerSlot { id, handler });

        let decoder: WireDecoder = Arc::new(|bus: &EventBus, data: &Value| match E::decode(data) {
            Some(payload) => {
                bus.publish::<E>(&payload);
            }
            None => debug!(event = E::NAME, "Dropping undecodable payload"),
        });
        self.inner
            .decoders
            .write()
            .entry(E::NAME)
            .or_insert(decoder);

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event: E::NAME,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver a typed payload to every subscriber of `E`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn publish<E: StreamEvent>(&self, payload: &E::Payload) -> usize {
        // Clone handlers out so callbacks may (un)subscribe re-entrantly.
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .get(E::NAME)
            .map(|slots| slots.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload as &dyn Any);
        }

        trace!(event = E::NAME, receivers = handlers.len(), "Published event");
        handlers.len()
    }

    /// Route a named wire payload to its typed subscribers.
    ///
    /// Returns `false` when nothing has ever subscribed to `name`.
    pub fn dispatch_raw(&self, name: &str, data: &Value) -> bool {
        let decoder = self.inner.decoders.read().get(name).cloned();
        match decoder {
            Some(decoder) => {
                decoder(self, data);
                true
            }
            None => {
                trace!(event = %name, "No subscribers for wire event");
                false
            }
        }
    }

    /// Number of live subscribers for an event name.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<BusInner>,
    event: &'static str,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the callback. Calling this more than once is a no-op, as is
    /// calling it after the bus is gone.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            if let Some(slots) = inner.handlers.write().get_mut(self.event) {
                slots.retain(|slot| slot.id != self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn event(&self) -> &'static str {
        self.event
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

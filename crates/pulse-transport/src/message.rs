//! Wire messages and the logical events carried on the bus.
//!
//! Push frames name their event in one of a few keys depending on the
//! backend build: `{"event": ..., "data": ...}`, `{"type": ..., "payload": ...}`
//! or `{"channel": ..., "data": ...}`. [`PushMessage`] accepts all of them.

use crate::connection::ConnectionState;
use crate::error::{TransportError, TransportResult};
use crate::event_bus::StreamEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

const NAME_KEYS: &[&str] = &["event", "type", "channel"];
const DATA_KEYS: &[&str] = &["data", "payload"];

/// A named event received on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub event: String,
    pub data: Value,
}

impl PushMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> TransportResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
            .ok_or_else(|| TransportError::ParseError("frame has no event name".to_string()))
    }

    /// Extract the event name and payload from a decoded frame.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            return None;
        };

        let event = NAME_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str).map(str::to_string))?;
        let data = DATA_KEYS
            .iter()
            .find_map(|k| map.remove(*k))
            .unwrap_or(Value::Null);

        Some(Self { event, data })
    }

    /// Encode an outbound frame.
    pub fn to_text(&self) -> TransportResult<String> {
        let mut map = Map::new();
        map.insert("event".to_string(), Value::String(self.event.clone()));
        map.insert("data".to_string(), self.data.clone());
        Ok(serde_json::to_string(&Value::Object(map))?)
    }
}

/// Table payload: either one flat table or tables keyed by stream/window id.
#[derive(Debug, Clone, PartialEq)]
pub enum TablePayload {
    /// A table without a window key (bare array or `{data}`/`{rows}` envelope).
    Flat(Arc<Value>),
    /// Tables keyed by window id (`t1m`, `t3m`) or poll stream key.
    Keyed(Vec<(String, Arc<Value>)>),
}

impl TablePayload {
    pub fn keyed(key: impl Into<String>, value: Value) -> Self {
        Self::Keyed(vec![(key.into(), Arc::new(value))])
    }

    fn from_wire(data: &Value) -> Option<Self> {
        match data {
            Value::Array(_) => Some(Self::Flat(Arc::new(data.clone()))),
            Value::Object(map) if map.contains_key("data") || map.contains_key("rows") => {
                Some(Self::Flat(Arc::new(data.clone())))
            }
            Value::Object(map) => Some(Self::Keyed(
                map.iter()
                    .map(|(k, v)| (k.clone(), Arc::new(v.clone())))
                    .collect(),
            )),
            _ => None,
        }
    }
}

/// `tables:update`: mover tables from push or poll.
pub struct TablesUpdate;

impl StreamEvent for TablesUpdate {
    const NAME: &'static str = "tables:update";
    type Payload = TablePayload;

    fn decode(data: &Value) -> Option<TablePayload> {
        TablePayload::from_wire(data)
    }
}

/// `price_update`: live prices, shape left to the normalizer.
pub struct PriceUpdate;

impl StreamEvent for PriceUpdate {
    const NAME: &'static str = "price_update";
    type Payload = Arc<Value>;

    fn decode(data: &Value) -> Option<Arc<Value>> {
        if data.is_null() {
            None
        } else {
            Some(Arc::new(data.clone()))
        }
    }
}

/// Connection status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub status: ConnectionState,
    /// Reconnect attempt the status refers to (0 outside reconnects).
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `connection`: emitted on every state transition.
pub struct ConnectionStatus;

impl StreamEvent for ConnectionStatus {
    const NAME: &'static str = "connection";
    type Payload = ConnectionEvent;

    fn decode(data: &Value) -> Option<ConnectionEvent> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Outcome of one polling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// The tick overran its interval and its requests were aborted.
    pub aborted: bool,
}

/// `poll:tick`: emitted after each polling tick.
pub struct PollTick;

impl StreamEvent for PollTick {
    const NAME: &'static str = "poll:tick";
    type Payload = PollOutcome;

    fn decode(data: &Value) -> Option<PollOutcome> {
        serde_json::from_value(data.clone()).ok()
    }
}

//! Server-Sent Events decoding.
//!
//! Incremental decoder for `text/event-stream` bodies. Chunks may split lines
//! (and UTF-8 sequences) anywhere; complete events are returned as soon as
//! their terminating blank line arrives.

use crate::message::PushMessage;
use serde_json::Value;

const DEFAULT_EVENT: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Convert to a bus message.
    ///
    /// Unnamed events whose data is itself an `{event, data}` frame are
    /// unwrapped, so backends that tunnel WebSocket-style frames over SSE
    /// route the same way. Non-JSON data is passed through as a string.
    pub fn into_push_message(self) -> PushMessage {
        let data = serde_json::from_str::<Value>(&self.data)
            .unwrap_or_else(|_| Value::String(self.data.clone()));

        if self.event == DEFAULT_EVENT {
            if let Some(inner) = PushMessage::from_value(data.clone()) {
                return inner;
            }
        }
        PushMessage::new(self.event, data)
    }
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            // `retry` is the server's reconnect hint; backoff is ours to own.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_event() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b"event: tables:update\ndata: [1,2]\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "tables:update");
        assert_eq!(events[0].data, "[1,2]");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: price_upd").is_empty());
        assert!(dec.push(b"ate\r\ndata: {\"BTC\"").is_empty());
        let events = dec.push(b": 1}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "price_update");
        assert_eq!(events[0].data, "{\"BTC\": 1}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": keepalive\ndata: a\ndata: b\nid: 42\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn test_blank_line_without_data_dispatches_nothing() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: noop\n\n").is_empty());
        // The orphaned event name must not leak into the next event.
        let events = dec.push(b"data: 1\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_unwraps_tunnelled_frame() {
        let event = SseEvent {
            event: "message".to_string(),
            data: r#"{"event":"tables:update","data":{"t1m":[]}}"#.to_string(),
            id: None,
        };
        let msg = event.into_push_message();
        assert_eq!(msg.event, "tables:update");
        assert_eq!(msg.data, json!({"t1m": []}));
    }

    #[test]
    fn test_named_event_keeps_payload() {
        let event = SseEvent {
            event: "price_update".to_string(),
            data: "not-json".to_string(),
            id: None,
        };
        let msg = event.into_push_message();
        assert_eq!(msg.event, "price_update");
        assert_eq!(msg.data, json!("not-json"));
    }
}

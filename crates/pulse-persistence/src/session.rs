//! Session snapshot cache.
//!
//! Keeps the last payload per stream key in a file under the temp directory
//! so a restart can show the previous lists before the first live update.
//! The cache is disposable: anything unreadable or older than `max_age` is
//! treated as empty.

use crate::error::PersistenceResult;
use crate::file_store::write_atomic;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    /// Unix milliseconds.
    saved_at: i64,
    streams: Map<String, Value>,
}

pub struct SessionCache {
    path: PathBuf,
    max_age: Duration,
}

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    /// Cache file named after `name` in the OS temp directory.
    pub fn in_temp_dir(name: &str, max_age: Duration) -> Self {
        Self::new(
            std::env::temp_dir().join(format!("pulse-{name}-session.json")),
            max_age,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached payloads, or nothing if the cache is missing, corrupt or stale.
    pub fn load(&self) -> Vec<(String, Value)> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Failed to read session cache");
                return Vec::new();
            }
        };

        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Corrupt session cache, ignoring");
                return Vec::new();
            }
        };

        let age_ms = Utc::now().timestamp_millis() - snapshot.saved_at;
        if age_ms < 0 || age_ms as u128 > self.max_age.as_millis() {
            debug!(age_ms, "Session cache expired");
            return Vec::new();
        }

        snapshot.streams.into_iter().collect()
    }

    pub fn save(&self, streams: &[(String, Arc<Value>)]) -> PersistenceResult<()> {
        let snapshot = Snapshot {
            saved_at: Utc::now().timestamp_millis(),
            streams: streams
                .iter()
                .map(|(key, payload)| (key.clone(), Value::clone(payload)))
                .collect(),
        };
        write_atomic(&self.path, &serde_json::to_string(&snapshot)?)?;
        debug!(streams = streams.len(), "Session cache saved");
        Ok(())
    }

    pub fn clear(&self) -> PersistenceResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = SessionCache::new(dir.path().join("s.json"), Duration::from_secs(60));

        cache
            .save(&[("t1m".to_string(), Arc::new(json!([{"symbol": "BTC"}])))])
            .unwrap();

        let loaded = cache.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "t1m");
        assert_eq!(loaded[0].1, json!([{"symbol": "BTC"}]));
    }

    #[test]
    fn test_missing_and_corrupt_are_empty() {
        let dir = TempDir::new().unwrap();
        let cache = SessionCache::new(dir.path().join("s.json"), Duration::from_secs(60));
        assert!(cache.load().is_empty());

        fs::write(cache.path(), "garbage").unwrap();
        assert!(cache.load().is_empty());
    }

    #[test]
    fn test_expired_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = SessionCache::new(dir.path().join("s.json"), Duration::from_secs(60));
        let old = json!({
            "saved_at": Utc::now().timestamp_millis() - 120_000,
            "streams": {"t1m": []}
        });
        fs::write(cache.path(), old.to_string()).unwrap();
        assert!(cache.load().is_empty());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let cache = SessionCache::new(dir.path().join("s.json"), Duration::from_secs(60));
        cache.save(&[]).unwrap();
        cache.clear().unwrap();
        cache.clear().unwrap();
        assert!(!cache.path().exists());
    }
}

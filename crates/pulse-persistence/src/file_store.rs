//! JSON file backend.
//!
//! One file per key under a base directory. Writes go to a temp file that is
//! renamed over the target, so readers in other processes never see a torn
//! value. [`FileChangeWatcher`] polls the files for changes made elsewhere.

use crate::error::{PersistenceError, PersistenceResult};
use crate::store::{
    next_context_id, ChangeObserver, ContextId, KeyValueStore, StorageChange, EXTERNAL_CONTEXT,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Write `contents` to `path` via temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> PersistenceResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("value");
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Last value each key was written with by this process.
type OwnWrites = Arc<Mutex<HashMap<String, Option<String>>>>;

/// Key/value store backed by one JSON file per key.
pub struct JsonFileStore {
    dir: PathBuf,
    context: ContextId,
    own_writes: OwnWrites,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Opened JSON file store");
        Ok(Self {
            dir,
            context: next_context_id(),
            own_writes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`.
    pub fn path_for(&self, key: &str) -> PersistenceResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// A watcher reporting changes to `keys` made outside this store.
    pub fn watcher(&self, keys: Vec<String>, interval: Duration) -> FileChangeWatcher {
        FileChangeWatcher::new(self, keys, interval)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> PersistenceResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> PersistenceResult<()> {
        let path = self.path_for(key)?;
        write_atomic(&path, value)?;
        self.own_writes
            .lock()
            .insert(key.to_string(), Some(value.to_string()));
        debug!(key = %key, bytes = value.len(), "Wrote key");
        Ok(())
    }

    fn remove(&self, key: &str) -> PersistenceResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.own_writes.lock().insert(key.to_string(), None);
        Ok(())
    }
}

/// File fingerprint: modification time and length, `None` when absent.
type Fingerprint = Option<(SystemTime, u64)>;

struct WatchedKey {
    key: String,
    path: PathBuf,
    fingerprint: Fingerprint,
    last_value: Option<String>,
}

/// Polls watched key files and broadcasts changes made by other processes.
///
/// Writes made through the originating [`JsonFileStore`] are recognized and
/// not reported.
pub struct FileChangeWatcher {
    watched: Mutex<Vec<WatchedKey>>,
    own_writes: OwnWrites,
    context: ContextId,
    interval: Duration,
    changes: broadcast::Sender<StorageChange>,
}

impl FileChangeWatcher {
    fn new(store: &JsonFileStore, keys: Vec<String>, interval: Duration) -> Self {
        let watched = keys
            .into_iter()
            .filter_map(|key| match store.path_for(&key) {
                Ok(path) => {
                    let fingerprint = fingerprint(&path);
                    let last_value = fs::read_to_string(&path).ok();
                    Some(WatchedKey {
                        key,
                        path,
                        fingerprint,
                        last_value,
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Not watching invalid key");
                    None
                }
            })
            .collect();

        let (changes, _) = broadcast::channel(64);
        Self {
            watched: Mutex::new(watched),
            own_writes: Arc::clone(&store.own_writes),
            context: store.context,
            interval,
            changes,
        }
    }

    /// Check every watched file once, broadcasting and returning the
    /// external changes found.
    pub fn poll_once(&self) -> Vec<StorageChange> {
        let mut found = Vec::new();
        let mut watched = self.watched.lock();

        for entry in watched.iter_mut() {
            let current = fingerprint(&entry.path);
            if current == entry.fingerprint {
                continue;
            }
            entry.fingerprint = current;

            let value = fs::read_to_string(&entry.path).ok();
            if value == entry.last_value {
                continue;
            }
            entry.last_value = value.clone();

            let own = self.own_writes.lock().get(&entry.key).cloned();
            if own.as_ref() == Some(&value) {
                continue;
            }

            found.push(StorageChange {
                key: entry.key.clone(),
                new_value: value,
                origin: EXTERNAL_CONTEXT,
            });
        }
        drop(watched);

        for change in &found {
            debug!(key = %change.key, "External storage change detected");
            let _ = self.changes.send(change.clone());
        }
        found
    }

    /// Poll until cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once();
                    }
                }
            }
            debug!("File change watcher stopped");
        })
    }
}

impl ChangeObserver for FileChangeWatcher {
    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    fn context_id(&self) -> ContextId {
        self.context
    }
}

fn fingerprint(path: &Path) -> Fingerprint {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_set_remove() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        assert_eq!(store.get("pulse.watchlist.v1").unwrap(), None);
        store.set("pulse.watchlist.v1", "{}").unwrap();
        assert_eq!(store.get("pulse.watchlist.v1").unwrap().as_deref(), Some("{}"));
        assert!(dir.path().join("pulse.watchlist.v1.json").exists());

        store.remove("pulse.watchlist.v1").unwrap();
        store.remove("pulse.watchlist.v1").unwrap();
        assert_eq!(store.get("pulse.watchlist.v1").unwrap(), None);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        for key in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                store.set(key, "x"),
                Err(PersistenceError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.set("k", "1").unwrap();
        store.set("k", "2").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[test]
    fn test_watcher_reports_only_external_writes() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let watcher = store.watcher(vec!["k".to_string()], Duration::from_millis(10));
        let mut rx = watcher.subscribe();

        store.set("k", "mine").unwrap();
        assert!(watcher.poll_once().is_empty());

        // Another process writes through its own store.
        let other = JsonFileStore::open(dir.path()).unwrap();
        other.set("k", "theirs-longer").unwrap();

        let changes = watcher.poll_once();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_value.as_deref(), Some("theirs-longer"));
        assert_eq!(changes[0].origin, EXTERNAL_CONTEXT);
        assert_eq!(rx.try_recv().unwrap(), changes[0]);

        // Nothing new since.
        assert!(watcher.poll_once().is_empty());

        other.remove("k").unwrap();
        let changes = watcher.poll_once();
        assert_eq!(changes[0].new_value, None);
    }
}

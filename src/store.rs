//! Durable backing stores for admission tables
//!
//! Each table is persisted as a whole-table snapshot: `load()` returns the
//! full map and `save()` overwrites it. The in-memory [`PersistentTable`] is
//! authoritative for the running process; the durable copy is best effort.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;

/// Whole-table backing store
pub trait StateStore<V>: Send + Sync {
    /// Load the full table
    fn load(&self) -> Result<HashMap<String, V>, StoreError>;

    /// Overwrite the full table
    fn save(&self, table: &HashMap<String, V>) -> Result<(), StoreError>;

    /// Human readable location, used in logs
    fn describe(&self) -> String;
}

/// JSON file store (one object per file, keys sorted)
pub struct JsonFileStore<V> {
    path: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonFileStore<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Store for `file_name` inside `data_dir`
    pub fn in_dir(data_dir: &Path, file_name: &str) -> Self {
        Self::new(data_dir.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V> StateStore<V> for JsonFileStore<V>
where
    V: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<HashMap<String, V>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;

        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, table: &HashMap<String, V>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let ordered: BTreeMap<&String, &V> = table.iter().collect();
        let json = serde_json::to_string_pretty(&ordered).map_err(StoreError::Serialize)?;

        // Replace via rename so readers never see a half-written table
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store, used by tests and ephemeral deployments
pub struct MemoryStore<V> {
    table: Mutex<HashMap<String, V>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<V: Clone> MemoryStore<V> {
    pub fn new() -> Self {
        Self::with_entries(HashMap::new())
    }

    pub fn with_entries(table: HashMap<String, V>) -> Self {
        Self {
            table: Mutex::new(table),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Copy of the last saved table
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.table.lock().clone()
    }

    /// Make subsequent loads fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent saves fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl<V: Clone> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> StateStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn load(&self) -> Result<HashMap<String, V>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store read disabled".to_string()));
        }
        Ok(self.table.lock().clone())
    }

    fn save(&self, table: &HashMap<String, V>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store write disabled".to_string()));
        }
        *self.table.lock() = table.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Concurrent in-memory table mirrored to a [`StateStore`]
///
/// Writes to the store are serialized by a single writer lock and the
/// snapshot is taken while holding it, so an older snapshot can never
/// overwrite a newer one. Callers must not hold a map guard across
/// [`PersistentTable::persist`].
///
/// Best-effort writes issued inside a tokio runtime run on the blocking pool
/// and coalesce: while a write is queued, further requests are absorbed by it.
pub struct PersistentTable<V> {
    name: &'static str,
    entries: Arc<DashMap<String, V>>,
    store: Arc<dyn StateStore<V>>,
    write_lock: Arc<Mutex<()>>,
    /// A background write is queued and has not taken its snapshot yet
    write_queued: Arc<AtomicBool>,
}

impl<V> PersistentTable<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Load the table; a failed load starts empty
    pub fn load(name: &'static str, store: Arc<dyn StateStore<V>>) -> Self {
        let entries = DashMap::new();
        match store.load() {
            Ok(table) => {
                if !table.is_empty() {
                    info!(
                        "Loaded {} {} entries from {}",
                        table.len(),
                        name,
                        store.describe()
                    );
                }
                for (key, value) in table {
                    entries.insert(key, value);
                }
            }
            Err(e) => {
                warn!("Could not load {} from {}, starting empty: {}", name, store.describe(), e);
            }
        }

        Self {
            name,
            entries: Arc::new(entries),
            store,
            write_lock: Arc::new(Mutex::new(())),
            write_queued: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Live map
    pub fn entries(&self) -> &DashMap<String, V> {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of the table
    pub fn snapshot(&self) -> HashMap<String, V> {
        snapshot_of(&self.entries)
    }

    /// Write the full table to the store, on the calling thread
    pub fn persist(&self) -> Result<(), StoreError> {
        write_table(self.name, &self.entries, self.store.as_ref(), &self.write_lock)
    }

    /// Write the full table, logging and swallowing failures.
    ///
    /// Inside a tokio runtime the write is handed to the blocking pool and
    /// this returns immediately; outside one it writes inline.
    pub fn persist_best_effort(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = self.persist() {
                log_write_failure(self.name, self.store.as_ref(), &e);
            }
            return;
        };

        if self.write_queued.swap(true, Ordering::AcqRel) {
            return;
        }

        let name = self.name;
        let entries = Arc::clone(&self.entries);
        let store = Arc::clone(&self.store);
        let write_lock = Arc::clone(&self.write_lock);
        let write_queued = Arc::clone(&self.write_queued);
        handle.spawn_blocking(move || {
            let _guard = write_lock.lock();
            // Cleared before the snapshot so later mutations queue another write
            write_queued.store(false, Ordering::Release);
            let snapshot = snapshot_of(&entries);
            match store.save(&snapshot) {
                Ok(()) => debug!("Persisted {} {} entries", snapshot.len(), name),
                Err(e) => log_write_failure(name, store.as_ref(), &e),
            }
        });
    }
}

fn snapshot_of<V: Clone>(entries: &DashMap<String, V>) -> HashMap<String, V> {
    entries
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect()
}

fn write_table<V: Clone>(
    name: &str,
    entries: &DashMap<String, V>,
    store: &dyn StateStore<V>,
    write_lock: &Mutex<()>,
) -> Result<(), StoreError> {
    let _guard = write_lock.lock();
    let snapshot = snapshot_of(entries);
    store.save(&snapshot)?;
    debug!("Persisted {} {} entries", snapshot.len(), name);
    Ok(())
}

fn log_write_failure<V>(name: &str, store: &dyn StateStore<V>, e: &StoreError) {
    error!(
        "Failed to persist {} to {} (in-memory state kept): {}",
        name,
        store.describe(),
        e
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<u32> = JsonFileStore::in_dir(dir.path(), "failures.json");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_overwrites_whole_table() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<u32> = JsonFileStore::in_dir(&dir.path().join("nested"), "t.json");

        let mut table = HashMap::new();
        table.insert("a".to_string(), 1);
        table.insert("b".to_string(), 2);
        store.save(&table).unwrap();

        table.remove("a");
        store.save(&table).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("b"), Some(&2));
    }

    #[test]
    fn test_json_store_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.json");
        std::fs::write(&path, "{not json").unwrap();

        let store: JsonFileStore<u32> = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn test_table_load_failure_starts_empty() {
        let store = Arc::new(MemoryStore::<u32>::new());
        store.set_fail_reads(true);

        let table = PersistentTable::load("failures", store);
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_persist_and_swallow() {
        let store = Arc::new(MemoryStore::<u32>::new());
        let table = PersistentTable::load("failures", store.clone());

        table.entries().insert("k".to_string(), 3);
        table.persist().unwrap();
        assert_eq!(store.snapshot().get("k"), Some(&3));

        store.set_fail_writes(true);
        table.entries().insert("k".to_string(), 4);
        assert!(table.persist().is_err());
        table.persist_best_effort();

        // In-memory state stays authoritative
        assert_eq!(table.get("k"), Some(4));
        assert_eq!(store.snapshot().get("k"), Some(&3));
    }

    /// Store whose saves wait for a go-ahead
    struct GatedStore {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        saved: MemoryStore<u32>,
    }

    impl StateStore<u32> for GatedStore {
        fn load(&self) -> Result<HashMap<String, u32>, StoreError> {
            Ok(HashMap::new())
        }

        fn save(&self, table: &HashMap<String, u32>) -> Result<(), StoreError> {
            self.gate
                .lock()
                .recv()
                .map_err(|_| StoreError::Unavailable("gate closed".to_string()))?;
            self.saved.save(table)
        }

        fn describe(&self) -> String {
            "gated".to_string()
        }
    }

    #[tokio::test]
    async fn test_best_effort_write_does_not_block_caller() {
        let (tx, rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            gate: Mutex::new(rx),
            saved: MemoryStore::new(),
        });
        let table = PersistentTable::load("failures", store.clone());

        // Both calls return while the store is still held shut
        table.entries().insert("k".to_string(), 1);
        table.persist_best_effort();
        table.entries().insert("k".to_string(), 2);
        table.persist_best_effort();
        assert!(store.saved.snapshot().is_empty());

        tx.send(()).unwrap();
        tx.send(()).unwrap();

        let mut saved = None;
        for _ in 0..200 {
            saved = store.saved.snapshot().get("k").copied();
            if saved == Some(2) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(saved, Some(2));
    }

    #[test]
    fn test_json_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<u32> = JsonFileStore::in_dir(dir.path(), "failures.json");
        let mut table = HashMap::new();
        table.insert("a".to_string(), 1);
        store.save(&table).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["failures.json".to_string()]);
    }
}

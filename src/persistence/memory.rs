//! Default in-memory persistence engine.

use super::{unix_now, PersistenceEngine, LAST_UPDATE_TIME, TIMEOUT};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often expired collections and fields are dropped.
pub const GC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Field {
    name: String,
    value: String,
    expires: Option<Instant>,
}

impl Field {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct Record {
    fields: HashMap<String, Field>,
    touched: Instant,
}

impl Record {
    fn new() -> Self {
        Self {
            fields: HashMap::new(),
            touched: Instant::now(),
        }
    }

    fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .get(&field.to_ascii_lowercase())
            .filter(|f| f.is_live(Instant::now()))
            .map(|f| f.value.as_str())
    }

    fn is_expired(&self, default_ttl: Duration) -> bool {
        let timeout = self.value(TIMEOUT).and_then(|v| v.parse::<u64>().ok());
        let updated = self.value(LAST_UPDATE_TIME).and_then(|v| v.parse::<u64>().ok());
        match (timeout, updated) {
            (Some(timeout), Some(updated)) => updated.saturating_add(timeout) < unix_now(),
            _ => self.touched.elapsed() > default_ttl,
        }
    }
}

type Store = RwLock<HashMap<String, Arc<RwLock<Record>>>>;

/// In-memory [`PersistenceEngine`].
///
/// Collections are stored under `name_key`, each behind its own
/// reader-writer lock. A background thread drops expired collections and
/// fields every [`GC_INTERVAL`] until [`PersistenceEngine::close`] is called.
pub struct MemoryEngine {
    store: Arc<Store>,
    default_ttl: Duration,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryEngine {
    /// Open an engine. `uri` must be empty or use the `memory` scheme;
    /// `ttl` applies to collections without a `TIMEOUT` field.
    pub fn open(uri: &str, ttl: Duration) -> Result<Self> {
        let uri = uri.trim();
        if !(uri.is_empty() || uri.starts_with("memory")) {
            return Err(Error::config(format!("unsupported persistence uri: {}", uri)));
        }
        Ok(Self::new(ttl))
    }

    /// Start an engine with the GC thread running.
    pub fn new(ttl: Duration) -> Self {
        let store: Arc<Store> = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<()>();

        let gc_store = Arc::clone(&store);
        let worker = std::thread::Builder::new()
            .name("waf-persistence-gc".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(GC_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => collect_garbage(&gc_store, ttl),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!(error = %e, "persistence GC thread not started");
                None
            }
        };

        Self {
            store,
            default_ttl: ttl,
            shutdown: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Number of stored collections.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one GC pass now.
    pub fn collect_garbage(&self) {
        collect_garbage(&self.store, self.default_ttl);
    }

    fn record(&self, collection: &str, key: &str) -> Option<Arc<RwLock<Record>>> {
        self.store.read().get(&store_key(collection, key)).cloned()
    }

    fn record_or_insert(&self, collection: &str, key: &str) -> Arc<RwLock<Record>> {
        let id = store_key(collection, key);
        if let Some(record) = self.store.read().get(&id) {
            return Arc::clone(record);
        }
        Arc::clone(
            self.store
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(RwLock::new(Record::new()))),
        )
    }
}

fn store_key(collection: &str, key: &str) -> String {
    format!("{}_{}", collection.to_ascii_lowercase(), key)
}

fn collect_garbage(store: &Store, default_ttl: Duration) {
    let now = Instant::now();
    let mut expired = Vec::new();
    for (id, record) in store.read().iter() {
        let mut record = record.write();
        record.fields.retain(|_, f| f.is_live(now));
        if record.is_expired(default_ttl) {
            expired.push(id.clone());
        }
    }
    if expired.is_empty() {
        return;
    }
    let mut store = store.write();
    for id in &expired {
        store.remove(id);
    }
    debug!(count = expired.len(), "expired persistent collections removed");
}

impl PersistenceEngine for MemoryEngine {
    fn get(&self, collection: &str, key: &str, field: &str) -> Option<String> {
        let record = self.record(collection, key)?;
        let record = record.read();
        record.value(field).map(str::to_string)
    }

    fn set(&self, collection: &str, key: &str, field: &str, value: &str) {
        let record = self.record_or_insert(collection, key);
        let mut record = record.write();
        record.touched = Instant::now();
        let expires = record
            .fields
            .get(&field.to_ascii_lowercase())
            .and_then(|f| f.expires);
        record.fields.insert(
            field.to_ascii_lowercase(),
            Field {
                name: field.to_string(),
                value: value.to_string(),
                expires,
            },
        );
    }

    fn sum(&self, collection: &str, key: &str, field: &str, delta: i64) -> i64 {
        let record = self.record_or_insert(collection, key);
        let mut record = record.write();
        record.touched = Instant::now();
        let current: i64 = record.value(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current.saturating_add(delta);
        record.fields.insert(
            field.to_ascii_lowercase(),
            Field {
                name: field.to_string(),
                value: next.to_string(),
                expires: None,
            },
        );
        next
    }

    fn remove(&self, collection: &str, key: &str, field: &str) {
        if let Some(record) = self.record(collection, key) {
            record.write().fields.remove(&field.to_ascii_lowercase());
        }
    }

    fn all(&self, collection: &str, key: &str) -> HashMap<String, String> {
        let Some(record) = self.record(collection, key) else {
            return HashMap::new();
        };
        let record = record.read();
        if record.is_expired(self.default_ttl) {
            return HashMap::new();
        }
        let now = Instant::now();
        record
            .fields
            .values()
            .filter(|f| f.is_live(now))
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect()
    }

    fn set_ttl(&self, collection: &str, key: &str, field: &str, ttl: Duration) {
        if let Some(record) = self.record(collection, key) {
            if let Some(f) = record.write().fields.get_mut(&field.to_ascii_lowercase()) {
                f.expires = Some(Instant::now() + ttl);
            }
        }
    }

    fn close(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("collections", &self.len())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let engine = MemoryEngine::new(Duration::from_secs(60));
        engine.set("IP", "1.2.3.4", "Score", "5");
        assert_eq!(engine.get("ip", "1.2.3.4", "score").as_deref(), Some("5"));
        assert_eq!(engine.all("IP", "1.2.3.4").get("Score").map(String::as_str), Some("5"));
        engine.remove("IP", "1.2.3.4", "SCORE");
        assert_eq!(engine.get("IP", "1.2.3.4", "score"), None);
        assert_eq!(engine.get("IP", "5.6.7.8", "score"), None);
        engine.close();
    }

    #[test]
    fn test_sum() {
        let engine = MemoryEngine::new(Duration::from_secs(60));
        assert_eq!(engine.sum("USER", "bob", "hits", 2), 2);
        assert_eq!(engine.sum("USER", "bob", "hits", -5), -3);
        engine.close();
    }

    #[test]
    fn test_field_ttl() {
        let engine = MemoryEngine::new(Duration::from_secs(60));
        engine.set("IP", "a", "blocked", "1");
        engine.set_ttl("IP", "a", "blocked", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(engine.get("IP", "a", "blocked"), None);
        engine.collect_garbage();
        assert!(engine.all("IP", "a").is_empty());
        engine.close();
    }

    #[test]
    fn test_collection_timeout() {
        let engine = MemoryEngine::new(Duration::from_secs(60));
        let stale = (unix_now() - 100).to_string();
        engine.set("IP", "old", LAST_UPDATE_TIME, &stale);
        engine.set("IP", "old", TIMEOUT, "10");
        engine.set("IP", "fresh", "x", "1");
        assert!(engine.all("IP", "old").is_empty());
        engine.collect_garbage();
        assert_eq!(engine.len(), 1);
        engine.close();
    }

    #[test]
    fn test_open_uri() {
        assert!(MemoryEngine::open("", Duration::from_secs(1)).is_ok());
        assert!(MemoryEngine::open("memory://", Duration::from_secs(1)).is_ok());
        assert!(MemoryEngine::open("redis://localhost", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = MemoryEngine::new(Duration::from_secs(60));
        engine.close();
        engine.close();
    }
}

//! Storage for collections that outlive a transaction (IP, SESSION, USER,
//! RESOURCE, GLOBAL).
//!
//! A collection opened with `initcol` is addressed by its name and key and
//! holds string fields. Besides the fields rules write, every collection
//! carries housekeeping fields maintained through [`open_collection`] and
//! [`store_collection`]; back-ends store them like any other field.

mod memory;

pub use memory::MemoryEngine;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Creation time, unix seconds.
pub const CREATE_TIME: &str = "CREATE_TIME";
/// Last write-back, unix seconds.
pub const LAST_UPDATE_TIME: &str = "LAST_UPDATE_TIME";
/// Number of write-backs.
pub const UPDATE_COUNTER: &str = "UPDATE_COUNTER";
/// Write-backs per minute since creation.
pub const UPDATE_RATE: &str = "UPDATE_RATE";
/// Seconds without a write-back before the collection expires.
pub const TIMEOUT: &str = "TIMEOUT";
/// `1` until the first write-back.
pub const IS_NEW: &str = "IS_NEW";
/// Collection key.
pub const KEY: &str = "KEY";
/// Set on fields that carry their own expiry.
pub const TTL_SET: &str = "TTL_SET";

/// Housekeeping field names.
pub const RESERVED_FIELDS: [&str; 8] = [
    CREATE_TIME,
    LAST_UPDATE_TIME,
    UPDATE_COUNTER,
    UPDATE_RATE,
    TIMEOUT,
    IS_NEW,
    KEY,
    TTL_SET,
];

/// Key/value back-end for persistent collections.
///
/// Implementations are shared by every transaction of a WAF and must be
/// safe for concurrent use.
pub trait PersistenceEngine: Send + Sync {
    /// Value of `field` in collection `(collection, key)`.
    fn get(&self, collection: &str, key: &str, field: &str) -> Option<String>;

    /// Set `field`, creating the collection if needed.
    fn set(&self, collection: &str, key: &str, field: &str, value: &str);

    /// Add `delta` to the integer value of `field` (missing counts as 0)
    /// and return the new value.
    fn sum(&self, collection: &str, key: &str, field: &str, delta: i64) -> i64;

    /// Remove `field`.
    fn remove(&self, collection: &str, key: &str, field: &str);

    /// Every live field of the collection; empty when it does not exist.
    fn all(&self, collection: &str, key: &str) -> HashMap<String, String>;

    /// Expire `field` after `ttl`.
    fn set_ttl(&self, collection: &str, key: &str, field: &str, ttl: Duration);

    /// Stop background work. Called once when the WAF is closed.
    fn close(&self);
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Load a collection for a transaction. New collections get their
/// housekeeping fields here.
pub fn open_collection(
    engine: &dyn PersistenceEngine,
    collection: &str,
    key: &str,
    timeout: Duration,
) -> HashMap<String, String> {
    let mut fields = engine.all(collection, key);
    if fields.is_empty() {
        let now = unix_now().to_string();
        fields.insert(CREATE_TIME.to_string(), now.clone());
        fields.insert(LAST_UPDATE_TIME.to_string(), now);
        fields.insert(UPDATE_COUNTER.to_string(), "0".to_string());
        fields.insert(UPDATE_RATE.to_string(), "0".to_string());
        fields.insert(TIMEOUT.to_string(), timeout.as_secs().to_string());
        fields.insert(IS_NEW.to_string(), "1".to_string());
        fields.insert(KEY.to_string(), key.to_string());
    } else {
        fields.insert(IS_NEW.to_string(), "0".to_string());
    }
    fields
}

/// What a transaction did to an open collection.
#[derive(Debug, Default)]
pub struct CollectionWrite<'a> {
    /// The collection as the transaction left it.
    pub fields: &'a [(String, String)],
    /// The fields it was opened with.
    pub loaded: &'a [(String, String)],
    /// Net `+=`/`-=` per field, applied with [`PersistenceEngine::sum`].
    pub deltas: &'a [(String, i64)],
}

/// Write a collection back after a transaction.
///
/// Only fields the transaction changed are written, and counters changed
/// by increments are summed into the stored value, so concurrent
/// transactions on the same collection do not lose each other's updates.
/// Loaded fields that disappeared are removed.
pub fn store_collection(engine: &dyn PersistenceEngine, collection: &str, key: &str, write: &CollectionWrite<'_>) {
    let now = unix_now();
    let find = |list: &[(String, String)], name: &str| {
        list.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    let is_delta = |name: &str| write.deltas.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
    let is_new = find(write.loaded, IS_NEW).as_deref() != Some("0");

    for (field, value) in write.fields {
        if matches!(
            field.to_ascii_uppercase().as_str(),
            LAST_UPDATE_TIME | UPDATE_COUNTER | UPDATE_RATE | IS_NEW
        ) || is_delta(field)
        {
            continue;
        }
        if !is_new && find(write.loaded, field).as_deref() == Some(value.as_str()) {
            continue;
        }
        engine.set(collection, key, field, value);
    }
    for (field, delta) in write.deltas {
        engine.sum(collection, key, field, *delta);
    }
    for (name, _) in write.loaded {
        if find(write.fields, name).is_none() && !is_delta(name) {
            engine.remove(collection, key, name);
        }
    }

    let created: u64 = engine
        .get(collection, key, CREATE_TIME)
        .and_then(|v| v.parse().ok())
        .unwrap_or(now);
    let counter = engine.sum(collection, key, UPDATE_COUNTER, 1).max(0) as u64;
    let minutes = (now.saturating_sub(created) / 60).max(1);
    engine.set(collection, key, LAST_UPDATE_TIME, &now.to_string());
    engine.set(collection, key, UPDATE_RATE, &(counter / minutes).to_string());
    engine.set(collection, key, IS_NEW, "0");
}

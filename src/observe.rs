//! In-process value observation.
//!
//! The sync core never polls: it registers observers on the objects whose
//! key paths are shared and re-broadcasts when a write lands. The
//! [`Observable`] capability is the only thing the server knows about an
//! observed object; [`ParamStore`] is the reference implementation used by
//! the demo CLI and the tests.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::Value;

/// Callback invoked after an observed key path changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Capability the sync core needs from a tunable object: read/write a
/// value at a key path, and observe writes to it.
///
/// Implementations resolve key paths however they like (struct fields,
/// map lookups, nested documents); the server treats both the object and
/// the path as opaque. Reads and writes must be synchronous and fast.
pub trait Observable: Send + Sync {
    /// Read the current value at `key_path`, if one exists.
    fn get_value(&self, key_path: &str) -> Option<Value>;

    /// Write `value` at `key_path`. Observers registered for that path
    /// fire synchronously before this returns.
    fn set_value(&self, key_path: &str, value: Value) -> Result<()>;

    /// Register a change observer for `key_path`, returning its token.
    fn observe(&self, key_path: &str, callback: ChangeCallback) -> Uuid;

    /// Cancel a previously registered observer. Unknown tokens are a no-op.
    fn unobserve(&self, token: Uuid);
}

struct Observer {
    token: Uuid,
    key_path: String,
    callback: ChangeCallback,
}

/// In-memory parameter store keyed by path string.
pub struct ParamStore {
    values: DashMap<String, Value>,
    observers: Mutex<Vec<Observer>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Seed a value without firing observers; used for initial setup.
    pub fn with_value(self, key_path: impl Into<String>, value: Value) -> Self {
        self.values.insert(key_path.into(), value);
        self
    }

    pub fn key_paths(&self) -> Vec<String> {
        self.values.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered observers (shares hold one each).
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Observable for ParamStore {
    fn get_value(&self, key_path: &str) -> Option<Value> {
        self.values.get(key_path).map(|entry| entry.value().clone())
    }

    fn set_value(&self, key_path: &str, value: Value) -> Result<()> {
        self.values.insert(key_path.to_string(), value);

        // Snapshot matching callbacks so none run under the lock.
        let callbacks: Vec<ChangeCallback> = {
            let observers = self.observers.lock();
            observers
                .iter()
                .filter(|observer| observer.key_path == key_path)
                .map(|observer| observer.callback.clone())
                .collect()
        };

        for callback in callbacks {
            callback();
        }

        Ok(())
    }

    fn observe(&self, key_path: &str, callback: ChangeCallback) -> Uuid {
        let token = Uuid::new_v4();
        self.observers.lock().push(Observer {
            token,
            key_path: key_path.to_string(),
            callback,
        });
        token
    }

    fn unobserve(&self, token: Uuid) {
        self.observers.lock().retain(|observer| observer.token != token);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn get_returns_latest_write() {
        let store = ParamStore::new();
        assert!(store.get_value("gain").is_none());

        store.set_value("gain", Value::Float(0.25)).unwrap();
        assert_eq!(store.get_value("gain"), Some(Value::Float(0.25)));

        store.set_value("gain", Value::Float(0.5)).unwrap();
        assert_eq!(store.get_value("gain"), Some(Value::Float(0.5)));
    }

    #[test]
    fn observer_fires_for_matching_path_only() {
        let store = ParamStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        store.observe(
            "gain",
            Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.set_value("gain", Value::Integer(1)).unwrap();
        store.set_value("threshold", Value::Integer(2)).unwrap();
        store.set_value("gain", Value::Integer(3)).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unobserve_stops_callbacks() {
        let store = ParamStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let token = store.observe(
            "gain",
            Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.set_value("gain", Value::Integer(1)).unwrap();
        store.unobserve(token);
        store.set_value("gain", Value::Integer(2)).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_value_seeds_without_firing() {
        let store = ParamStore::new().with_value("label", Value::Text("mix".to_string()));
        assert_eq!(
            store.get_value("label"),
            Some(Value::Text("mix".to_string()))
        );
    }
}

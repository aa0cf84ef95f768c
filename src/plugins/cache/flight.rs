//! Single-flight coalescing
//!
//! The first caller for a key becomes the leader and performs the work;
//! callers arriving while it runs subscribe to its result. The in-flight
//! marker is checked and set under one lock. If the leader is dropped before
//! completing, its channel closes and followers race to become the new
//! leader.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

/// In-flight operations keyed by `K`, each yielding a `T`
pub struct FlightMap<K, T> {
    inflight: Mutex<HashMap<K, broadcast::Sender<T>>>,
}

/// Role handed to a caller of [`FlightMap::join`]
pub enum Flight<'a, K: Eq + Hash + Clone, T: Clone> {
    /// Perform the work and publish it via [`FlightGuard::complete`]
    Leader(FlightGuard<'a, K, T>),
    /// Wait for the leader's result
    Follower(broadcast::Receiver<T>),
}

impl<K: Eq + Hash + Clone, T: Clone> Default for FlightMap<K, T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, T: Clone> FlightMap<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, broadcast::Sender<T>>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Become the leader for `key`, or follow the current one
    pub fn join(&self, key: K) -> Flight<'_, K, T> {
        let mut inflight = self.lock();
        if let Some(sender) = inflight.get(&key) {
            return Flight::Follower(sender.subscribe());
        }
        let (sender, _) = broadcast::channel(1);
        inflight.insert(key.clone(), sender);
        Flight::Leader(FlightGuard {
            map: self,
            key,
            finished: false,
        })
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

/// Leadership of one key; releases the marker when completed or dropped
pub struct FlightGuard<'a, K: Eq + Hash + Clone, T: Clone> {
    map: &'a FlightMap<K, T>,
    key: K,
    finished: bool,
}

impl<'a, K: Eq + Hash + Clone, T: Clone> FlightGuard<'a, K, T> {
    /// Publish the result to every follower and release the key
    pub fn complete(mut self, value: T) {
        self.finished = true;
        if let Some(sender) = self.map.lock().remove(&self.key) {
            // No receivers is fine: nobody joined while we worked
            let _ = sender.send(value);
        }
    }
}

impl<'a, K: Eq + Hash + Clone, T: Clone> Drop for FlightGuard<'a, K, T> {
    fn drop(&mut self) {
        if !self.finished {
            // Dropping the sender closes every follower's receiver
            self.map.lock().remove(&self.key);
        }
    }
}

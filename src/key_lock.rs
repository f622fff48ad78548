//! Per-key mutual exclusion.
//!
//! Each key gets its own async mutex plus a reference count of tasks that
//! hold or wait for it. The entry is removed from the map as soon as the
//! count drops to zero, so high key cardinality does not grow the map.
//!
//! Unlocking a key that is not held is a caller bug and panics.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

struct Entry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
    held: Option<OwnedMutexGuard<()>>,
}

pub struct KeyLock<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K: Eq + Hash + Clone + Debug> Default for KeyLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Debug> KeyLock<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until the calling task exclusively holds `key`.
    pub async fn lock(&self, key: K) {
        let mutex = {
            let mut entries = self.entries();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
                held: None,
            });
            entry.refs += 1;
            entry.mutex.clone()
        };

        // Gives the reference back if this future is dropped while waiting
        let pending = PendingRef {
            lock: self,
            key: Some(key),
        };
        let guard = mutex.lock_owned().await;
        let key = pending.disarm();

        if let Some(entry) = self.entries().get_mut(&key) {
            entry.held = Some(guard);
        }
    }

    /// Release `key`.
    ///
    /// # Panics
    ///
    /// Panics with `LockNotHeld` if `key` is not currently locked.
    pub fn unlock(&self, key: &K) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            panic!("LockNotHeld: unlock of key {key:?} which has no lock entry");
        };
        if entry.held.take().is_none() {
            panic!("LockNotHeld: unlock of key {key:?} which is not held");
        }

        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
        }
    }

    /// Lock `key` and release it when the returned guard is dropped.
    pub async fn guard(&self, key: K) -> KeyLockGuard<'_, K> {
        self.lock(key.clone()).await;
        KeyLockGuard { lock: self, key }
    }

    /// Whether any task holds or waits on `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn release_ref(&self, key: &K) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }
}

struct PendingRef<'a, K: Eq + Hash + Clone + Debug> {
    lock: &'a KeyLock<K>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone + Debug> PendingRef<'_, K> {
    fn disarm(mut self) -> K {
        // key is only taken here or in drop
        self.key.take().unwrap_or_else(|| unreachable!())
    }
}

impl<K: Eq + Hash + Clone + Debug> Drop for PendingRef<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.lock.release_ref(&key);
        }
    }
}

/// RAII handle returned by [`KeyLock::guard`].
pub struct KeyLockGuard<'a, K: Eq + Hash + Clone + Debug> {
    lock: &'a KeyLock<K>,
    key: K,
}

impl<K: Eq + Hash + Clone + Debug> KeyLockGuard<'_, K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone + Debug> Drop for KeyLockGuard<'_, K> {
    fn drop(&mut self) {
        self.lock.unlock(&self.key);
    }
}

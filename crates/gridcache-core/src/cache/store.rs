use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::time::Instant;
use tracing::debug;

use super::entry::CacheEntry;
use super::key::QueryKey;
use super::policy;

/// Callback invoked after every mutation of the key it was registered for.
/// Receives the new entry, or `None` when the entry was deleted.
pub type Listener = Arc<dyn Fn(&QueryKey, Option<&Arc<CacheEntry>>) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StoreInner {
    entries: Mutex<HashMap<QueryKey, Arc<CacheEntry>>>,
    listeners: Mutex<HashMap<QueryKey, Vec<(u64, Listener)>>>,
    next_listener_id: AtomicU64,
}

/// Mapping from query key to its current cache entry.
///
/// Clone is cheap and shares the same map. Listeners are called synchronously
/// once the mutation is complete and no lock is held, so a listener may read
/// or write the store itself.
#[derive(Clone)]
pub struct EntryStore {
    inner: Arc<StoreInner>,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<Arc<CacheEntry>> {
        lock(&self.inner.entries).get(key).cloned()
    }

    pub fn set(&self, key: &QueryKey, entry: CacheEntry) {
        let entry = Arc::new(entry);
        lock(&self.inner.entries).insert(key.clone(), Arc::clone(&entry));
        self.notify(key, Some(&entry));
    }

    pub fn delete(&self, key: &QueryKey) -> Option<Arc<CacheEntry>> {
        let removed = lock(&self.inner.entries).remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        removed
    }

    /// Read-modify-replace under a single lock.
    ///
    /// `f` sees the current entry (if any) and returns the replacement, or
    /// `None` to leave the store untouched. Returns the stored replacement.
    pub fn update<F>(&self, key: &QueryKey, f: F) -> Option<Arc<CacheEntry>>
    where
        F: FnOnce(Option<&CacheEntry>) -> Option<CacheEntry>,
    {
        let replaced = {
            let mut entries = lock(&self.inner.entries);
            let next = f(entries.get(key).map(Arc::as_ref))?;
            let next = Arc::new(next);
            entries.insert(key.clone(), Arc::clone(&next));
            next
        };
        self.notify(key, Some(&replaced));
        Some(replaced)
    }

    /// Register a listener for one key. Dropping the returned subscription
    /// removes it.
    pub fn subscribe<F>(&self, key: &QueryKey, callback: F) -> Subscription
    where
        F: Fn(&QueryKey, Option<&Arc<CacheEntry>>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners)
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: true,
        }
    }

    pub fn listener_count(&self, key: &QueryKey) -> usize {
        lock(&self.inner.listeners).get(key).map_or(0, Vec::len)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        lock(&self.inner.entries).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry eligible for eviction at `now`.
    pub fn sweep(&self, now: Instant) -> Vec<QueryKey> {
        let evicted: Vec<QueryKey> = {
            let mut entries = lock(&self.inner.entries);
            let keys: Vec<QueryKey> = entries
                .iter()
                .filter(|(_, entry)| policy::is_evictable(entry, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        for key in &evicted {
            debug!(key = %key, "Evicted cache entry");
            self.notify(key, None);
        }
        evicted
    }

    fn notify(&self, key: &QueryKey, entry: Option<&Arc<CacheEntry>>) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .get(key)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(key, entry);
        }
    }
}

/// Handle returned by `EntryStore::subscribe`.
pub struct Subscription {
    store: Weak<StoreInner>,
    key: QueryKey,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(store) = self.store.upgrade() {
            let mut listeners = lock(&store.listeners);
            if let Some(list) = listeners.get_mut(&self.key) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    listeners.remove(&self.key);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::FetchStatus;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn entry() -> CacheEntry {
        CacheEntry::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn test_set_get_delete() {
        let store = EntryStore::new();
        let key = QueryKey::resource("users");

        assert!(store.get(&key).is_none());
        store.set(&key, entry());
        assert_eq!(store.get(&key).map(|e| e.status), Some(FetchStatus::Idle));
        assert!(store.delete(&key).is_some());
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_notifies_only_the_mutated_key() {
        let store = EntryStore::new();
        let users = QueryKey::resource("users");
        let plans = QueryKey::resource("plans");

        let user_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&user_calls);
        let _sub = store.subscribe(&users, move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        store.set(&plans, entry());
        assert_eq!(user_calls.load(Ordering::SeqCst), 0);

        store.set(&users, entry());
        store.update(&users, |e| e.map(CacheEntry::fetching));
        store.delete(&users);
        assert_eq!(user_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_listener_sees_completed_mutation() {
        let store = EntryStore::new();
        let key = QueryKey::resource("users");
        let observed = Arc::new(Mutex::new(None));

        let reader = store.clone();
        let seen = Arc::clone(&observed);
        let _sub = store.subscribe(&key, move |key, entry| {
            // The store is readable from inside the callback
            let current = reader.get(key).map(|e| e.status);
            *lock(&seen) = Some((entry.map(|e| e.status), current));
        });

        store.set(&key, entry().fetching());
        assert_eq!(
            *lock(&observed),
            Some((Some(FetchStatus::Fetching), Some(FetchStatus::Fetching)))
        );
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = EntryStore::new();
        let key = QueryKey::resource("users");
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let sub = store.subscribe(&key, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.listener_count(&key), 1);

        sub.unsubscribe();
        assert_eq!(store.listener_count(&key), 0);
        store.set(&key, entry());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_update_can_decline() {
        let store = EntryStore::new();
        let key = QueryKey::resource("users");
        assert!(store.update(&key, |_| None).is_none());
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_sweep_removes_only_evictable() {
        let store = EntryStore::new();
        let now = Instant::now();
        let old = QueryKey::resource("old");
        let watched = QueryKey::resource("watched");
        let fresh = QueryKey::resource("fresh");

        store.set(&old, entry().succeeded(Arc::new(1u8), now));
        store.set(&watched, entry().succeeded(Arc::new(1u8), now).with_subscribers(1));
        store.set(&fresh, entry().succeeded(Arc::new(1u8), now + Duration::from_secs(15)));

        let evicted = store.sweep(now + Duration::from_secs(20));
        assert_eq!(evicted, vec![old.clone()]);
        assert!(store.get(&old).is_none());
        assert!(store.get(&watched).is_some());
        assert!(store.get(&fresh).is_some());
    }
}

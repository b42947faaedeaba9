// Query cache.
// Keyed store of query states with change events and observer-based garbage collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::key::QueryKey;
use super::state::{QueryAction, QueryState};
use super::status::FetchStatus;

const EVENT_CAPACITY: usize = 256;

/// Current time in ms since epoch, the unit of every `*_updated_at` field.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Kind of change made to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    Added,
    Updated,
    Removed,
}

/// Change notification sent to cache subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub query_hash: String,
}

#[derive(Debug)]
struct CacheEntry {
    key: QueryKey,
    state: QueryState,
    observers: usize,
    /// When the last observer went away, or when the entry was created.
    released_at: i64,
}

#[derive(Debug)]
struct CacheInner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    events: broadcast::Sender<CacheEvent>,
}

/// Shared map from query hash to query state.
///
/// Clones share the same entries.
#[derive(Debug, Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Receive change events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.read().contains_key(&key.query_hash())
    }

    /// Copy of the state stored for `key`.
    pub fn get(&self, key: &QueryKey) -> Option<QueryState> {
        self.inner
            .entries
            .read()
            .get(&key.query_hash())
            .map(|entry| entry.state.clone())
    }

    /// Apply a transition to the entry for `key`, creating it if needed.
    ///
    /// Returns the state after the transition.
    pub fn dispatch(&self, key: &QueryKey, action: QueryAction) -> QueryState {
        let hash = key.query_hash();
        let (state, created) = {
            let mut entries = self.inner.entries.write();
            let created = !entries.contains_key(&hash);
            let entry = entries
                .entry(hash.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            entry.state.apply(action);
            (entry.state.clone(), created)
        };

        if created {
            self.notify(CacheEventKind::Added, &hash);
        }
        self.notify(CacheEventKind::Updated, &hash);
        state
    }

    /// Create an empty entry for `key` unless one exists. Returns true when created.
    pub fn ensure(&self, key: &QueryKey) -> bool {
        let hash = key.query_hash();
        let created = {
            let mut entries = self.inner.entries.write();
            if entries.contains_key(&hash) {
                false
            } else {
                entries.insert(hash.clone(), CacheEntry::new(key.clone()));
                true
            }
        };

        if created {
            self.notify(CacheEventKind::Added, &hash);
        }
        created
    }

    /// Replace the state for `key` wholesale.
    pub fn set_state(&self, key: &QueryKey, state: QueryState) {
        let hash = key.query_hash();
        let created = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(&hash) {
                Some(entry) => {
                    entry.state = state;
                    false
                }
                None => {
                    let mut entry = CacheEntry::new(key.clone());
                    entry.state = state;
                    entries.insert(hash.clone(), entry);
                    true
                }
            }
        };

        if created {
            self.notify(CacheEventKind::Added, &hash);
        } else {
            self.notify(CacheEventKind::Updated, &hash);
        }
    }

    /// Seed `key` with `state` unless the cached data is at least as recent.
    ///
    /// An existing entry keeps its fetch status; a new one starts idle.
    /// Returns true when the state was written.
    pub fn hydrate(&self, key: &QueryKey, mut state: QueryState) -> bool {
        let hash = key.query_hash();
        let created = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(&hash) {
                Some(entry) => {
                    if entry.state.data_updated_at >= state.data_updated_at {
                        return false;
                    }
                    state.fetch_status = entry.state.fetch_status;
                    entry.state = state;
                    false
                }
                None => {
                    state.fetch_status = FetchStatus::Idle;
                    let mut entry = CacheEntry::new(key.clone());
                    entry.state = state;
                    entries.insert(hash.clone(), entry);
                    true
                }
            }
        };

        if created {
            self.notify(CacheEventKind::Added, &hash);
        } else {
            self.notify(CacheEventKind::Updated, &hash);
        }
        true
    }

    pub fn remove(&self, key: &QueryKey) -> Option<QueryState> {
        let hash = key.query_hash();
        let removed = self.inner.entries.write().remove(&hash);
        if removed.is_some() {
            self.notify(CacheEventKind::Removed, &hash);
        }
        removed.map(|entry| entry.state)
    }

    /// Keys and states of every entry whose key starts with `prefix`.
    pub fn find_all(&self, prefix: &QueryKey) -> Vec<(QueryKey, QueryState)> {
        self.inner
            .entries
            .read()
            .values()
            .filter(|entry| entry.key.starts_with(prefix))
            .map(|entry| (entry.key.clone(), entry.state.clone()))
            .collect()
    }

    /// Every entry in the cache.
    pub fn snapshot(&self) -> Vec<(QueryKey, QueryState)> {
        self.find_all(&QueryKey::default())
    }

    pub fn clear(&self) {
        let hashes: Vec<String> = self.inner.entries.write().drain().map(|(h, _)| h).collect();
        for hash in hashes {
            self.notify(CacheEventKind::Removed, &hash);
        }
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .entries
            .read()
            .get(&key.query_hash())
            .map_or(0, |entry| entry.observers)
    }

    pub(crate) fn add_observer(&self, key: &QueryKey) {
        let hash = key.query_hash();
        let created = {
            let mut entries = self.inner.entries.write();
            let created = !entries.contains_key(&hash);
            let entry = entries
                .entry(hash.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            entry.observers += 1;
            created
        };

        if created {
            tracing::debug!(query = %key, "created query for observer");
            self.notify(CacheEventKind::Added, &hash);
        }
    }

    pub(crate) fn remove_observer(&self, key: &QueryKey) {
        if let Some(entry) = self.inner.entries.write().get_mut(&key.query_hash()) {
            entry.observers = entry.observers.saturating_sub(1);
            if entry.observers == 0 {
                entry.released_at = now_millis();
            }
        }
    }

    /// Drop unobserved entries released at least `cache_time` before `now`.
    ///
    /// Returns the number of removed entries.
    pub fn collect_garbage_at(&self, now: i64, cache_time: Duration) -> usize {
        let cache_time = i64::try_from(cache_time.as_millis()).unwrap_or(i64::MAX);
        let expired: Vec<String> = {
            let mut entries = self.inner.entries.write();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.observers == 0 && now.saturating_sub(entry.released_at) >= cache_time
                })
                .map(|(hash, _)| hash.clone())
                .collect();
            for hash in &expired {
                entries.remove(hash);
            }
            expired
        };

        for hash in &expired {
            tracing::debug!(query = %hash, "garbage collected query");
            self.notify(CacheEventKind::Removed, hash);
        }
        expired.len()
    }

    fn notify(&self, kind: CacheEventKind, hash: &str) {
        // No subscribers is fine.
        let _ = self.inner.events.send(CacheEvent {
            kind,
            query_hash: hash.to_string(),
        });
    }
}

impl CacheEntry {
    fn new(key: QueryKey) -> Self {
        Self {
            key,
            state: QueryState::default(),
            observers: 0,
            released_at: now_millis(),
        }
    }
}

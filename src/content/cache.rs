//! Shared cache of recently served byte windows.
//!
//! Windows are block-aligned spans of a source, keyed by `(source id, window index)`.
//! Eviction is least-recently-used and bounded by total bytes, not entry count.
//! Concurrent readers of a window that is still being fetched join the same in-flight
//! fetch instead of issuing a second upstream request.

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::StreamError;

/// Identifies one block-aligned window of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub source: u64,
    pub index: u64,
}

impl WindowKey {
    pub fn new(source: u64, index: u64) -> Self {
        Self { source, index }
    }
}

type WindowFetch = Shared<BoxFuture<'static, Result<Bytes, StreamError>>>;

struct CacheState {
    entries: LruCache<WindowKey, Bytes>,
    in_flight: HashMap<WindowKey, WindowFetch>,
    current_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Cache statistics for `/status`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub budget_bytes: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct ByteWindowCache {
    state: Mutex<CacheState>,
    budget: usize,
}

impl ByteWindowCache {
    pub fn new(budget: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                in_flight: HashMap::new(),
                current_size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            budget,
        }
    }

    /// Cached window, refreshing its recency.
    pub async fn get(&self, key: &WindowKey) -> Option<Bytes> {
        let mut state = self.state.lock().await;
        let found = state.entries.get(key).cloned();
        if found.is_some() {
            state.hits += 1;
        }
        found
    }

    /// Whether the window is cached or already being fetched
    pub async fn is_available(&self, key: &WindowKey) -> bool {
        let state = self.state.lock().await;
        state.entries.contains(key) || state.in_flight.contains_key(key)
    }

    /// Return the cached window, or run `fetch` once for all concurrent callers.
    ///
    /// `fetch` is only invoked when neither a cached copy nor an in-flight fetch exists.
    /// Failed fetches are not cached; the next caller starts a fresh one.
    pub async fn get_or_fetch<F, Fut>(&self, key: WindowKey, fetch: F) -> Result<Bytes, StreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, StreamError>> + Send + 'static,
    {
        let pending = {
            let mut state = self.state.lock().await;
            if let Some(bytes) = state.entries.get(&key).cloned() {
                state.hits += 1;
                return Ok(bytes);
            }
            state.misses += 1;
            match state.in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let started = fetch().boxed().shared();
                    state.in_flight.insert(key, started.clone());
                    started
                }
            }
        };

        let result = pending.clone().await;

        {
            let mut state = self.state.lock().await;
            // Only the fetch we joined may be retired; a newer one may have replaced it
            let ours = state
                .in_flight
                .get(&key)
                .is_some_and(|current| current.ptr_eq(&pending));
            if ours {
                state.in_flight.remove(&key);
                if let Ok(bytes) = &result {
                    Self::insert_locked(&mut state, self.budget, key, bytes.clone());
                }
            }
        }

        result
    }

    pub async fn insert(&self, key: WindowKey, bytes: Bytes) {
        let mut state = self.state.lock().await;
        Self::insert_locked(&mut state, self.budget, key, bytes);
    }

    fn insert_locked(state: &mut CacheState, budget: usize, key: WindowKey, bytes: Bytes) {
        let len = bytes.len();
        if len > budget {
            return;
        }
        if let Some(old) = state.entries.pop(&key) {
            state.current_size -= old.len();
        }
        while state.current_size + len > budget {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.current_size -= evicted.len();
                    state.evictions += 1;
                }
                None => break,
            }
        }
        state.current_size += len;
        state.entries.put(key, bytes);
    }

    /// Drop every window and in-flight fetch of a source.
    pub async fn remove_source(&self, source: u64) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<WindowKey> = state
            .entries
            .iter()
            .filter(|(k, _)| k.source == source)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(bytes) = state.entries.pop(key) {
                state.current_size -= bytes.len();
            }
        }
        state.in_flight.retain(|k, _| k.source != source);
        keys.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            bytes: state.current_size,
            budget_bytes: self.budget,
            in_flight: state.in_flight.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

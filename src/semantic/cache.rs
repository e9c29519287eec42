//! TTL cache for search results.
//!
//! Entries are valid while `now - timestamp < ttl`. Expired entries are
//! dropped lazily on read; [`SearchCache::cleanup`] sweeps them eagerly.
//! All state, including the hit/miss/eviction counters, sits behind one
//! mutex so concurrent callers never lose counter updates or observe a
//! half-written entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::semantic::distance::DistanceFunction;
use crate::semantic::eviction::{EvictionKind, EvictionPolicy};
use crate::semantic::record::SearchResult;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Failed to derive cache key: {0}")]
    KeyDerivation(String),
}

/// Rough in-memory footprint of a cached value.
pub trait CacheWeight {
    fn estimated_bytes(&self) -> usize;
}

impl CacheWeight for Vec<SearchResult> {
    fn estimated_bytes(&self) -> usize {
        self.iter()
            .map(|r| {
                let metadata = r
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_vec(m).map(|b| b.len()).unwrap_or(0))
                    .unwrap_or(0);
                std::mem::size_of::<SearchResult>() + r.id.len() + metadata
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: Instant,
    pub ttl: Duration,
    pub hits: u64,
}

impl<T> CacheEntry<T> {
    fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) < self.ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_count: u64,
    pub estimated_memory_bytes: usize,
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    policy: Box<dyn EvictionPolicy>,
    hits: u64,
    misses: u64,
    evictions: u64,
    /// Bumped by every `clear`.
    generation: u64,
}

impl<T> CacheState<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        self.policy.record_remove(key);
        self.entries.remove(key)
    }

    fn evict_one(&mut self) {
        if let Some(victim) = self.policy.victim() {
            self.remove(&victim);
            self.evictions += 1;
            log::debug!("Evicted cache entry {victim}");
        }
    }

    fn insert(&mut self, key: &str, entry: CacheEntry<T>, max_size: usize) {
        if !self.entries.contains_key(key) && self.entries.len() >= max_size {
            self.evict_one();
        }
        self.entries.insert(key.to_string(), entry);
        self.policy.record_insert(key);
    }
}

/// Bounded TTL cache, generic over the cached value.
pub struct SearchCache<T> {
    state: Mutex<CacheState<T>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<T: Clone + CacheWeight> SearchCache<T> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self::with_policy(max_size, default_ttl, EvictionKind::default().build())
    }

    pub fn with_policy(
        max_size: usize,
        default_ttl: Duration,
        policy: Box<dyn EvictionPolicy>,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                policy,
                hits: 0,
                misses: 0,
                evictions: 0,
                generation: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState<T>>, CacheError> {
        self.state
            .lock()
            .map_err(|e| CacheError::LockPoisoned(e.to_string()))
    }

    /// Return a live entry, counting a hit; otherwise count a miss.
    pub fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut state = self.lock()?;
        let now = Instant::now();

        match state.entries.get(key).map(|entry| entry.is_valid(now)) {
            None => {
                state.misses += 1;
                Ok(None)
            }
            Some(false) => {
                state.remove(key);
                state.misses += 1;
                Ok(None)
            }
            Some(true) => {
                state.hits += 1;
                state.policy.record_access(key);
                Ok(state.entries.get_mut(key).map(|entry| {
                    entry.hits += 1;
                    entry.data.clone()
                }))
            }
        }
    }

    /// Insert or overwrite `key`. A new key at capacity evicts one entry first.
    pub fn set(&self, key: &str, data: T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let entry = self.entry(data, ttl);
        self.lock()?.insert(key, entry, self.max_size);
        Ok(())
    }

    /// Current generation. Any `clear` moves it forward.
    pub fn generation(&self) -> Result<u64, CacheError> {
        Ok(self.lock()?.generation)
    }

    /// Like [`set`](Self::set), but only if no `clear` happened since
    /// `generation` was read. Returns whether the entry was written.
    ///
    /// Lets a reader that computed `data` from a snapshot taken before a
    /// concurrent invalidation drop its result instead of caching it.
    pub fn set_if_generation(
        &self,
        key: &str,
        data: T,
        ttl: Option<Duration>,
        generation: u64,
    ) -> Result<bool, CacheError> {
        let entry = self.entry(data, ttl);
        let mut state = self.lock()?;
        if state.generation != generation {
            return Ok(false);
        }
        state.insert(key, entry, self.max_size);
        Ok(true)
    }

    fn entry(&self, data: T, ttl: Option<Duration>) -> CacheEntry<T> {
        CacheEntry {
            data,
            timestamp: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            hits: 0,
        }
    }

    /// Liveness check without touching data or counters.
    pub fn has(&self, key: &str) -> Result<bool, CacheError> {
        let mut state = self.lock()?;
        let valid = match state.entries.get(key) {
            Some(entry) => entry.is_valid(Instant::now()),
            None => return Ok(false),
        };
        if !valid {
            state.remove(key);
        }
        Ok(valid)
    }

    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    /// Drop every entry and start a new generation. Counters are kept.
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.policy.clear();
        state.generation += 1;
        Ok(())
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn cleanup(&self) -> Result<usize, CacheError> {
        let mut state = self.lock()?;
        let now = Instant::now();

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_valid(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }

        if !expired.is_empty() {
            log::debug!("Swept {} expired cache entries", expired.len());
        }
        Ok(expired.len())
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let state = self.lock()?;
        let lookups = state.hits + state.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (
                state.hits as f64 / lookups as f64,
                state.misses as f64 / lookups as f64,
            )
        };

        let estimated_memory_bytes = state
            .entries
            .iter()
            .map(|(key, entry)| {
                key.len() + std::mem::size_of::<CacheEntry<T>>() + entry.data.estimated_bytes()
            })
            .sum();

        Ok(CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            miss_rate,
            eviction_count: state.evictions,
            estimated_memory_bytes,
        })
    }
}

/// Digest of everything that determines a similarity search result.
///
/// `query` must already be in the form that is scored (normalised for
/// cosine). Filters are keyed by a `BTreeMap`, so their order never affects
/// the digest; `-0.0` and `0.0` hash the same.
pub fn search_cache_key(
    distance_function: DistanceFunction,
    query: &[f32],
    limit: usize,
    threshold: f32,
    filters: &BTreeMap<String, serde_json::Value>,
) -> Result<String, CacheError> {
    let canonical = |x: f32| if x == 0.0 { 0.0f32 } else { x };

    let mut hasher = Sha256::new();
    hasher.update(distance_function.to_string().as_bytes());
    hasher.update((query.len() as u64).to_le_bytes());
    for &x in query {
        hasher.update(canonical(x).to_bits().to_le_bytes());
    }
    hasher.update((limit as u64).to_le_bytes());
    hasher.update(canonical(threshold).to_bits().to_le_bytes());

    let filters =
        serde_json::to_vec(filters).map_err(|e| CacheError::KeyDerivation(e.to_string()))?;
    hasher.update(&filters);

    Ok(format!("{:x}", hasher.finalize()))
}

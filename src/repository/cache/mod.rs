//! TTL cache of loaded models keyed by location.
//!
//! Lock poisoning is treated as an unavailable cache: reads become misses and
//! writes are dropped, so the caller always falls through to storage.


use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::model::SemanticModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheEntry {
    model: SemanticModel,
    inserted_at: Instant,
}

pub struct ModelCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ModelCache {
    #[inline]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<SemanticModel> {
        let found = match self.entries.read() {
            Ok(entries) => entries
                .get(key)
                .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
                .map(|entry| entry.model.clone()),
            Err(_) => {
                warn!("Model cache unavailable, treating lookup of {} as a miss", key);
                None
            }
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {}", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss for {}", key);
        }

        found
    }

    #[inline]
    pub fn insert(&self, key: &str, model: SemanticModel) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        model,
                        inserted_at: Instant::now(),
                    },
                );
            }
            Err(_) => warn!("Model cache unavailable, not caching {}", key),
        }
    }

    #[inline]
    pub fn invalidate(&self, key: &str) {
        match self.entries.write() {
            Ok(mut entries) => {
                if entries.remove(key).is_some() {
                    debug!("Invalidated cache entry for {}", key);
                }
            }
            Err(_) => warn!("Model cache unavailable, could not invalidate {}", key),
        }
    }

    #[inline]
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .read()
            .map(|entries| {
                entries
                    .values()
                    .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
                    .count()
            })
            .unwrap_or(0);

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

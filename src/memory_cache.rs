use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{Cache, CacheKey, CachedValue, Invalidation};
use crate::types::OrgId;

/// In-memory cache for decisions and listings.
///
/// Entries live in a sharded [`DashMap`] so concurrent checks for different
/// subjects rarely contend on the same lock. Recency is tracked in one LRU
/// queue and `capacity` bounds the total entry count across all shards.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    order: Arc<Mutex<VecDeque<CacheKey>>>,
    capacity: usize,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    updated_at: Instant,
}

impl MemoryCache {
    /// Creates a new cache with the given capacity.
    ///
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            order: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            ttl: None,
        }
    }

    /// Configures a time-to-live for cache entries.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the number of independently locked partitions.
    ///
    /// The count is rounded up to a power of two of at least 2. Existing
    /// entries are dropped.
    pub fn with_shards(mut self, shards: usize) -> Self {
        let shards = shards.max(2).next_power_of_two();
        self.entries = Arc::new(DashMap::with_shard_amount(shards));
        self.order = Arc::new(Mutex::new(VecDeque::new()));
        self
    }

    // Lock order: a map guard is never held while waiting on `order`.
    fn order(&self) -> MutexGuard<'_, VecDeque<CacheKey>> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(order: &mut VecDeque<CacheKey>, key: &CacheKey) {
        order.retain(|existing| existing != key);
        order.push_back(key.clone());
    }

    fn is_expired(entry: &CacheEntry, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(entry.updated_at) > ttl
    }

    fn evict_if_needed(&self, order: &mut VecDeque<CacheKey>, now: Instant) {
        if self.entries.len() <= self.capacity {
            return;
        }
        if let Some(ttl) = self.ttl {
            self.entries
                .retain(|_, entry| !Self::is_expired(entry, ttl, now));
        }
        while self.entries.len() > self.capacity {
            let Some(key) = order.pop_front() else {
                break;
            };
            self.entries.remove(&key);
        }
        order.retain(|key| self.entries.contains_key(key));
    }

    fn retain(&self, keep: impl Fn(&CacheKey) -> bool) {
        self.entries.retain(|key, _| keep(key));
        let mut order = self.order();
        order.retain(|key| self.entries.contains_key(key));
    }

    /// Returns the number of live entries across all shards.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        if self.capacity == 0 {
            return None;
        }

        let now = Instant::now();
        let entry = self.entries.get(key).map(|entry| entry.value().clone())?;
        if let Some(ttl) = self.ttl
            && Self::is_expired(&entry, ttl, now)
        {
            self.remove(key).await;
            return None;
        }

        Self::touch(&mut self.order(), key);
        Some(entry.value)
    }

    async fn set(&self, key: CacheKey, value: CachedValue) {
        if self.capacity == 0 {
            return;
        }

        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                updated_at: now,
            },
        );
        let mut order = self.order();
        Self::touch(&mut order, &key);
        self.evict_if_needed(&mut order, now);
    }

    async fn remove(&self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.order().retain(|existing| existing != key);
        }
    }

    async fn invalidate(&self, invalidation: &Invalidation) {
        self.retain(|key| !invalidation.matches(key));
    }

    async fn invalidate_organization(&self, org: &OrgId) {
        self.retain(|key| key.org() != org);
    }
}

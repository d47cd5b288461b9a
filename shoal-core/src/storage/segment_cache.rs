//! Segment cache with expiration and count eviction.
//!
//! Eviction runs after every store. Entries matched by the lock predicate
//! of their stream are never evicted, whatever their age or the count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::stream::{Segment, SegmentKey, StreamId};

/// Returns true while a segment must stay cached.
pub type LockPredicate = Box<dyn Fn(&Segment) -> bool + Send + Sync>;

/// Loaded segment bytes and the times eviction looks at.
#[derive(Debug, Clone)]
pub struct CachedSegment {
    pub segment: Arc<Segment>,
    pub data: Bytes,
    /// When this entry was first cached
    pub cached_at: Instant,
    /// Last time this segment was stored or read
    pub last_accessed: Instant,
}

/// Lookup and eviction counters, reported in `LoaderStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Segment bytes keyed by stream and local id.
///
/// Iteration order of the underlying LRU is access order, so count
/// eviction walks it from the least recently used end.
pub struct SegmentCache {
    entries: LruCache<SegmentKey, CachedSegment>,
    lock_predicates: HashMap<StreamId, LockPredicate>,
    config: CacheConfig,
    stats: CacheStats,
}

impl SegmentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            lock_predicates: HashMap::new(),
            config,
            stats: CacheStats::default(),
        }
    }

    /// Stores segment bytes and runs eviction, returning evicted keys.
    pub fn store(&mut self, segment: Arc<Segment>, data: Bytes, now: Instant) -> Vec<SegmentKey> {
        let key = segment.key();
        tracing::debug!(segment = %key, bytes = data.len(), "Caching segment");
        self.entries.put(
            key,
            CachedSegment {
                segment,
                data,
                cached_at: now,
                last_accessed: now,
            },
        );
        self.evict(now)
    }

    /// Returns segment bytes and marks the entry as accessed.
    pub fn get(&mut self, key: &SegmentKey, now: Instant) -> Option<Bytes> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = now;
                self.stats.hits += 1;
                Some(entry.data.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Checks presence without touching access order.
    pub fn has(&self, key: &SegmentKey) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// External ids of the segments cached for a stream.
    pub fn stored_external_ids(&self, stream: StreamId) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|(key, _)| key.stream == stream)
            .map(|(_, entry)| entry.segment.external_id)
            .collect()
    }

    pub fn register_lock_predicate(&mut self, stream: StreamId, predicate: LockPredicate) {
        self.lock_predicates.insert(stream, predicate);
    }

    /// Removes expired then excess entries, skipping locked ones.
    pub fn evict(&mut self, now: Instant) -> Vec<SegmentKey> {
        let is_locked = |predicates: &HashMap<StreamId, LockPredicate>, entry: &CachedSegment| {
            predicates
                .get(&entry.segment.stream)
                .is_some_and(|predicate| predicate(&entry.segment))
        };

        let mut evicted: Vec<SegmentKey> = Vec::new();

        if let Some(expiration) = self.config.cached_segment_expiration {
            evicted.extend(
                self.entries
                    .iter()
                    .filter(|(_, entry)| {
                        now.saturating_duration_since(entry.last_accessed) > expiration
                            && !is_locked(&self.lock_predicates, entry)
                    })
                    .map(|(key, _)| key.clone()),
            );
            for key in &evicted {
                self.entries.pop(key);
            }
        }

        let cap = self.config.cached_segments_count;
        if self.entries.len() > cap {
            let excess = self.entries.len() - cap;
            let over_cap: Vec<SegmentKey> = self
                .entries
                .iter()
                .rev()
                .filter(|(_, entry)| !is_locked(&self.lock_predicates, entry))
                .take(excess)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &over_cap {
                self.entries.pop(key);
            }
            evicted.extend(over_cap);
        }

        if !evicted.is_empty() {
            self.stats.evictions += evicted.len() as u64;
            tracing::debug!(count = evicted.len(), remaining = self.entries.len(), "Evicted segments");
        }
        evicted
    }
}

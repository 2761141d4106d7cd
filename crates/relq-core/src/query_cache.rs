//! Shape-keyed query result cache.
//!
//! Compiled query results are cached under the structural shape of their
//! predicate and reused across differing literal parameters: an exact match
//! reuses the rows verbatim, a super-match filters them. Entries are
//! invalidated implicitly: each stores the update-count snapshot of every
//! entity type it touched, and a lookup treats any counter mismatch as a
//! miss. No eviction pass is needed for staleness; a capacity bound evicts
//! the least-used entry on overflow.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use relq_model::{EntityType, RowList};

use crate::predicate::{shape_hash, shape_match, EvalContext, Predicate, ShapeMatch};
use crate::source::CacheSource;

/// A cached compiled query: predicate, result rows, and the staleness
/// token snapshot taken when the result was recorded.
struct CachedQuery {
    predicate: Predicate,
    rows: RowList,
    stamps: Vec<(EntityType, u64)>,
    hit_count: AtomicU64,
}

impl CachedQuery {
    /// Safe to reuse only while every touched entity's update counter
    /// still equals the snapshot.
    fn is_fresh(&self, cache: &dyn CacheSource) -> bool {
        self.stamps
            .iter()
            .all(|(entity, stamp)| cache.update_count(entity) == *stamp)
    }

    fn record_hit(&self) {
        self.hit_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn hits(&self) -> u64 {
        self.hit_count.load(AtomicOrdering::Relaxed)
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct QueryCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCacheStats {
    /// Lookup hits (exact and super).
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Lookup misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Entries evicted by the capacity bound.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Hit rate in [0.0, 1.0].
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Concurrent shape-keyed result cache.
///
/// Reads take no global lock; writes lock one shard at a time.
pub struct QueryCache {
    entries: DashMap<u64, Vec<Arc<CachedQuery>>>,
    capacity: usize,
    len: AtomicUsize,
    stats: QueryCacheStats,
}

impl QueryCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            len: AtomicUsize::new(0),
            stats: QueryCacheStats::default(),
        }
    }

    /// Look up a result for the probe predicate.
    ///
    /// An exact shape match returns the cached rows verbatim; a super-match
    /// filters them through the probe. Stale entries are treated as misses
    /// and dropped lazily.
    pub fn lookup(&self, probe: &Predicate, ctx: &EvalContext<'_>) -> Option<RowList> {
        let key = shape_hash(probe);
        let max_set = ctx.config().super_match_max_set_size;

        let mut result = None;
        let mut saw_stale = false;
        if let Some(entry) = self.entries.get(&key) {
            for cached in entry.iter() {
                if !cached.is_fresh(ctx.cache()) {
                    saw_stale = true;
                    continue;
                }
                match shape_match(probe, &cached.predicate, max_set) {
                    ShapeMatch::Exact => {
                        cached.record_hit();
                        result = Some(Arc::clone(&cached.rows));
                        break;
                    }
                    ShapeMatch::Superset => {
                        cached.record_hit();
                        result = Some(probe.apply_to_list(&cached.rows, ctx));
                        break;
                    }
                    ShapeMatch::NoMatch => {}
                }
            }
        }

        if saw_stale {
            self.drop_stale(key, ctx.cache());
        }

        match &result {
            Some(_) => {
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            }
            None => {
                self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
        result
    }

    /// Record a compiled result, snapshotting the update counter of every
    /// touched entity type. Queries touching temporary entity types are
    /// never cached.
    pub fn insert(&self, predicate: &Predicate, rows: RowList, cache: &dyn CacheSource) {
        let mut entities = HashSet::new();
        predicate.collect_entities(&mut entities);
        if entities.iter().any(|e| e.is_temporary()) {
            return;
        }
        let stamps: Vec<(EntityType, u64)> = entities
            .into_iter()
            .map(|e| {
                let stamp = cache.update_count(&e);
                (e, stamp)
            })
            .collect();

        let key = shape_hash(predicate);
        let cached = Arc::new(CachedQuery {
            predicate: predicate.clone(),
            rows,
            stamps,
            hit_count: AtomicU64::new(0),
        });

        {
            let mut entry = self.entries.entry(key).or_default();
            if let Some(position) = entry
                .iter()
                .position(|existing| existing.predicate == cached.predicate)
            {
                entry[position] = cached;
            } else {
                entry.push(cached);
                self.len.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }

        while self.len.load(AtomicOrdering::Relaxed) > self.capacity {
            if !self.evict_least_used() {
                break;
            }
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
        self.len.store(0, AtomicOrdering::Relaxed);
    }

    /// Cache statistics.
    pub fn stats(&self) -> &QueryCacheStats {
        &self.stats
    }

    fn drop_stale(&self, key: u64, cache: &dyn CacheSource) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            let before = entry.len();
            entry.retain(|cached| cached.is_fresh(cache));
            let removed = before - entry.len();
            if removed > 0 {
                self.len.fetch_sub(removed, AtomicOrdering::Relaxed);
            }
        }
        self.entries.remove_if(&key, |_, entry| entry.is_empty());
    }

    fn evict_least_used(&self) -> bool {
        let mut victim: Option<(u64, u64)> = None;
        for entry in self.entries.iter() {
            for cached in entry.value() {
                let hits = cached.hits();
                if victim.map(|(_, best)| hits < best).unwrap_or(true) {
                    victim = Some((*entry.key(), hits));
                }
            }
        }
        let Some((key, hits)) = victim else {
            return false;
        };

        let mut removed = false;
        if let Some(mut entry) = self.entries.get_mut(&key) {
            if let Some(position) = entry.iter().position(|c| c.hits() == hits) {
                entry.remove(position);
                self.len.fetch_sub(1, AtomicOrdering::Relaxed);
                self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
                removed = true;
            }
        }
        self.entries.remove_if(&key, |_, entry| entry.is_empty());
        removed
    }
}

//! The cache & cost resolver.
//!
//! [`Resolver::resolve`] is the single entry point: it propagates implied
//! equalities through the predicate, then picks the cheapest access path in
//! a fixed order: shape-match cache hit, full-cache resolution,
//! partial-cache probe, and finally a database round trip whose compiled
//! result is recorded in the shape-match cache for reuse.

pub mod cost;
mod index;

pub use index::{IndexReference, IndexRegistry};

use std::sync::Arc;

use relq_model::{shared_row_list, Row, RowList};
use tracing::debug;

use crate::config::ResolverConfig;
use crate::deep_fetch::{DeepFetchNode, DeepFetchResult};
use crate::error::Error;
use crate::mapper::Mapper;
use crate::predicate::{EvalContext, Predicate};
use crate::propagate::TransitivePropagator;
use crate::query_cache::QueryCache;
use crate::source::{CacheSource, DatabaseSource};

/// Chooses between cache and database per predicate and caches compiled
/// results by shape.
pub struct Resolver {
    cache: Arc<dyn CacheSource>,
    database: Arc<dyn DatabaseSource>,
    indexes: IndexRegistry,
    query_cache: QueryCache,
    config: ResolverConfig,
    pool: Option<rayon::ThreadPool>,
}

impl Resolver {
    /// Create a resolver with the default configuration.
    pub fn new(
        cache: Arc<dyn CacheSource>,
        database: Arc<dyn DatabaseSource>,
    ) -> Result<Self, Error> {
        Self::with_config(cache, database, ResolverConfig::default())
    }

    /// Create a resolver with an explicit configuration.
    pub fn with_config(
        cache: Arc<dyn CacheSource>,
        database: Arc<dyn DatabaseSource>,
        config: ResolverConfig,
    ) -> Result<Self, Error> {
        let pool = if config.filter_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.filter_workers)
                .build()
                .map_err(|e| Error::WorkerPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            indexes: IndexRegistry::new(Arc::clone(&cache)),
            query_cache: QueryCache::new(config.query_cache_capacity),
            cache,
            database,
            config,
            pool,
        })
    }

    /// The resolver configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// The shape-match query cache.
    pub fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    /// The index-reference memo.
    pub fn indexes(&self) -> &IndexRegistry {
        &self.indexes
    }

    /// The underlying cache.
    pub fn cache(&self) -> &dyn CacheSource {
        &*self.cache
    }

    pub(crate) fn database(&self) -> &dyn DatabaseSource {
        &*self.database
    }

    /// Evaluation context bound to this resolver's memo, configuration,
    /// and worker pool.
    pub fn eval_context(&self) -> EvalContext<'_> {
        EvalContext::new(&self.indexes, &self.config).with_pool(self.pool.as_ref())
    }

    /// Resolve a predicate, choosing cache or database internally.
    pub fn resolve(&self, predicate: &Predicate) -> Result<RowList, Error> {
        let ctx = self.eval_context();

        if predicate.is_none() {
            return Ok(shared_row_list(Vec::new()));
        }

        let optimized = TransitivePropagator::propagate(predicate, &ctx);

        if let Some(rows) = self.query_cache.lookup(predicate, &ctx) {
            return Ok(rows);
        }
        if optimized != *predicate {
            if let Some(rows) = self.query_cache.lookup(&optimized, &ctx) {
                return Ok(rows);
            }
        }

        if let Some(rows) = optimized.apply_to_full_cache(&ctx) {
            let rows = shared_row_list(rows);
            self.record(predicate, &optimized, &rows);
            return Ok(rows);
        }

        if let Some(rows) = optimized.apply_to_partial_cache(&ctx) {
            let rows = shared_row_list(rows);
            self.record(predicate, &optimized, &rows);
            return Ok(rows);
        }

        debug!(entity = %predicate.entity(), "resolving via database round trip");
        let rows = shared_row_list(self.database.execute(&optimized)?);
        self.record(predicate, &optimized, &rows);
        Ok(rows)
    }

    /// Batch-resolve a relationship for a list of parent objects.
    pub fn deep_fetch(
        &self,
        parents: &[Arc<Row>],
        mapper: &Mapper,
    ) -> Result<DeepFetchResult, Error> {
        let mut node = DeepFetchNode::new(self, parents, mapper.clone());
        node.resolve()
    }

    /// Record a compiled result under both the caller's shape and the
    /// propagated shape, so either form of a repeat query hits.
    fn record(&self, original: &Predicate, optimized: &Predicate, rows: &RowList) {
        self.query_cache
            .insert(optimized, Arc::clone(rows), &*self.cache);
        if original != optimized {
            self.query_cache
                .insert(original, Arc::clone(rows), &*self.cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::IndexInfo;
    use crate::test_support::{MemoryCache, TestDatabase};
    use relq_model::{EntityType, Value};

    struct Fixture {
        cache: Arc<MemoryCache>,
        database: Arc<TestDatabase>,
        customer: EntityType,
    }

    /// The database store holds 20 customers; the cache holds the first
    /// `cached` of them.
    fn fixture(cached: usize, fully: bool) -> Fixture {
        let customer = EntityType::new("Customer");
        let store = Arc::new(MemoryCache::new());
        let cache = MemoryCache::new();
        cache.define_index(
            vec![customer.attribute("id")],
            IndexInfo::unique_immutable(),
        );
        for i in 0..20i64 {
            let fields = vec![
                ("id".into(), Value::Int64(i)),
                ("region".into(), Value::String(format!("R{}", i % 4))),
            ];
            store.insert_row(&customer, i as u64, fields.clone());
            if (i as usize) < cached {
                cache.insert_row(&customer, i as u64, fields);
            }
        }
        if fully {
            cache.set_fully_cached(&customer);
        }
        Fixture {
            cache: Arc::new(cache),
            database: Arc::new(TestDatabase::new(store)),
            customer,
        }
    }

    fn resolver(f: &Fixture) -> Resolver {
        Resolver::new(
            Arc::clone(&f.cache) as Arc<dyn CacheSource>,
            Arc::clone(&f.database) as Arc<dyn DatabaseSource>,
        )
        .unwrap()
    }

    #[test]
    fn test_full_cache_answers_without_database() {
        let f = fixture(20, true);
        let resolver = resolver(&f);

        let rows = resolver
            .resolve(&Predicate::equals(f.customer.attribute("region"), "R1"))
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(f.database.calls(), 0);
    }

    #[test]
    fn test_partial_cache_unique_hit_avoids_database() {
        let f = fixture(10, false);
        let resolver = resolver(&f);

        let rows = resolver
            .resolve(&Predicate::equals(f.customer.attribute("id"), 3i64))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(f.database.calls(), 0);
    }

    #[test]
    fn test_partial_cache_scan_goes_to_database() {
        let f = fixture(10, false);
        let resolver = resolver(&f);

        let rows = resolver
            .resolve(&Predicate::equals(f.customer.attribute("region"), "R1"))
            .unwrap();
        // The database sees the full store.
        assert_eq!(rows.len(), 5);
        assert_eq!(f.database.calls(), 1);
    }

    #[test]
    fn test_repeat_query_hits_shape_cache() {
        let f = fixture(10, false);
        let resolver = resolver(&f);
        let pred = Predicate::equals(f.customer.attribute("region"), "R2");

        resolver.resolve(&pred).unwrap();
        resolver.resolve(&pred).unwrap();
        assert_eq!(f.database.calls(), 1);
        assert!(resolver.query_cache().stats().hits() >= 1);
    }

    #[test]
    fn test_super_match_reuses_cached_round_trip() {
        let f = fixture(10, false);
        let resolver = resolver(&f);

        let broad = Predicate::is_in(
            f.customer.attribute("region"),
            vec!["R1", "R2", "R3"],
        );
        resolver.resolve(&broad).unwrap();
        assert_eq!(f.database.calls(), 1);

        let narrow = Predicate::is_in(f.customer.attribute("region"), vec!["R1", "R2"]);
        let rows = resolver.resolve(&narrow).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(f.database.calls(), 1);
    }

    #[test]
    fn test_update_invalidates_cached_result() {
        let f = fixture(10, false);
        let resolver = resolver(&f);
        let pred = Predicate::equals(f.customer.attribute("region"), "R0");

        resolver.resolve(&pred).unwrap();
        f.cache.bump_update_count(&f.customer);
        resolver.resolve(&pred).unwrap();
        assert_eq!(f.database.calls(), 2);
    }

    #[test]
    fn test_deleted_row_is_filtered_from_results() {
        let f = fixture(20, true);
        let resolver = resolver(&f);

        f.cache.delete_row(&f.customer, 3);
        let rows = resolver
            .resolve(&Predicate::equals(f.customer.attribute("id"), 3i64))
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(f.database.calls(), 0);
    }

    #[test]
    fn test_none_sentinel_resolves_empty() {
        let f = fixture(10, false);
        let resolver = resolver(&f);

        let rows = resolver
            .resolve(&Predicate::none(f.customer.clone()))
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(f.database.calls(), 0);
    }
}

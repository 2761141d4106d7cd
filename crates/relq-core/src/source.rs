//! External interfaces consumed by the resolution core.
//!
//! The core never owns a cache or a connection; it consumes both through
//! these traits. The cache contract covers index resolution and lookup,
//! full-population iteration, cardinality metadata, a generation token for
//! rebuild detection, and per-entity update counts for staleness checks.

use std::sync::Arc;

use relq_model::{Attribute, EntityType, Row, Value};

use crate::error::Error;
use crate::predicate::Predicate;

/// Opaque handle to a cache index.
///
/// Handles are only meaningful to the cache that issued them and only while
/// the issuing generation is current; the resolver re-resolves on mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexHandle(pub u64);

/// Metadata for a cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    /// At most one row per key.
    pub unique: bool,
    /// The indexed attributes never change after insertion. Unique
    /// immutable indexes are trustworthy even against a partial cache.
    pub immutable: bool,
    /// Average rows per key for non-unique indexes (1 for unique).
    pub avg_rows_per_key: usize,
}

impl IndexInfo {
    /// Metadata for a unique index.
    pub fn unique() -> Self {
        Self {
            unique: true,
            immutable: false,
            avg_rows_per_key: 1,
        }
    }

    /// Metadata for a unique index over immutable attributes.
    pub fn unique_immutable() -> Self {
        Self {
            unique: true,
            immutable: true,
            avg_rows_per_key: 1,
        }
    }

    /// Metadata for a non-unique index.
    pub fn non_unique(avg_rows_per_key: usize) -> Self {
        Self {
            unique: false,
            immutable: false,
            avg_rows_per_key: avg_rows_per_key.max(1),
        }
    }
}

/// The in-memory cache contract consumed by the resolver.
///
/// Implementations are free to back this with any index structure; the
/// resolver only relies on the behavior specified per method.
pub trait CacheSource: Send + Sync {
    /// Current cache generation. Incremented on every index rebuild;
    /// handles issued under an older generation must be re-resolved.
    fn generation(&self) -> u64;

    /// Resolve an index over the given attribute set, if one exists.
    fn find_index(
        &self,
        entity: &EntityType,
        attributes: &[Attribute],
    ) -> Option<(IndexHandle, IndexInfo)>;

    /// Look up rows by index key. Key values are in the same order as the
    /// attributes the index was resolved with.
    ///
    /// Returns `None` when the handle is no longer valid (generation
    /// mismatch); the caller re-resolves and retries.
    fn index_lookup(&self, handle: IndexHandle, key: &[Value]) -> Option<Vec<Arc<Row>>>;

    /// Whether the entire population of the entity type is cache-resident.
    fn is_fully_cached(&self, entity: &EntityType) -> bool;

    /// Number of cache-resident rows for the entity type.
    fn row_count(&self, entity: &EntityType) -> usize;

    /// Iterate every cache-resident row of the entity type.
    fn for_each_row(&self, entity: &EntityType, f: &mut dyn FnMut(&Arc<Row>));

    /// Monotonically increasing per-entity update counter, used for
    /// cached-query staleness detection.
    fn update_count(&self, entity: &EntityType) -> u64;
}

/// The database boundary: given a predicate, emit and execute a
/// parameterized query and return materialized rows.
pub trait DatabaseSource: Send + Sync {
    /// Execute the predicate against the database.
    fn execute(&self, predicate: &Predicate) -> Result<Vec<Arc<Row>>, Error>;
}

/// Collect all cache-resident rows of an entity type.
pub fn collect_rows(cache: &dyn CacheSource, entity: &EntityType) -> Vec<Arc<Row>> {
    let mut rows = Vec::with_capacity(cache.row_count(entity));
    cache.for_each_row(entity, &mut |row| rows.push(Arc::clone(row)));
    rows
}

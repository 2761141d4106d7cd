//! Resolver-owned index-reference memoization.
//!
//! Predicates are immutable; the lazily-resolved index references they
//! depend on live here, in a table owned by the resolver, keyed by
//! (entity type, attribute set) and tagged with the cache generation they
//! were resolved against. A stale reference is re-resolved transparently,
//! never used. Races only cause redundant recomputation: the memo insert is
//! idempotent.

use std::sync::Arc;

use dashmap::DashMap;
use relq_model::{Attribute, EntityType, Row, Value};

use crate::source::{CacheSource, IndexHandle, IndexInfo};

/// A generation-tagged handle to a cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexReference {
    /// The cache's opaque handle.
    pub handle: IndexHandle,
    /// Uniqueness and cardinality metadata.
    pub info: IndexInfo,
    /// Cache generation this reference was resolved against.
    pub generation: u64,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    entity: EntityType,
    attributes: Vec<Attribute>,
}

/// Memoization table for index references.
pub struct IndexRegistry {
    cache: Arc<dyn CacheSource>,
    memo: DashMap<IndexKey, IndexReference>,
}

impl IndexRegistry {
    /// Create a registry over the given cache.
    pub fn new(cache: Arc<dyn CacheSource>) -> Self {
        Self {
            cache,
            memo: DashMap::new(),
        }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &dyn CacheSource {
        &*self.cache
    }

    /// Resolve an index reference for the attribute set, reusing the memo
    /// while its generation is current.
    pub fn resolve(
        &self,
        entity: &EntityType,
        attributes: &[Attribute],
    ) -> Option<IndexReference> {
        let key = IndexKey {
            entity: entity.clone(),
            attributes: attributes.to_vec(),
        };
        let current = self.cache.generation();

        if let Some(memoized) = self.memo.get(&key) {
            if memoized.generation == current {
                return Some(*memoized);
            }
        }

        let (handle, info) = self.cache.find_index(entity, attributes)?;
        let reference = IndexReference {
            handle,
            info,
            generation: current,
        };
        self.memo.insert(key, reference);
        Some(reference)
    }

    /// Look up rows by index key, transparently re-resolving a reference
    /// the cache reports as stale.
    pub fn lookup(
        &self,
        entity: &EntityType,
        attributes: &[Attribute],
        key: &[Value],
    ) -> Option<Vec<Arc<Row>>> {
        let reference = self.resolve(entity, attributes)?;
        if let Some(rows) = self.cache.index_lookup(reference.handle, key) {
            return Some(rows);
        }

        // The handle went stale between resolve and lookup. Drop the memo
        // and retry once against the rebuilt index.
        self.memo.remove(&IndexKey {
            entity: entity.clone(),
            attributes: attributes.to_vec(),
        });
        let reference = self.resolve(entity, attributes)?;
        self.cache.index_lookup(reference.handle, key)
    }
}

//! In-memory cache and database fixtures shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use relq_model::{Attribute, EntityType, Row, RowId, Value};

use crate::config::ResolverConfig;
use crate::error::Error;
use crate::predicate::{EvalContext, Predicate};
use crate::resolver::IndexRegistry;
use crate::source::{CacheSource, DatabaseSource, IndexHandle, IndexInfo};

struct IndexDef {
    attributes: Vec<Attribute>,
    info: IndexInfo,
}

/// A linear-scan cache implementing the full [`CacheSource`] contract.
pub(crate) struct MemoryCache {
    rows: RwLock<HashMap<EntityType, Vec<Arc<Row>>>>,
    indexes: RwLock<Vec<IndexDef>>,
    fully_cached: RwLock<HashSet<EntityType>>,
    update_counts: RwLock<HashMap<EntityType, u64>>,
    generation: AtomicU64,
}

impl MemoryCache {
    pub(crate) fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            indexes: RwLock::new(Vec::new()),
            fully_cached: RwLock::new(HashSet::new()),
            update_counts: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn insert_row(
        &self,
        entity: &EntityType,
        id: RowId,
        fields: Vec<(String, Value)>,
    ) -> Arc<Row> {
        let row = Arc::new(Row::new(entity.clone(), id, fields));
        self.rows
            .write()
            .entry(entity.clone())
            .or_default()
            .push(Arc::clone(&row));
        row
    }

    pub(crate) fn define_index(&self, attributes: Vec<Attribute>, info: IndexInfo) {
        self.indexes.write().push(IndexDef { attributes, info });
    }

    pub(crate) fn set_fully_cached(&self, entity: &EntityType) {
        self.fully_cached.write().insert(entity.clone());
    }

    pub(crate) fn bump_update_count(&self, entity: &EntityType) {
        *self
            .update_counts
            .write()
            .entry(entity.clone())
            .or_insert(0) += 1;
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Tombstone a row and count the update.
    pub(crate) fn delete_row(&self, entity: &EntityType, id: RowId) {
        if let Some(rows) = self.rows.read().get(entity) {
            for row in rows {
                if row.id() == id {
                    row.mark_deleted();
                }
            }
        }
        self.bump_update_count(entity);
    }

    fn handle_for(&self, position: usize) -> IndexHandle {
        let generation = self.generation.load(AtomicOrdering::SeqCst);
        IndexHandle((generation << 16) | position as u64)
    }
}

impl CacheSource for MemoryCache {
    fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    fn find_index(
        &self,
        entity: &EntityType,
        attributes: &[Attribute],
    ) -> Option<(IndexHandle, IndexInfo)> {
        let indexes = self.indexes.read();
        for (i, def) in indexes.iter().enumerate() {
            if def.attributes == attributes
                && def.attributes.first().map(|a| a.entity()) == Some(entity)
            {
                return Some((self.handle_for(i), def.info));
            }
        }
        None
    }

    fn index_lookup(&self, handle: IndexHandle, key: &[Value]) -> Option<Vec<Arc<Row>>> {
        let current = self.generation.load(AtomicOrdering::SeqCst);
        if handle.0 >> 16 != current {
            return None;
        }
        let indexes = self.indexes.read();
        let def = indexes.get((handle.0 & 0xFFFF) as usize)?;
        let entity = def.attributes[0].entity().clone();
        let rows = self.rows.read();
        let mut out = Vec::new();
        for row in rows.get(&entity).map(Vec::as_slice).unwrap_or(&[]) {
            let hit = def
                .attributes
                .iter()
                .zip(key)
                .all(|(attr, value)| attr.value_in(row) == Some(value));
            if hit {
                out.push(Arc::clone(row));
            }
        }
        Some(out)
    }

    fn is_fully_cached(&self, entity: &EntityType) -> bool {
        self.fully_cached.read().contains(entity)
    }

    fn row_count(&self, entity: &EntityType) -> usize {
        self.rows.read().get(entity).map(Vec::len).unwrap_or(0)
    }

    fn for_each_row(&self, entity: &EntityType, f: &mut dyn FnMut(&Arc<Row>)) {
        if let Some(rows) = self.rows.read().get(entity) {
            for row in rows {
                f(row);
            }
        }
    }

    fn update_count(&self, entity: &EntityType) -> u64 {
        self.update_counts
            .read()
            .get(entity)
            .copied()
            .unwrap_or(0)
    }
}

/// A database that answers by scanning a backing [`MemoryCache`] store and
/// counts round trips.
pub(crate) struct TestDatabase {
    store: Arc<MemoryCache>,
    config: ResolverConfig,
    calls: AtomicUsize,
}

impl TestDatabase {
    pub(crate) fn new(store: Arc<MemoryCache>) -> Self {
        Self {
            store,
            config: ResolverConfig::default(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of round trips executed.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

impl DatabaseSource for TestDatabase {
    fn execute(&self, predicate: &Predicate) -> Result<Vec<Arc<Row>>, Error> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let registry = IndexRegistry::new(Arc::clone(&self.store) as Arc<dyn CacheSource>);
        let ctx = EvalContext::new(&registry, &self.config);
        let mut out = Vec::new();
        self.store.for_each_row(predicate.entity(), &mut |row| {
            if predicate.matches(row, &ctx) {
                out.push(Arc::clone(row));
            }
        });
        Ok(out)
    }
}

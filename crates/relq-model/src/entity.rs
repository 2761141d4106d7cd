//! Entity-type descriptors and materialized rows.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::value::Value;

/// Interned descriptor for an entity type.
///
/// Cheap to clone; equality and hashing go by name so two independently
/// constructed descriptors for the same entity compare equal.
#[derive(Clone)]
pub struct EntityType {
    inner: Arc<EntityInfo>,
}

struct EntityInfo {
    name: String,
    temporary: bool,
}

impl EntityType {
    /// Create a descriptor for a regular entity type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EntityInfo {
                name: name.into(),
                temporary: false,
            }),
        }
    }

    /// Create a descriptor for a temporary (synthetic) entity type.
    ///
    /// Temporary types are never estimatable and never shape-cached.
    pub fn temporary(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EntityInfo {
                name: name.into(),
                temporary: true,
            }),
        }
    }

    /// The entity type name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this is a temporary/synthetic type.
    pub fn is_temporary(&self) -> bool {
        self.inner.temporary
    }

    /// Construct an attribute of this entity type.
    pub fn attribute(&self, name: impl Into<String>) -> Attribute {
        Attribute::new(self.clone(), name)
    }

    /// Construct a bitemporal as-of attribute of this entity type.
    pub fn as_of_attribute(&self, name: impl Into<String>) -> Attribute {
        Attribute::as_of(self.clone(), name)
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name && self.inner.temporary == other.inner.temporary
    }
}

impl Eq for EntityType {}

impl std::hash::Hash for EntityType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.temporary {
            write!(f, "EntityType({}, temporary)", self.inner.name)
        } else {
            write!(f, "EntityType({})", self.inner.name)
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

/// Row identity within an entity type.
pub type RowId = u64;

/// A materialized object returned by the cache or the database.
///
/// Rows are shared as `Arc<Row>` and never mutated in place, except for the
/// tombstone flag: a concurrent delete marks the row, and every predicate
/// evaluation afterwards treats it as a non-match.
pub struct Row {
    entity: EntityType,
    id: RowId,
    fields: Vec<(String, Value)>,
    tombstone: AtomicBool,
}

impl Row {
    /// Create a row with named field values.
    pub fn new(entity: EntityType, id: RowId, fields: Vec<(String, Value)>) -> Self {
        Self {
            entity,
            id,
            fields,
            tombstone: AtomicBool::new(false),
        }
    }

    /// The owning entity type.
    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    /// The row identity.
    pub fn id(&self) -> RowId {
        self.id
    }

    /// Get a field value by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    /// All field values in declaration order.
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    /// Whether the row has been concurrently deleted.
    pub fn is_deleted(&self) -> bool {
        self.tombstone.load(AtomicOrdering::Acquire)
    }

    /// Mark the row as deleted. Subsequent `matches` calls see a non-match.
    pub fn mark_deleted(&self) {
        self.tombstone.store(true, AtomicOrdering::Release);
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("entity", &self.entity.name())
            .field("id", &self.id)
            .field("fields", &self.fields)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// A shared, immutable list of rows.
///
/// Results are passed around as one shared allocation; filtering that keeps
/// every row returns a clone of the handle instead of copying the list.
pub type RowList = Arc<Vec<Arc<Row>>>;

/// Build a shared row list from owned rows.
pub fn row_list(rows: Vec<Row>) -> RowList {
    Arc::new(rows.into_iter().map(Arc::new).collect())
}

/// Build a shared row list from already-shared rows.
pub fn shared_row_list(rows: Vec<Arc<Row>>) -> RowList {
    Arc::new(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_equality_by_name() {
        let a = EntityType::new("Customer");
        let b = EntityType::new("Customer");
        let c = EntityType::new("Order");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_temporary_entity_type() {
        let t = EntityType::temporary("TupleTemp");
        assert!(t.is_temporary());
        assert_ne!(t, EntityType::new("TupleTemp"));
    }

    #[test]
    fn test_row_field_lookup() {
        let customer = EntityType::new("Customer");
        let row = Row::new(
            customer,
            1,
            vec![
                ("id".to_string(), Value::Int64(1)),
                ("name".to_string(), Value::String("Alice".into())),
            ],
        );

        assert_eq!(row.get("name"), Some(&Value::String("Alice".into())));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_tombstone() {
        let row = Row::new(EntityType::new("Customer"), 1, vec![]);
        assert!(!row.is_deleted());
        row.mark_deleted();
        assert!(row.is_deleted());
    }
}

//! Attribute identities.

use std::fmt;
use std::sync::Arc;

use crate::entity::{EntityType, Row};
use crate::value::Value;

/// Kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// A regular scalar attribute.
    Plain,
    /// A bitemporal as-of attribute; an equality against it pins the row
    /// population to a point in time and counts as a temporal qualification
    /// for access-path ranking.
    AsOf,
}

/// Identifies a scalar field of a specific owning entity type.
///
/// Immutable; equality and hashing go by (owner type, field name). Cheap to
/// clone: the field name is shared.
#[derive(Clone)]
pub struct Attribute {
    entity: EntityType,
    name: Arc<str>,
    kind: AttributeKind,
}

impl Attribute {
    /// Create a plain attribute.
    pub fn new(entity: EntityType, name: impl Into<String>) -> Self {
        Self {
            entity,
            name: name.into().into(),
            kind: AttributeKind::Plain,
        }
    }

    /// Create an as-of attribute.
    pub fn as_of(entity: EntityType, name: impl Into<String>) -> Self {
        Self {
            entity,
            name: name.into().into(),
            kind: AttributeKind::AsOf,
        }
    }

    /// The owning entity type.
    pub fn entity(&self) -> &EntityType {
        &self.entity
    }

    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attribute kind.
    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Whether this is a bitemporal as-of attribute.
    pub fn is_as_of(&self) -> bool {
        self.kind == AttributeKind::AsOf
    }

    /// Read this attribute's value from a row.
    ///
    /// Returns `None` when the row belongs to a different entity type or
    /// does not carry the field.
    pub fn value_in<'a>(&self, row: &'a Row) -> Option<&'a Value> {
        if row.entity() != &self.entity {
            return None;
        }
        row.get(&self.name)
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.name == other.name
    }
}

impl Eq for Attribute {}

impl std::hash::Hash for Attribute {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity.name(), self.name)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity.name(), self.name)
    }
}

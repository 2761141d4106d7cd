//! The predicate algebra.
//!
//! A [`Predicate`] is one node of a constraint tree. Atomic nodes constrain
//! a single attribute; composite nodes combine children with AND/OR or wrap
//! a sub-predicate behind a relationship [`Mapper`]. Every predicate belongs
//! to exactly one result entity type and is immutable once constructed:
//! every simplification and substitution produces a new node.
//!
//! The `and`/`or` builders flatten nested combinations and run the pairwise
//! simplification matrix (see [`Predicate::combine_and`]), so the matched
//! row set of a tree is independent of construction order.

mod combine;
mod estimate;
mod eval;
mod shape;

use std::collections::HashSet;
use std::sync::Arc;

use relq_model::{Attribute, EntityType, Value};

use crate::mapper::Mapper;

pub use estimate::IndexStrength;
pub use eval::EvalContext;
pub use shape::{shape_hash, shape_match, ShapeMatch};

/// Comparison operator of a range atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeOp {
    /// Strictly greater than the bound.
    Greater,
    /// Greater than or equal to the bound.
    GreaterEq,
    /// Strictly less than the bound.
    Less,
    /// Less than or equal to the bound.
    LessEq,
}

impl RangeOp {
    /// Whether the operator accepts the given ordering of (row value, bound).
    pub(crate) fn accepts(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            RangeOp::Greater => ord == Greater,
            RangeOp::GreaterEq => ord != Less,
            RangeOp::Less => ord == Less,
            RangeOp::LessEq => ord != Greater,
        }
    }

    /// Whether this is a lower-bound operator.
    pub(crate) fn is_lower_bound(self) -> bool {
        matches!(self, RangeOp::Greater | RangeOp::GreaterEq)
    }
}

/// Operator and literal payload of an atomic predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomOp {
    /// Attribute equals the literal.
    Eq(Value),
    /// Attribute differs from the literal. Null attribute values match.
    NotEq(Value),
    /// Attribute compares against the bound.
    Range(RangeOp, Value),
    /// Attribute is a member of the set.
    In(Arc<HashSet<Value>>),
    /// Attribute is not a member of the set. Null attribute values match.
    NotIn(Arc<HashSet<Value>>),
    /// Attribute is null or absent.
    IsNull,
    /// Attribute is present and non-null.
    IsNotNull,
}

/// An atomic predicate: one operator applied to one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub(crate) attribute: Attribute,
    pub(crate) op: AtomOp,
}

impl Atom {
    /// The constrained attribute.
    pub fn attribute(&self) -> &Attribute {
        &self.attribute
    }

    /// The operator payload.
    pub fn op(&self) -> &AtomOp {
        &self.op
    }
}

/// A conjunction of equalities on one entity, canonically ordered by
/// attribute name.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiEquality {
    pub(crate) entity: EntityType,
    pub(crate) pairs: Vec<(Attribute, Value)>,
}

impl MultiEquality {
    /// The equality pairs in canonical order.
    pub fn pairs(&self) -> &[(Attribute, Value)] {
        &self.pairs
    }

    pub(crate) fn attributes(&self) -> Vec<Attribute> {
        self.pairs.iter().map(|(a, _)| a.clone()).collect()
    }

    pub(crate) fn values(&self) -> Vec<Value> {
        self.pairs.iter().map(|(_, v)| v.clone()).collect()
    }

    pub(crate) fn value_for(&self, attribute: &Attribute) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|(a, _)| a == attribute)
            .map(|(_, v)| v)
    }
}

/// Compares two attributes of the same row.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfCompare {
    pub(crate) left: Attribute,
    pub(crate) right: Attribute,
    pub(crate) negated: bool,
}

/// Multi-attribute set membership: the tuple of attribute values must be a
/// member of the tuple set. Used by the deep-fetch batch path for
/// multi-attribute joins.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleIn {
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) tuples: Arc<HashSet<Vec<Value>>>,
}

impl TupleIn {
    /// The tuple attributes in declaration order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// The tuple set.
    pub fn tuples(&self) -> &HashSet<Vec<Value>> {
        &self.tuples
    }
}

/// A sub-predicate evaluated across a relationship traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedPredicate {
    pub(crate) mapper: Mapper,
    pub(crate) inner: Box<Predicate>,
}

impl MappedPredicate {
    /// The relationship being traversed.
    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    /// The predicate on the far side of the relationship.
    pub fn inner(&self) -> &Predicate {
        &self.inner
    }
}

/// A node in the constraint tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row of the entity type.
    All(EntityType),
    /// Matches no row; the empty-result sentinel.
    None(EntityType),
    /// An atomic constraint on one attribute.
    Atom(Atom),
    /// A conjunction of equalities on one entity.
    MultiEquality(MultiEquality),
    /// Compares two attributes of the same row.
    SelfCompare(SelfCompare),
    /// Multi-attribute set membership.
    TupleIn(TupleIn),
    /// "Exists across this relationship": some related row satisfies the
    /// inner predicate.
    Mapped(MappedPredicate),
    /// "No related row satisfies the inner predicate."
    NotExists(MappedPredicate),
    /// All children match.
    And(Vec<Predicate>),
    /// At least one child matches.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// The predicate matching every row of the entity type.
    pub fn all(entity: EntityType) -> Predicate {
        Predicate::All(entity)
    }

    /// The predicate matching no row of the entity type.
    pub fn none(entity: EntityType) -> Predicate {
        Predicate::None(entity)
    }

    /// Attribute equals the value. A null literal becomes an is-null check.
    pub fn equals(attribute: Attribute, value: impl Into<Value>) -> Predicate {
        let value = value.into();
        if value.is_null() {
            return Predicate::is_null(attribute);
        }
        Predicate::Atom(Atom {
            attribute,
            op: AtomOp::Eq(value),
        })
    }

    /// Attribute differs from the value. A null literal becomes an
    /// is-not-null check.
    pub fn not_equals(attribute: Attribute, value: impl Into<Value>) -> Predicate {
        let value = value.into();
        if value.is_null() {
            return Predicate::is_not_null(attribute);
        }
        Predicate::Atom(Atom {
            attribute,
            op: AtomOp::NotEq(value),
        })
    }

    /// Attribute is strictly greater than the bound.
    pub fn greater_than(attribute: Attribute, bound: impl Into<Value>) -> Predicate {
        Self::range(attribute, RangeOp::Greater, bound.into())
    }

    /// Attribute is greater than or equal to the bound.
    pub fn greater_eq(attribute: Attribute, bound: impl Into<Value>) -> Predicate {
        Self::range(attribute, RangeOp::GreaterEq, bound.into())
    }

    /// Attribute is strictly less than the bound.
    pub fn less_than(attribute: Attribute, bound: impl Into<Value>) -> Predicate {
        Self::range(attribute, RangeOp::Less, bound.into())
    }

    /// Attribute is less than or equal to the bound.
    pub fn less_eq(attribute: Attribute, bound: impl Into<Value>) -> Predicate {
        Self::range(attribute, RangeOp::LessEq, bound.into())
    }

    fn range(attribute: Attribute, op: RangeOp, bound: Value) -> Predicate {
        if bound.is_null() {
            // A comparison against null matches nothing.
            return Predicate::None(attribute.entity().clone());
        }
        Predicate::Atom(Atom {
            attribute,
            op: AtomOp::Range(op, bound),
        })
    }

    /// Attribute is a member of the value set. An empty set matches
    /// nothing; a singleton collapses to an equality.
    pub fn is_in<I, V>(attribute: Attribute, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let set: HashSet<Value> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_null())
            .collect();
        match set.len() {
            0 => Predicate::None(attribute.entity().clone()),
            1 => {
                let value = set.into_iter().next().unwrap();
                Predicate::equals(attribute, value)
            }
            _ => Predicate::Atom(Atom {
                attribute,
                op: AtomOp::In(Arc::new(set)),
            }),
        }
    }

    /// Attribute is not a member of the value set. An empty set matches
    /// everything; a singleton collapses to an inequality.
    pub fn not_in<I, V>(attribute: Attribute, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let set: HashSet<Value> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_null())
            .collect();
        match set.len() {
            0 => Predicate::All(attribute.entity().clone()),
            1 => {
                let value = set.into_iter().next().unwrap();
                Predicate::not_equals(attribute, value)
            }
            _ => Predicate::Atom(Atom {
                attribute,
                op: AtomOp::NotIn(Arc::new(set)),
            }),
        }
    }

    /// Attribute is null or absent.
    pub fn is_null(attribute: Attribute) -> Predicate {
        Predicate::Atom(Atom {
            attribute,
            op: AtomOp::IsNull,
        })
    }

    /// Attribute is present and non-null.
    pub fn is_not_null(attribute: Attribute) -> Predicate {
        Predicate::Atom(Atom {
            attribute,
            op: AtomOp::IsNotNull,
        })
    }

    /// Two attributes of the same row are equal.
    ///
    /// # Panics
    /// Panics if the attributes belong to different entity types.
    pub fn self_equals(left: Attribute, right: Attribute) -> Predicate {
        assert_eq!(
            left.entity(),
            right.entity(),
            "self_equals attributes must share an entity type"
        );
        Predicate::SelfCompare(SelfCompare {
            left,
            right,
            negated: false,
        })
    }

    /// Two attributes of the same row differ.
    ///
    /// # Panics
    /// Panics if the attributes belong to different entity types.
    pub fn self_not_equals(left: Attribute, right: Attribute) -> Predicate {
        assert_eq!(
            left.entity(),
            right.entity(),
            "self_not_equals attributes must share an entity type"
        );
        Predicate::SelfCompare(SelfCompare {
            left,
            right,
            negated: true,
        })
    }

    /// A conjunction of equalities on one entity. Pairs are canonicalized
    /// by attribute name; a conflicting duplicate collapses to `None`, a
    /// single pair to a plain equality.
    ///
    /// # Panics
    /// Panics on an empty pair list or on pairs spanning entity types.
    pub fn multi_equality(pairs: Vec<(Attribute, Value)>) -> Predicate {
        assert!(!pairs.is_empty(), "multi_equality requires at least one pair");
        let entity = pairs[0].0.entity().clone();
        assert!(
            pairs.iter().all(|(a, _)| a.entity() == &entity),
            "multi_equality pairs must share an entity type"
        );

        let mut canonical: Vec<(Attribute, Value)> = Vec::with_capacity(pairs.len());
        for (attribute, value) in pairs {
            if value.is_null() {
                // Equality against null can never hold.
                return Predicate::None(entity);
            }
            let existing = canonical
                .iter()
                .find(|(a, _)| a == &attribute)
                .map(|(_, v)| v.clone());
            match existing {
                Some(v) if v == value => continue,
                Some(_) => return Predicate::None(entity),
                None => canonical.push((attribute, value)),
            }
        }
        canonical.sort_by(|(a, _), (b, _)| a.name().cmp(b.name()));

        if canonical.len() == 1 {
            let (attribute, value) = canonical.into_iter().next().unwrap();
            return Predicate::equals(attribute, value);
        }
        Predicate::MultiEquality(MultiEquality {
            entity,
            pairs: canonical,
        })
    }

    /// The tuple of attribute values is a member of the tuple set.
    ///
    /// # Panics
    /// Panics on an empty attribute list, attributes spanning entity types,
    /// or a tuple whose arity differs from the attribute list.
    pub fn tuple_in(attributes: Vec<Attribute>, tuples: Vec<Vec<Value>>) -> Predicate {
        assert!(!attributes.is_empty(), "tuple_in requires attributes");
        let entity = attributes[0].entity().clone();
        assert!(
            attributes.iter().all(|a| a.entity() == &entity),
            "tuple_in attributes must share an entity type"
        );
        assert!(
            tuples.iter().all(|t| t.len() == attributes.len()),
            "tuple_in tuple arity must match the attribute list"
        );

        if tuples.is_empty() {
            return Predicate::None(entity);
        }
        Predicate::TupleIn(TupleIn {
            attributes,
            tuples: Arc::new(tuples.into_iter().collect()),
        })
    }

    /// Some row related through the mapper satisfies the inner predicate.
    ///
    /// A chained mapper is normalized into nested single-hop wrappers, so
    /// propagation and folding only ever see one hop per `Mapped` node.
    ///
    /// # Panics
    /// Panics if the inner predicate's entity type is not the mapper's
    /// target entity type.
    pub fn exists(mapper: Mapper, inner: Predicate) -> Predicate {
        assert_eq!(
            inner.entity(),
            mapper.to(),
            "mapped predicate entity must match the mapper target"
        );
        let (first, rest) = mapper.split_first_hop();
        if let Some(rest) = rest {
            return Predicate::Mapped(MappedPredicate {
                mapper: first,
                inner: Box::new(Predicate::exists(rest, inner)),
            });
        }
        Predicate::Mapped(MappedPredicate {
            mapper,
            inner: Box::new(inner),
        })
    }

    /// No row related through the mapper satisfies the inner predicate.
    ///
    /// # Panics
    /// Panics if the inner predicate's entity type is not the mapper's
    /// target entity type.
    pub fn not_exists(mapper: Mapper, inner: Predicate) -> Predicate {
        assert_eq!(
            inner.entity(),
            mapper.to(),
            "mapped predicate entity must match the mapper target"
        );
        Predicate::NotExists(MappedPredicate {
            mapper,
            inner: Box::new(inner),
        })
    }

    /// Conjunction with pairwise simplification.
    pub fn and(&self, other: &Predicate) -> Predicate {
        let mut operands = Vec::new();
        self.flatten_and_into(&mut operands);
        other.flatten_and_into(&mut operands);
        Predicate::and_many(operands)
    }

    /// Disjunction with sentinel absorption and duplicate elimination.
    pub fn or(&self, other: &Predicate) -> Predicate {
        let mut operands = Vec::new();
        self.flatten_or_into(&mut operands);
        other.flatten_or_into(&mut operands);
        Predicate::or_many(operands)
    }

    fn flatten_and_into(&self, out: &mut Vec<Predicate>) {
        match self {
            Predicate::And(children) => {
                for child in children {
                    child.flatten_and_into(out);
                }
            }
            other => out.push(other.clone()),
        }
    }

    fn flatten_or_into(&self, out: &mut Vec<Predicate>) {
        match self {
            Predicate::Or(children) => {
                for child in children {
                    child.flatten_or_into(out);
                }
            }
            other => out.push(other.clone()),
        }
    }

    /// Conjunction of an operand list: sentinel algebra, then pairwise
    /// combination to a fixed point. Each successful combination removes
    /// one operand, so the loop terminates.
    pub(crate) fn and_many(operands: Vec<Predicate>) -> Predicate {
        assert!(!operands.is_empty(), "and_many requires operands");
        let entity = operands[0].entity().clone();

        let mut ops: Vec<Predicate> = Vec::with_capacity(operands.len());
        for op in operands {
            match op {
                Predicate::None(_) => return Predicate::None(entity),
                Predicate::All(_) => continue,
                other => ops.push(other),
            }
        }
        if ops.is_empty() {
            return Predicate::All(entity);
        }

        'combine: loop {
            for i in 0..ops.len() {
                for j in (i + 1)..ops.len() {
                    if let Some(combined) = ops[i].combine_and(&ops[j]) {
                        if matches!(combined, Predicate::None(_)) {
                            return combined;
                        }
                        ops.remove(j);
                        ops[i] = combined;
                        continue 'combine;
                    }
                }
            }
            break;
        }

        if ops.len() == 1 {
            ops.pop().unwrap()
        } else {
            Predicate::And(ops)
        }
    }

    /// Disjunction of an operand list.
    pub(crate) fn or_many(operands: Vec<Predicate>) -> Predicate {
        assert!(!operands.is_empty(), "or_many requires operands");
        let entity = operands[0].entity().clone();

        let mut ops: Vec<Predicate> = Vec::with_capacity(operands.len());
        for op in operands {
            match op {
                Predicate::All(_) => return Predicate::All(entity),
                Predicate::None(_) => continue,
                other => {
                    if !ops.contains(&other) {
                        ops.push(other);
                    }
                }
            }
        }
        match ops.len() {
            0 => Predicate::None(entity),
            1 => ops.pop().unwrap(),
            _ => Predicate::Or(ops),
        }
    }

    /// The result entity type this predicate selects.
    pub fn entity(&self) -> &EntityType {
        match self {
            Predicate::All(entity) | Predicate::None(entity) => entity,
            Predicate::Atom(atom) => atom.attribute.entity(),
            Predicate::MultiEquality(me) => &me.entity,
            Predicate::SelfCompare(sc) => sc.left.entity(),
            Predicate::TupleIn(ti) => ti.attributes[0].entity(),
            Predicate::Mapped(mp) | Predicate::NotExists(mp) => mp.mapper.from(),
            Predicate::And(children) | Predicate::Or(children) => children[0].entity(),
        }
    }

    /// The attribute of an atomic predicate.
    ///
    /// # Panics
    /// Panics on any non-atomic node; calling this on a sentinel or a
    /// composite indicates a tree built against the API contract.
    pub fn attribute(&self) -> &Attribute {
        match self {
            Predicate::Atom(atom) => &atom.attribute,
            other => panic!("attribute() on non-atomic predicate: {other:?}"),
        }
    }

    /// Whether this is the match-all sentinel.
    pub fn is_all(&self) -> bool {
        matches!(self, Predicate::All(_))
    }

    /// Whether this is the empty-result sentinel.
    pub fn is_none(&self) -> bool {
        matches!(self, Predicate::None(_))
    }

    /// Rebind an atomic predicate to another attribute, preserving the
    /// operator and literals. Used by transitive equality propagation.
    ///
    /// Returns `None` for non-atomic nodes and for as-of attributes, whose
    /// equality pins a temporal slice rather than a value.
    pub fn substitute_attribute(&self, attribute: &Attribute) -> Option<Predicate> {
        let Predicate::Atom(atom) = self else {
            return None;
        };
        if atom.attribute.is_as_of() || attribute.is_as_of() {
            return None;
        }
        Some(Predicate::Atom(Atom {
            attribute: attribute.clone(),
            op: atom.op.clone(),
        }))
    }

    /// Collect every entity type the tree touches.
    pub fn collect_entities(&self, out: &mut HashSet<EntityType>) {
        out.insert(self.entity().clone());
        match self {
            Predicate::Mapped(mp) | Predicate::NotExists(mp) => {
                mp.inner.collect_entities(out);
            }
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_entities(out);
                }
            }
            _ => {}
        }
    }

    /// Whether any node carries a temporal (as-of) qualification.
    pub fn has_as_of(&self) -> bool {
        match self {
            Predicate::Atom(atom) => atom.attribute.is_as_of(),
            Predicate::MultiEquality(me) => me.pairs.iter().any(|(a, _)| a.is_as_of()),
            Predicate::SelfCompare(sc) => sc.left.is_as_of() || sc.right.is_as_of(),
            Predicate::TupleIn(ti) => ti.attributes.iter().any(|a| a.is_as_of()),
            Predicate::Mapped(mp) | Predicate::NotExists(mp) => mp.inner.has_as_of(),
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().any(|c| c.has_as_of())
            }
            Predicate::All(_) | Predicate::None(_) => false,
        }
    }
}

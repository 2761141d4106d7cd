//! Relationship mappers.
//!
//! A [`Mapper`] describes a navigable relationship step between a "from"
//! and a "to" entity type: the join attribute pairs, the traversal
//! cardinality, and optional left/right filter predicates for non-key join
//! conditions. Mappers compose by chaining and reverse without
//! recomputation: both directions of a relationship are built once, at
//! definition time, as an immutable bidirectional pair.

mod stack;

pub use stack::{MapperId, MapperStack};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use relq_model::{Attribute, EntityType, Row, RowId, Value};

use crate::predicate::{EvalContext, Predicate};
use crate::source::collect_rows;

/// Traversal cardinality of a relationship step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// At most one related row per source row.
    ToOne,
    /// Any number of related rows per source row.
    ToMany,
}

enum Kind {
    /// A single relationship hop joining attribute pairs.
    Hop { pairs: Vec<(Attribute, Attribute)> },
    /// An ordered pair of mappers; `first.to() == second.from()`.
    Chained { first: Mapper, second: Mapper },
    /// A hop with extra non-key join conditions on either side.
    Filtered {
        base: Mapper,
        left_filter: Option<Predicate>,
        right_filter: Option<Predicate>,
    },
}

struct Inner {
    kind: Kind,
    from: EntityType,
    to: EntityType,
    cardinality: Cardinality,
    anonymous: bool,
    name: Option<String>,
    reverse: OnceLock<Mapper>,
}

/// A composable descriptor of a relationship traversal.
///
/// Cheap to clone; clones share identity (see [`Mapper::id`]). Structural
/// equality compares the join shape, not identity.
#[derive(Clone)]
pub struct Mapper {
    inner: Arc<Inner>,
}

impl Mapper {
    /// A named many-to-one relationship: each `from` row joins at most one
    /// `to` row. The memoized reverse is to-many.
    ///
    /// # Panics
    /// Panics on an empty pair list or pairs spanning entity types.
    pub fn many_to_one(
        name: impl Into<String>,
        pairs: Vec<(Attribute, Attribute)>,
    ) -> Mapper {
        Self::hop_pair(
            Some(name.into()),
            pairs,
            Cardinality::ToOne,
            Cardinality::ToMany,
            false,
        )
    }

    /// A named one-to-many relationship. The memoized reverse is to-one.
    ///
    /// # Panics
    /// Panics on an empty pair list or pairs spanning entity types.
    pub fn one_to_many(
        name: impl Into<String>,
        pairs: Vec<(Attribute, Attribute)>,
    ) -> Mapper {
        Self::hop_pair(
            Some(name.into()),
            pairs,
            Cardinality::ToMany,
            Cardinality::ToOne,
            false,
        )
    }

    /// A named one-to-one relationship; both directions are to-one.
    ///
    /// # Panics
    /// Panics on an empty pair list or pairs spanning entity types.
    pub fn one_to_one(
        name: impl Into<String>,
        pairs: Vec<(Attribute, Attribute)>,
    ) -> Mapper {
        Self::hop_pair(
            Some(name.into()),
            pairs,
            Cardinality::ToOne,
            Cardinality::ToOne,
            false,
        )
    }

    /// An anonymous (compiler-synthesized) join, the folding candidate for
    /// merged traversals.
    ///
    /// # Panics
    /// Panics on an empty pair list or pairs spanning entity types.
    pub fn anonymous_join(
        pairs: Vec<(Attribute, Attribute)>,
        cardinality: Cardinality,
    ) -> Mapper {
        let reverse_cardinality = match cardinality {
            Cardinality::ToOne => Cardinality::ToMany,
            Cardinality::ToMany => Cardinality::ToOne,
        };
        Self::hop_pair(None, pairs, cardinality, reverse_cardinality, true)
    }

    fn hop_pair(
        name: Option<String>,
        pairs: Vec<(Attribute, Attribute)>,
        cardinality: Cardinality,
        reverse_cardinality: Cardinality,
        anonymous: bool,
    ) -> Mapper {
        assert!(!pairs.is_empty(), "a mapper hop requires join pairs");
        let from = pairs[0].0.entity().clone();
        let to = pairs[0].1.entity().clone();
        assert!(
            pairs
                .iter()
                .all(|(l, r)| l.entity() == &from && r.entity() == &to),
            "mapper join pairs must share entity types per side"
        );

        let reversed: Vec<(Attribute, Attribute)> =
            pairs.iter().map(|(l, r)| (r.clone(), l.clone())).collect();

        let forward = Mapper {
            inner: Arc::new(Inner {
                kind: Kind::Hop { pairs },
                from: from.clone(),
                to: to.clone(),
                cardinality,
                anonymous,
                name: name.clone(),
                reverse: OnceLock::new(),
            }),
        };
        let backward = Mapper {
            inner: Arc::new(Inner {
                kind: Kind::Hop { pairs: reversed },
                from: to,
                to: from,
                cardinality: reverse_cardinality,
                anonymous,
                name,
                reverse: OnceLock::new(),
            }),
        };
        Self::wire_pair(forward, backward)
    }

    /// Compose two mappers into a multi-hop path.
    ///
    /// The reverse of the chain is built here as well, as the chain of the
    /// hop-reversed components in reverse order.
    ///
    /// # Panics
    /// Panics unless `first.to() == second.from()`.
    pub fn chain(first: &Mapper, second: &Mapper) -> Mapper {
        assert_eq!(
            first.to(),
            second.from(),
            "chained mappers must meet at a common entity type"
        );
        let cardinality = if first.is_to_many() || second.is_to_many() {
            Cardinality::ToMany
        } else {
            Cardinality::ToOne
        };
        let rev_first = second.reverse().clone();
        let rev_second = first.reverse().clone();
        let reverse_cardinality = if rev_first.is_to_many() || rev_second.is_to_many() {
            Cardinality::ToMany
        } else {
            Cardinality::ToOne
        };
        let anonymous = first.is_anonymous() && second.is_anonymous();

        let forward = Mapper {
            inner: Arc::new(Inner {
                kind: Kind::Chained {
                    first: first.clone(),
                    second: second.clone(),
                },
                from: first.from().clone(),
                to: second.to().clone(),
                cardinality,
                anonymous,
                name: None,
                reverse: OnceLock::new(),
            }),
        };
        let backward = Mapper {
            inner: Arc::new(Inner {
                kind: Kind::Chained {
                    first: rev_first,
                    second: rev_second,
                },
                from: second.to().clone(),
                to: first.from().clone(),
                cardinality: reverse_cardinality,
                anonymous,
                name: None,
                reverse: OnceLock::new(),
            }),
        };
        Self::wire_pair(forward, backward)
    }

    /// Attach non-key join conditions to a mapper. The left filter
    /// constrains source rows, the right filter related rows; the reverse
    /// carries them swapped.
    ///
    /// # Panics
    /// Panics if a filter's entity type does not match its side.
    pub fn filtered(
        base: &Mapper,
        left_filter: Option<Predicate>,
        right_filter: Option<Predicate>,
    ) -> Mapper {
        assert_eq!(
            base.hop_count(),
            1,
            "filters attach to single hops; filter the hops, then chain"
        );
        if let Some(f) = &left_filter {
            assert_eq!(f.entity(), base.from(), "left filter entity mismatch");
        }
        if let Some(f) = &right_filter {
            assert_eq!(f.entity(), base.to(), "right filter entity mismatch");
        }

        let forward = Mapper {
            inner: Arc::new(Inner {
                kind: Kind::Filtered {
                    base: base.clone(),
                    left_filter: left_filter.clone(),
                    right_filter: right_filter.clone(),
                },
                from: base.from().clone(),
                to: base.to().clone(),
                cardinality: base.cardinality(),
                anonymous: base.is_anonymous(),
                name: base.inner.name.clone(),
                reverse: OnceLock::new(),
            }),
        };
        let backward = Mapper {
            inner: Arc::new(Inner {
                kind: Kind::Filtered {
                    base: base.reverse().clone(),
                    left_filter: right_filter,
                    right_filter: left_filter,
                },
                from: base.to().clone(),
                to: base.from().clone(),
                cardinality: base.reverse().cardinality(),
                anonymous: base.is_anonymous(),
                name: base.inner.name.clone(),
                reverse: OnceLock::new(),
            }),
        };
        Self::wire_pair(forward, backward)
    }

    fn wire_pair(forward: Mapper, backward: Mapper) -> Mapper {
        let _ = forward.inner.reverse.set(backward.clone());
        let _ = backward.inner.reverse.set(forward.clone());
        forward
    }

    /// The source entity type.
    pub fn from(&self) -> &EntityType {
        &self.inner.from
    }

    /// The target entity type.
    pub fn to(&self) -> &EntityType {
        &self.inner.to
    }

    /// The traversal cardinality.
    pub fn cardinality(&self) -> Cardinality {
        self.inner.cardinality
    }

    /// Whether the traversal can yield more than one row per source row.
    pub fn is_to_many(&self) -> bool {
        self.inner.cardinality == Cardinality::ToMany
    }

    /// Whether this mapper was compiler-synthesized rather than user-named.
    pub fn is_anonymous(&self) -> bool {
        self.inner.anonymous
    }

    /// The relationship name, if user-named.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The memoized reverse direction.
    pub fn reverse(&self) -> &Mapper {
        self.inner
            .reverse
            .get()
            .expect("mapper reverse is wired at construction")
    }

    /// Identity of this mapper instance. Clones share identity; the
    /// reverse direction has its own.
    pub fn id(&self) -> MapperId {
        MapperId(Arc::as_ptr(&self.inner) as usize)
    }

    /// Number of single-hop steps in this mapper.
    pub fn hop_count(&self) -> usize {
        match &self.inner.kind {
            Kind::Hop { .. } => 1,
            Kind::Filtered { base, .. } => base.hop_count(),
            Kind::Chained { first, second } => first.hop_count() + second.hop_count(),
        }
    }

    /// Flatten into an ordered sequence of single-hop units. Filtered hops
    /// stay whole; chains decompose.
    pub fn hops(&self) -> Vec<Mapper> {
        match &self.inner.kind {
            Kind::Chained { first, second } => {
                let mut hops = first.hops();
                hops.extend(second.hops());
                hops
            }
            _ => vec![self.clone()],
        }
    }

    /// Split off the first single-hop unit, returning it with the
    /// remainder of the path (re-chained) if any.
    pub fn split_first_hop(&self) -> (Mapper, Option<Mapper>) {
        match &self.inner.kind {
            Kind::Chained { first, second } => {
                let (head, rest) = first.split_first_hop();
                match rest {
                    Some(rest) => (head, Some(Mapper::chain(&rest, second))),
                    None => (head, Some(second.clone())),
                }
            }
            _ => (self.clone(), None),
        }
    }

    /// Join attribute pairs of a single-hop unit, `(from-side, to-side)`.
    ///
    /// # Panics
    /// Panics on a chained mapper; callers decompose with
    /// [`Mapper::hops`] first.
    pub fn join_pairs(&self) -> &[(Attribute, Attribute)] {
        match &self.inner.kind {
            Kind::Hop { pairs } => pairs,
            Kind::Filtered { base, .. } => base.join_pairs(),
            Kind::Chained { .. } => panic!("join_pairs on a chained mapper"),
        }
    }

    /// Whether this hop joins on more than one attribute pair.
    pub fn is_multi_attribute(&self) -> bool {
        match &self.inner.kind {
            Kind::Chained { .. } => false,
            _ => self.join_pairs().len() > 1,
        }
    }

    /// The right-side filter of a filtered hop, if any.
    pub fn right_filter(&self) -> Option<&Predicate> {
        match &self.inner.kind {
            Kind::Filtered { right_filter, .. } => right_filter.as_ref(),
            _ => Option::None,
        }
    }

    /// The left-side filter of a filtered hop, if any.
    pub fn left_filter(&self) -> Option<&Predicate> {
        match &self.inner.kind {
            Kind::Filtered { left_filter, .. } => left_filter.as_ref(),
            _ => Option::None,
        }
    }

    /// Whether every hop can be mapped through a unique index on its
    /// source-side join attributes.
    pub fn unique_index_usable(&self, ctx: &EvalContext<'_>) -> bool {
        self.hops().iter().all(|hop| {
            let attrs: Vec<Attribute> = hop
                .join_pairs()
                .iter()
                .map(|(l, _)| l.clone())
                .collect();
            ctx.indexes()
                .resolve(hop.from(), &attrs)
                .map(|r| r.info.unique)
                .unwrap_or(false)
        })
    }

    /// Map related (`to`-side) rows back to the source entity type against
    /// the full cache, preserving first-seen order and deduplicating.
    pub fn map(&self, rows: &[Arc<Row>], ctx: &EvalContext<'_>) -> Vec<Arc<Row>> {
        match &self.inner.kind {
            Kind::Hop { pairs } => map_hop(pairs, rows, ctx, false).unwrap_or_default(),
            Kind::Filtered {
                base,
                left_filter,
                right_filter,
            } => {
                let filtered: Vec<Arc<Row>> = match right_filter {
                    Some(f) => rows
                        .iter()
                        .filter(|r| f.matches(r, ctx))
                        .cloned()
                        .collect(),
                    Option::None => rows.to_vec(),
                };
                let mapped = base.map(&filtered, ctx);
                match left_filter {
                    Some(f) => mapped
                        .into_iter()
                        .filter(|r| f.matches(r, ctx))
                        .collect(),
                    Option::None => mapped,
                }
            }
            Kind::Chained { first, second } => {
                let mid = second.map(rows, ctx);
                first.map(&mid, ctx)
            }
        }
    }

    /// Map related rows back to the source entity type using only unique
    /// immutable indexes, so the result is trustworthy against a partial
    /// cache. Returns `None` when completeness cannot be proven.
    pub fn map_partial(
        &self,
        rows: &[Arc<Row>],
        ctx: &EvalContext<'_>,
    ) -> Option<Vec<Arc<Row>>> {
        match &self.inner.kind {
            Kind::Hop { pairs } => map_hop(pairs, rows, ctx, true),
            Kind::Filtered {
                base,
                left_filter,
                right_filter,
            } => {
                let filtered: Vec<Arc<Row>> = match right_filter {
                    Some(f) => rows
                        .iter()
                        .filter(|r| f.matches(r, ctx))
                        .cloned()
                        .collect(),
                    Option::None => rows.to_vec(),
                };
                let mapped = base.map_partial(&filtered, ctx)?;
                Some(match left_filter {
                    Some(f) => mapped
                        .into_iter()
                        .filter(|r| f.matches(r, ctx))
                        .collect(),
                    Option::None => mapped,
                })
            }
            Kind::Chained { first, second } => {
                let mid = second.map_partial(rows, ctx)?;
                first.map_partial(&mid, ctx)
            }
        }
    }

    /// Traverse the relationship forward from one source row.
    pub fn related_rows(&self, row: &Row, ctx: &EvalContext<'_>) -> Vec<Arc<Row>> {
        match &self.inner.kind {
            Kind::Hop { pairs } => related_for_hop(pairs, self.to(), row, ctx),
            Kind::Filtered {
                base,
                left_filter,
                right_filter,
            } => {
                if let Some(f) = left_filter {
                    if !f.matches(row, ctx) {
                        return Vec::new();
                    }
                }
                let related = base.related_rows(row, ctx);
                match right_filter {
                    Some(f) => related
                        .into_iter()
                        .filter(|r| f.matches(r, ctx))
                        .collect(),
                    Option::None => related,
                }
            }
            Kind::Chained { first, second } => {
                let mut out = Vec::new();
                let mut seen: HashSet<RowId> = HashSet::new();
                for mid in first.related_rows(row, ctx) {
                    for leaf in second.related_rows(&mid, ctx) {
                        if seen.insert(leaf.id()) {
                            out.push(leaf);
                        }
                    }
                }
                out
            }
        }
    }

    /// Build the `to`-side predicate selecting rows related to one source
    /// row, folding in any right-side filter. Returns `None` when a join
    /// value is null (no related row can exist).
    ///
    /// # Panics
    /// Panics on a chained mapper; deep fetch decomposes chains first.
    pub fn child_predicate(&self, parent: &Row) -> Option<Predicate> {
        let pairs = self.join_pairs();
        let mut equalities: Vec<(Attribute, Value)> = Vec::with_capacity(pairs.len());
        for (left, right) in pairs {
            let value = left.value_in(parent)?;
            if value.is_null() {
                return Option::None;
            }
            equalities.push((right.clone(), value.clone()));
        }
        let base = Predicate::multi_equality(equalities);
        Some(match self.right_filter() {
            Some(filter) => base.and(filter),
            Option::None => base,
        })
    }
}

fn hop_key(pairs: &[(Attribute, Attribute)], row: &Row, from_side: bool) -> Option<Vec<Value>> {
    let mut key = Vec::with_capacity(pairs.len());
    for (left, right) in pairs {
        let attr = if from_side { left } else { right };
        let value = attr.value_in(row)?;
        if value.is_null() {
            return Option::None;
        }
        key.push(value.clone());
    }
    Some(key)
}

/// Map to-side rows back through one hop. With `partial_only`, completeness
/// must be provable through a unique immutable index.
fn map_hop(
    pairs: &[(Attribute, Attribute)],
    rows: &[Arc<Row>],
    ctx: &EvalContext<'_>,
    partial_only: bool,
) -> Option<Vec<Arc<Row>>> {
    let from = pairs[0].0.entity().clone();
    let left_attrs: Vec<Attribute> = pairs.iter().map(|(l, _)| l.clone()).collect();

    let mut out: Vec<Arc<Row>> = Vec::new();
    let mut seen: HashSet<RowId> = HashSet::new();

    if let Some(reference) = ctx.indexes().resolve(&from, &left_attrs) {
        if partial_only && !(reference.info.unique && reference.info.immutable) {
            return Option::None;
        }
        for row in rows {
            let Some(key) = hop_key(pairs, row, false) else {
                continue;
            };
            match ctx.indexes().lookup(&from, &left_attrs, &key) {
                Some(matches) => {
                    // An empty hit against a partial cache proves nothing.
                    if partial_only && matches.is_empty() {
                        return Option::None;
                    }
                    for m in matches {
                        if seen.insert(m.id()) {
                            out.push(m);
                        }
                    }
                }
                Option::None if partial_only => return Option::None,
                Option::None => {}
            }
        }
        return Some(out);
    }

    if partial_only {
        return Option::None;
    }

    // No usable index: build a key map over the source population once and
    // probe it per input row.
    let mut by_key: HashMap<Vec<Value>, Vec<Arc<Row>>> = HashMap::new();
    for candidate in collect_rows(ctx.cache(), &from) {
        if let Some(key) = hop_key(pairs, &candidate, true) {
            by_key.entry(key).or_default().push(candidate);
        }
    }
    for row in rows {
        let Some(key) = hop_key(pairs, row, false) else {
            continue;
        };
        if let Some(matches) = by_key.get(&key) {
            for m in matches {
                if seen.insert(m.id()) {
                    out.push(Arc::clone(m));
                }
            }
        }
    }
    Some(out)
}

fn related_for_hop(
    pairs: &[(Attribute, Attribute)],
    to: &EntityType,
    row: &Row,
    ctx: &EvalContext<'_>,
) -> Vec<Arc<Row>> {
    let Some(key) = hop_key(pairs, row, true) else {
        return Vec::new();
    };
    let right_attrs: Vec<Attribute> = pairs.iter().map(|(_, r)| r.clone()).collect();

    if ctx.indexes().resolve(to, &right_attrs).is_some() {
        if let Some(matches) = ctx.indexes().lookup(to, &right_attrs, &key) {
            return matches;
        }
    }

    let mut out = Vec::new();
    ctx.cache().for_each_row(to, &mut |candidate| {
        if hop_key(pairs, candidate, false).as_ref() == Some(&key) {
            out.push(Arc::clone(candidate));
        }
    });
    out
}

impl PartialEq for Mapper {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        self.inner.from == other.inner.from
            && self.inner.to == other.inner.to
            && self.inner.cardinality == other.inner.cardinality
            && self.inner.anonymous == other.inner.anonymous
            && self.inner.name == other.inner.name
            && kind_eq(&self.inner.kind, &other.inner.kind)
    }
}

fn kind_eq(a: &Kind, b: &Kind) -> bool {
    match (a, b) {
        (Kind::Hop { pairs: pa }, Kind::Hop { pairs: pb }) => pa == pb,
        (
            Kind::Chained {
                first: fa,
                second: sa,
            },
            Kind::Chained {
                first: fb,
                second: sb,
            },
        ) => fa == fb && sa == sb,
        (
            Kind::Filtered {
                base: ba,
                left_filter: la,
                right_filter: ra,
            },
            Kind::Filtered {
                base: bb,
                left_filter: lb,
                right_filter: rb,
            },
        ) => ba == bb && la == lb && ra == rb,
        _ => false,
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The reverse link is omitted: printing it would recurse forever.
        let mut s = f.debug_struct("Mapper");
        s.field("from", &self.inner.from.name())
            .field("to", &self.inner.to.name())
            .field("cardinality", &self.inner.cardinality);
        if let Some(name) = &self.inner.name {
            s.field("name", name);
        }
        match &self.inner.kind {
            Kind::Hop { pairs } => {
                s.field("pairs", pairs);
            }
            Kind::Chained { first, second } => {
                s.field("first", first).field("second", second);
            }
            Kind::Filtered {
                base,
                left_filter,
                right_filter,
            } => {
                s.field("base", base)
                    .field("left_filter", left_filter)
                    .field("right_filter", right_filter);
            }
        }
        s.finish()
    }
}

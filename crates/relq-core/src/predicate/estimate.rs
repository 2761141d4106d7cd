//! Cardinality estimates and index-strength classification.
//!
//! Estimates are heuristic and only meaningful when the predicate is
//! estimatable: every touched entity type is fully cached and none is
//! temporary. Selectivity constants follow the resolver's cost model
//! conventions (equality 0.1, range 0.3, inequality 0.9).

use relq_model::EntityType;

use super::{AtomOp, EvalContext, Predicate};

/// Strength of the cheapest index a predicate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexStrength {
    /// No index usable.
    None,
    /// A non-unique index.
    NonUnique,
    /// A unique index over mutable attributes.
    Unique,
    /// A unique index over immutable attributes; trustworthy even against
    /// a partial cache.
    UniqueImmutable,
}

impl IndexStrength {
    fn from_info(info: crate::source::IndexInfo) -> IndexStrength {
        if info.unique && info.immutable {
            IndexStrength::UniqueImmutable
        } else if info.unique {
            IndexStrength::Unique
        } else {
            IndexStrength::NonUnique
        }
    }
}

impl Predicate {
    /// Classify the strongest index this predicate can be driven by.
    pub fn index_strength(&self, ctx: &EvalContext<'_>) -> IndexStrength {
        match self {
            Predicate::Atom(atom) => match &atom.op {
                AtomOp::Eq(_) | AtomOp::In(_) => {
                    match ctx.indexes().resolve(
                        atom.attribute.entity(),
                        std::slice::from_ref(&atom.attribute),
                    ) {
                        Some(reference) => IndexStrength::from_info(reference.info),
                        None => IndexStrength::None,
                    }
                }
                _ => IndexStrength::None,
            },
            Predicate::MultiEquality(me) => {
                match ctx.indexes().resolve(&me.entity, &me.attributes()) {
                    Some(reference) => IndexStrength::from_info(reference.info),
                    None => IndexStrength::None,
                }
            }
            Predicate::TupleIn(ti) => {
                match ctx.indexes().resolve(self.entity(), &ti.attributes) {
                    Some(reference) => IndexStrength::from_info(reference.info),
                    None => IndexStrength::None,
                }
            }
            // A conjunction is driven by its strongest operand.
            Predicate::And(children) => children
                .iter()
                .map(|c| c.index_strength(ctx))
                .max()
                .unwrap_or(IndexStrength::None),
            // A disjunction is only as strong as its weakest branch; every
            // branch must be resolved.
            Predicate::Or(children) => children
                .iter()
                .map(|c| c.index_strength(ctx))
                .min()
                .unwrap_or(IndexStrength::None),
            Predicate::Mapped(mp) => {
                let mapper_strength = mapper_strength(&mp.mapper, ctx);
                mp.inner.index_strength(ctx).min(mapper_strength)
            }
            _ => IndexStrength::None,
        }
    }

    /// Whether resolution can use a unique index.
    pub fn uses_unique_index(&self, ctx: &EvalContext<'_>) -> bool {
        self.index_strength(ctx) >= IndexStrength::Unique
    }

    /// Whether resolution can use a unique index over immutable attributes.
    pub fn uses_unique_immutable_index(&self, ctx: &EvalContext<'_>) -> bool {
        self.index_strength(ctx) == IndexStrength::UniqueImmutable
    }

    /// Whether resolution can use a non-unique index (and nothing better).
    pub fn uses_nonunique_index(&self, ctx: &EvalContext<'_>) -> bool {
        self.index_strength(ctx) == IndexStrength::NonUnique
    }

    /// Whether cardinality estimates are meaningful: every touched entity
    /// type is fully cached and none is temporary.
    pub fn is_estimatable(&self, ctx: &EvalContext<'_>) -> bool {
        let mut entities = std::collections::HashSet::new();
        self.collect_entities(&mut entities);
        entities
            .iter()
            .all(|e| !e.is_temporary() && ctx.cache().is_fully_cached(e))
    }

    /// Estimated number of rows the predicate returns.
    pub fn estimate_return_size(&self, ctx: &EvalContext<'_>) -> usize {
        let count = ctx.cache().row_count(self.entity());
        match self {
            Predicate::None(_) => 0,
            Predicate::All(_) => count,
            Predicate::Atom(atom) => estimate_atom(atom, count, ctx),
            Predicate::MultiEquality(me) => {
                match ctx.indexes().resolve(&me.entity, &me.attributes()) {
                    Some(r) if r.info.unique => 1,
                    Some(r) => r.info.avg_rows_per_key,
                    None => scaled(count, 0.1f64.powi(me.pairs.len() as i32)),
                }
            }
            Predicate::SelfCompare(sc) => {
                if sc.negated {
                    scaled(count, 0.9)
                } else {
                    scaled(count, 0.1)
                }
            }
            Predicate::TupleIn(ti) => {
                let n = ti.tuples.len();
                match ctx.indexes().resolve(self.entity(), &ti.attributes) {
                    Some(r) if r.info.unique => n,
                    Some(r) => n * r.info.avg_rows_per_key,
                    None => scaled(count, (n as f64 * 0.1).min(1.0)),
                }
            }
            Predicate::Mapped(mp) => {
                let inner = mp.inner.estimate_return_size(ctx);
                let to_count = ctx.cache().row_count(mp.mapper.to()).max(1);
                let fanout = (count / to_count).max(1);
                (inner * fanout).min(count)
            }
            Predicate::NotExists(mp) => {
                let inner = mp.inner.estimate_return_size(ctx);
                let to_count = ctx.cache().row_count(mp.mapper.to()).max(1);
                let fanout = (count / to_count).max(1);
                count.saturating_sub(inner * fanout)
            }
            Predicate::And(children) => children
                .iter()
                .map(|c| c.estimate_return_size(ctx))
                .min()
                .unwrap_or(count),
            Predicate::Or(children) => children
                .iter()
                .map(|c| c.estimate_return_size(ctx))
                .sum::<usize>()
                .min(count),
        }
    }

    /// Upper bound on the number of rows the predicate can return.
    ///
    /// Exact for unique-index-driven nodes; the entity population for
    /// scan-based heuristics.
    pub fn estimate_max_return_size(&self, ctx: &EvalContext<'_>) -> usize {
        let count = ctx.cache().row_count(self.entity());
        match self {
            Predicate::None(_) => 0,
            Predicate::All(_) => count,
            Predicate::Atom(atom) => match &atom.op {
                AtomOp::Eq(_) => {
                    if self.uses_unique_index(ctx) {
                        1
                    } else {
                        count
                    }
                }
                AtomOp::In(set) => {
                    if self.uses_unique_index(ctx) {
                        set.len()
                    } else {
                        count
                    }
                }
                _ => count,
            },
            Predicate::MultiEquality(_) => {
                if self.uses_unique_index(ctx) {
                    1
                } else {
                    count
                }
            }
            Predicate::TupleIn(ti) => {
                if self.uses_unique_index(ctx) {
                    ti.tuples.len()
                } else {
                    count
                }
            }
            Predicate::And(children) => children
                .iter()
                .map(|c| c.estimate_max_return_size(ctx))
                .min()
                .unwrap_or(count),
            Predicate::Or(children) => children
                .iter()
                .map(|c| c.estimate_max_return_size(ctx))
                .sum::<usize>()
                .min(count),
            _ => count,
        }
    }
}

fn estimate_atom(atom: &super::Atom, count: usize, ctx: &EvalContext<'_>) -> usize {
    let indexed = ctx.indexes().resolve(
        atom.attribute.entity(),
        std::slice::from_ref(&atom.attribute),
    );
    match &atom.op {
        AtomOp::Eq(_) => match indexed {
            Some(r) if r.info.unique => 1,
            Some(r) => r.info.avg_rows_per_key,
            None => scaled(count, 0.1),
        },
        AtomOp::NotEq(_) => scaled(count, 0.9),
        AtomOp::Range(..) => scaled(count, 0.3),
        AtomOp::In(set) => match indexed {
            Some(r) if r.info.unique => set.len(),
            Some(r) => set.len() * r.info.avg_rows_per_key,
            None => scaled(count, (set.len() as f64 * 0.1).min(1.0)),
        },
        AtomOp::NotIn(set) => scaled(count, 1.0 - (set.len() as f64 * 0.1).min(0.9)),
        AtomOp::IsNull => scaled(count, 0.1),
        AtomOp::IsNotNull => scaled(count, 0.9),
    }
}

fn scaled(count: usize, selectivity: f64) -> usize {
    (count as f64 * selectivity).ceil() as usize
}

/// Strength of the weakest hop when mapping related rows back through the
/// relationship.
fn mapper_strength(mapper: &crate::mapper::Mapper, ctx: &EvalContext<'_>) -> IndexStrength {
    mapper
        .hops()
        .iter()
        .map(|hop| {
            let attrs: Vec<_> = hop.join_pairs().iter().map(|(l, _)| l.clone()).collect();
            match ctx.indexes().resolve(hop.from(), &attrs) {
                Some(reference) => IndexStrength::from_info(reference.info),
                None => IndexStrength::None,
            }
        })
        .min()
        .unwrap_or(IndexStrength::None)
}

/// Whether every entity type in the set is fully cached.
pub(crate) fn all_fully_cached<'a>(
    entities: impl IntoIterator<Item = &'a EntityType>,
    ctx: &EvalContext<'_>,
) -> bool {
    entities.into_iter().all(|e| ctx.cache().is_fully_cached(e))
}

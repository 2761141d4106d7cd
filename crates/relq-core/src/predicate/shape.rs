//! Structural shapes of predicates.
//!
//! A shape ignores literal parameter values but distinguishes attribute and
//! operator identity, so one compiled query can be reused across differing
//! literals. Equality and set-membership share a shape class: an `Equals`
//! probe can super-match a cached `In` that contains its value, which is
//! why IN-set cardinality is deliberately not part of the hash.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::mapper::Mapper;

use super::{AtomOp, Predicate, RangeOp};

/// Outcome of matching a probe predicate's shape against a cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeMatch {
    /// Same shape, same literals: the cached result is reusable verbatim.
    Exact,
    /// Same shape and the cached parameters cover a superset of the
    /// probe's: the cached result is reusable after filtering.
    Superset,
    /// Not reusable.
    NoMatch,
}

/// Structural fingerprint of a predicate, ignoring literal values.
pub fn shape_hash(predicate: &Predicate) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_predicate(predicate, &mut hasher);
    hasher.finish()
}

fn hash_predicate<H: Hasher>(predicate: &Predicate, hasher: &mut H) {
    match predicate {
        Predicate::All(entity) => {
            0u8.hash(hasher);
            entity.hash(hasher);
        }
        Predicate::None(entity) => {
            1u8.hash(hasher);
            entity.hash(hasher);
        }
        Predicate::Atom(atom) => {
            2u8.hash(hasher);
            atom.attribute.hash(hasher);
            hash_op_class(&atom.op, hasher);
        }
        Predicate::MultiEquality(me) => {
            3u8.hash(hasher);
            for (attr, _) in &me.pairs {
                attr.hash(hasher);
            }
        }
        Predicate::SelfCompare(sc) => {
            4u8.hash(hasher);
            sc.left.hash(hasher);
            sc.right.hash(hasher);
            sc.negated.hash(hasher);
        }
        Predicate::TupleIn(ti) => {
            5u8.hash(hasher);
            for attr in &ti.attributes {
                attr.hash(hasher);
            }
        }
        Predicate::Mapped(mp) => {
            6u8.hash(hasher);
            hash_mapper(&mp.mapper, hasher);
            hash_predicate(&mp.inner, hasher);
        }
        Predicate::NotExists(mp) => {
            7u8.hash(hasher);
            hash_mapper(&mp.mapper, hasher);
            hash_predicate(&mp.inner, hasher);
        }
        // Children hash order-insensitively so equivalent trees built in
        // different orders land in the same bucket.
        Predicate::And(children) => {
            8u8.hash(hasher);
            children.len().hash(hasher);
            hash_unordered(children, hasher);
        }
        Predicate::Or(children) => {
            9u8.hash(hasher);
            children.len().hash(hasher);
            hash_unordered(children, hasher);
        }
    }
}

fn hash_unordered<H: Hasher>(children: &[Predicate], hasher: &mut H) {
    let mut combined: u64 = 0;
    for child in children {
        combined = combined.wrapping_add(shape_hash(child));
    }
    combined.hash(hasher);
}

/// Equality and set-membership share a class; everything else hashes its
/// own operator. Literals never participate.
fn hash_op_class<H: Hasher>(op: &AtomOp, hasher: &mut H) {
    match op {
        AtomOp::Eq(_) | AtomOp::In(_) => 0u8.hash(hasher),
        AtomOp::NotEq(_) => 1u8.hash(hasher),
        AtomOp::Range(range_op, _) => {
            2u8.hash(hasher);
            range_op.hash(hasher);
        }
        AtomOp::NotIn(_) => 3u8.hash(hasher),
        AtomOp::IsNull => 4u8.hash(hasher),
        AtomOp::IsNotNull => 5u8.hash(hasher),
    }
}

fn hash_mapper<H: Hasher>(mapper: &Mapper, hasher: &mut H) {
    for hop in mapper.hops() {
        hop.from().hash(hasher);
        hop.to().hash(hasher);
        for (left, right) in hop.join_pairs() {
            left.hash(hasher);
            right.hash(hasher);
        }
        if let Some(filter) = hop.left_filter() {
            hash_predicate(filter, hasher);
        }
        if let Some(filter) = hop.right_filter() {
            hash_predicate(filter, hasher);
        }
    }
}

/// Classify the probe predicate against a cached predicate.
///
/// `max_set_size` bounds every set comparison; a cached set larger than the
/// bound degrades to [`ShapeMatch::NoMatch`] rather than paying an
/// unbounded intersection cost.
pub fn shape_match(probe: &Predicate, cached: &Predicate, max_set_size: usize) -> ShapeMatch {
    match (probe, cached) {
        (Predicate::All(a), Predicate::All(b)) | (Predicate::None(a), Predicate::None(b)) => {
            exact_if(a == b)
        }
        (Predicate::Atom(p), Predicate::Atom(c)) => {
            if p.attribute != c.attribute {
                return ShapeMatch::NoMatch;
            }
            match_atoms(&p.op, &c.op, max_set_size)
        }
        (Predicate::MultiEquality(p), Predicate::MultiEquality(c)) => {
            exact_if(p.pairs == c.pairs)
        }
        (Predicate::SelfCompare(p), Predicate::SelfCompare(c)) => {
            exact_if(p.left == c.left && p.right == c.right && p.negated == c.negated)
        }
        (Predicate::TupleIn(p), Predicate::TupleIn(c)) => {
            if p.attributes != c.attributes {
                return ShapeMatch::NoMatch;
            }
            if p.tuples == c.tuples {
                return ShapeMatch::Exact;
            }
            if c.tuples.len() <= max_set_size && p.tuples.is_subset(&c.tuples) {
                return ShapeMatch::Superset;
            }
            ShapeMatch::NoMatch
        }
        (Predicate::Mapped(p), Predicate::Mapped(c)) => {
            if p.mapper != c.mapper {
                return ShapeMatch::NoMatch;
            }
            shape_match(&p.inner, &c.inner, max_set_size)
        }
        (Predicate::NotExists(p), Predicate::NotExists(c)) => {
            // Negation flips containment, so only literal equality is safe.
            if p.mapper != c.mapper {
                return ShapeMatch::NoMatch;
            }
            match shape_match(&p.inner, &c.inner, max_set_size) {
                ShapeMatch::Exact => ShapeMatch::Exact,
                _ => ShapeMatch::NoMatch,
            }
        }
        (Predicate::And(p), Predicate::And(c)) | (Predicate::Or(p), Predicate::Or(c)) => {
            match_children(p, c, max_set_size)
        }
        _ => ShapeMatch::NoMatch,
    }
}

fn exact_if(condition: bool) -> ShapeMatch {
    if condition {
        ShapeMatch::Exact
    } else {
        ShapeMatch::NoMatch
    }
}

fn match_atoms(probe: &AtomOp, cached: &AtomOp, max_set_size: usize) -> ShapeMatch {
    match (probe, cached) {
        (AtomOp::Eq(v), AtomOp::Eq(w)) => exact_if(v == w),
        (AtomOp::Eq(v), AtomOp::In(set)) => {
            if set.len() <= max_set_size && set.contains(v) {
                ShapeMatch::Superset
            } else {
                ShapeMatch::NoMatch
            }
        }
        (AtomOp::In(p), AtomOp::In(c)) => {
            if p == c {
                return ShapeMatch::Exact;
            }
            if c.len() <= max_set_size && p.is_subset(c) {
                return ShapeMatch::Superset;
            }
            ShapeMatch::NoMatch
        }
        (AtomOp::NotEq(v), AtomOp::NotEq(w)) => exact_if(v == w),
        (AtomOp::NotIn(p), AtomOp::NotIn(c)) => {
            if p == c {
                return ShapeMatch::Exact;
            }
            // The cached exclusion must be a subset of the probe's: it
            // excludes less, so its result covers the probe's.
            if p.len() <= max_set_size && c.is_subset(p) {
                return ShapeMatch::Superset;
            }
            ShapeMatch::NoMatch
        }
        (AtomOp::Range(p_op, p_bound), AtomOp::Range(c_op, c_bound)) => {
            if p_op == c_op && p_bound == c_bound {
                return ShapeMatch::Exact;
            }
            if p_op.is_lower_bound() != c_op.is_lower_bound() {
                return ShapeMatch::NoMatch;
            }
            let Some(ord) = c_bound.compare(p_bound) else {
                return ShapeMatch::NoMatch;
            };
            // The cached range must contain the probe range.
            let covers = if c_op.is_lower_bound() {
                match ord {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => {
                        // Equal bounds: inclusive covers strict.
                        *c_op == RangeOp::GreaterEq && *p_op == RangeOp::Greater
                    }
                    std::cmp::Ordering::Greater => false,
                }
            } else {
                match ord {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Equal => {
                        *c_op == RangeOp::LessEq && *p_op == RangeOp::Less
                    }
                    std::cmp::Ordering::Less => false,
                }
            };
            if covers {
                ShapeMatch::Superset
            } else {
                ShapeMatch::NoMatch
            }
        }
        (AtomOp::IsNull, AtomOp::IsNull) | (AtomOp::IsNotNull, AtomOp::IsNotNull) => {
            ShapeMatch::Exact
        }
        _ => ShapeMatch::NoMatch,
    }
}

/// Pair each probe child with a distinct cached child. Every pair must at
/// least super-match; the whole is exact only when every pair is.
fn match_children(
    probe: &[Predicate],
    cached: &[Predicate],
    max_set_size: usize,
) -> ShapeMatch {
    if probe.len() != cached.len() {
        return ShapeMatch::NoMatch;
    }
    let mut used = vec![false; cached.len()];
    let mut any_superset = false;

    for p in probe {
        let mut matched = false;
        // Prefer an exact partner before settling for a superset.
        for (i, c) in cached.iter().enumerate() {
            if !used[i] && shape_match(p, c, max_set_size) == ShapeMatch::Exact {
                used[i] = true;
                matched = true;
                break;
            }
        }
        if !matched {
            for (i, c) in cached.iter().enumerate() {
                if !used[i] && shape_match(p, c, max_set_size) == ShapeMatch::Superset {
                    used[i] = true;
                    any_superset = true;
                    matched = true;
                    break;
                }
            }
        }
        if !matched {
            return ShapeMatch::NoMatch;
        }
    }

    if any_superset {
        ShapeMatch::Superset
    } else {
        ShapeMatch::Exact
    }
}

//! Pairwise AND-combination of predicates.
//!
//! The matrix is total over variant pairs but not every cell simplifies:
//! `Option::None` means "not simplifiable", which the `and` builder
//! distinguishes from the empty-result sentinel `Predicate::None` by type.
//! Each cell is attempted in both operand orders, so the matrix only needs
//! one direction per pair.

use std::collections::HashSet;
use std::sync::Arc;

use relq_model::Value;

use super::{Atom, AtomOp, MappedPredicate, MultiEquality, Predicate, RangeOp, SelfCompare};

impl Predicate {
    /// Combine two predicates under AND into a simplified predicate.
    ///
    /// Returns `Option::None` when the pair does not simplify; the caller
    /// then keeps both operands under a generic `And`. A returned
    /// `Predicate::None` means the conjunction is unsatisfiable.
    pub fn combine_and(&self, other: &Predicate) -> Option<Predicate> {
        combine(self, other).or_else(|| combine(other, self))
    }
}

fn combine(left: &Predicate, right: &Predicate) -> Option<Predicate> {
    // Sentinels absorb regardless of entity type.
    match left {
        Predicate::None(_) => return Some(left.clone()),
        Predicate::All(_) => return Some(right.clone()),
        _ => {}
    }

    // Operands on different result entity types never combine.
    if left.entity() != right.entity() {
        return None;
    }

    match (left, right) {
        (Predicate::Atom(a), Predicate::Atom(b)) => combine_atoms(a, b),
        (Predicate::MultiEquality(me), Predicate::Atom(atom)) => combine_multi_atom(me, atom),
        (Predicate::MultiEquality(a), Predicate::MultiEquality(b)) => {
            let mut pairs = a.pairs.clone();
            pairs.extend(b.pairs.iter().cloned());
            Some(Predicate::multi_equality(pairs))
        }
        (Predicate::SelfCompare(a), Predicate::SelfCompare(b)) => combine_self(a, b),
        (Predicate::Mapped(a), Predicate::Mapped(b)) => combine_mapped(a, b),
        _ => None,
    }
}

fn combine_atoms(a: &Atom, b: &Atom) -> Option<Predicate> {
    if a.attribute != b.attribute {
        // Two plain equalities on one entity canonicalize to a
        // multi-equality so index probes see a single node.
        if let (AtomOp::Eq(v), AtomOp::Eq(w)) = (&a.op, &b.op) {
            if !a.attribute.is_as_of() && !b.attribute.is_as_of() {
                return Some(Predicate::multi_equality(vec![
                    (a.attribute.clone(), v.clone()),
                    (b.attribute.clone(), w.clone()),
                ]));
            }
        }
        return None;
    }

    let entity = a.attribute.entity().clone();
    let none = || Some(Predicate::None(entity.clone()));
    let keep_left = || Some(Predicate::Atom(a.clone()));
    let keep_right = || Some(Predicate::Atom(b.clone()));

    match (&a.op, &b.op) {
        (AtomOp::Eq(v), AtomOp::Eq(w)) => {
            if v == w {
                keep_left()
            } else {
                none()
            }
        }
        (AtomOp::Eq(v), AtomOp::NotEq(w)) => {
            if v == w {
                none()
            } else {
                keep_left()
            }
        }
        (AtomOp::Eq(v), AtomOp::Range(op, bound)) => match v.compare(bound) {
            Some(ord) if op.accepts(ord) => keep_left(),
            Some(_) => none(),
            None => None,
        },
        (AtomOp::Eq(v), AtomOp::In(set)) => {
            if set.contains(v) {
                keep_left()
            } else {
                none()
            }
        }
        (AtomOp::Eq(v), AtomOp::NotIn(set)) => {
            if set.contains(v) {
                none()
            } else {
                keep_left()
            }
        }
        (AtomOp::Eq(_), AtomOp::IsNull) => none(),
        (AtomOp::Eq(_), AtomOp::IsNotNull) => keep_left(),

        (AtomOp::NotEq(v), AtomOp::NotEq(w)) => {
            if v == w {
                keep_left()
            } else {
                None
            }
        }
        (AtomOp::NotEq(v), AtomOp::In(set)) => {
            let kept: HashSet<Value> = set.iter().filter(|m| *m != v).cloned().collect();
            Some(narrowed_in(&a.attribute, kept))
        }
        (AtomOp::NotEq(v), AtomOp::NotIn(set)) => {
            let mut excluded = (**set).clone();
            excluded.insert(v.clone());
            Some(Predicate::Atom(Atom {
                attribute: a.attribute.clone(),
                op: AtomOp::NotIn(Arc::new(excluded)),
            }))
        }
        (AtomOp::NotEq(_), AtomOp::IsNull) => keep_right(),
        (AtomOp::NotEq(v), AtomOp::Range(op, bound)) => match v.compare(bound) {
            // The inequality is implied when its value lies outside the range.
            Some(ord) if !op.accepts(ord) => keep_right(),
            _ => None,
        },

        (AtomOp::Range(op_a, bound_a), AtomOp::Range(op_b, bound_b)) => {
            combine_ranges(a, *op_a, bound_a, *op_b, bound_b)
        }
        (AtomOp::Range(op, bound), AtomOp::In(set)) => {
            let kept: HashSet<Value> = set
                .iter()
                .filter(|m| matches!(m.compare(bound), Some(ord) if op.accepts(ord)))
                .cloned()
                .collect();
            Some(narrowed_in(&a.attribute, kept))
        }
        (AtomOp::Range(..), AtomOp::IsNull) => none(),
        (AtomOp::Range(..), AtomOp::IsNotNull) => keep_left(),

        (AtomOp::In(s), AtomOp::In(t)) => {
            let kept: HashSet<Value> = s.intersection(t).cloned().collect();
            Some(narrowed_in(&a.attribute, kept))
        }
        (AtomOp::In(s), AtomOp::NotIn(t)) => {
            let kept: HashSet<Value> = s.difference(t).cloned().collect();
            Some(narrowed_in(&a.attribute, kept))
        }
        (AtomOp::In(_), AtomOp::IsNull) => none(),
        (AtomOp::In(_), AtomOp::IsNotNull) => keep_left(),

        (AtomOp::NotIn(s), AtomOp::NotIn(t)) => {
            let excluded: HashSet<Value> = s.union(t).cloned().collect();
            Some(Predicate::Atom(Atom {
                attribute: a.attribute.clone(),
                op: AtomOp::NotIn(Arc::new(excluded)),
            }))
        }
        (AtomOp::NotIn(_), AtomOp::IsNull) => keep_right(),

        (AtomOp::IsNull, AtomOp::IsNull) => keep_left(),
        (AtomOp::IsNull, AtomOp::IsNotNull) => none(),
        (AtomOp::IsNotNull, AtomOp::IsNotNull) => keep_left(),

        _ => None,
    }
}

/// Rebuild a narrowed IN set: empty is unsatisfiable, a singleton collapses
/// to an equality.
fn narrowed_in(attribute: &relq_model::Attribute, kept: HashSet<Value>) -> Predicate {
    match kept.len() {
        0 => Predicate::None(attribute.entity().clone()),
        1 => {
            let value = kept.into_iter().next().unwrap();
            Predicate::equals(attribute.clone(), value)
        }
        _ => Predicate::Atom(Atom {
            attribute: attribute.clone(),
            op: AtomOp::In(Arc::new(kept)),
        }),
    }
}

fn combine_ranges(
    a: &Atom,
    op_a: RangeOp,
    bound_a: &Value,
    op_b: RangeOp,
    bound_b: &Value,
) -> Option<Predicate> {
    let ord = bound_a.compare(bound_b)?;
    let entity = a.attribute.entity().clone();

    let make = |op: RangeOp, bound: &Value| {
        Some(Predicate::Atom(Atom {
            attribute: a.attribute.clone(),
            op: AtomOp::Range(op, bound.clone()),
        }))
    };

    match (op_a.is_lower_bound(), op_b.is_lower_bound()) {
        // Same direction: the tighter bound wins; on equal bounds the
        // strict operator wins.
        (true, true) => match ord {
            std::cmp::Ordering::Greater => make(op_a, bound_a),
            std::cmp::Ordering::Less => make(op_b, bound_b),
            std::cmp::Ordering::Equal => {
                let op = if op_a == RangeOp::Greater || op_b == RangeOp::Greater {
                    RangeOp::Greater
                } else {
                    RangeOp::GreaterEq
                };
                make(op, bound_a)
            }
        },
        (false, false) => match ord {
            std::cmp::Ordering::Less => make(op_a, bound_a),
            std::cmp::Ordering::Greater => make(op_b, bound_b),
            std::cmp::Ordering::Equal => {
                let op = if op_a == RangeOp::Less || op_b == RangeOp::Less {
                    RangeOp::Less
                } else {
                    RangeOp::LessEq
                };
                make(op, bound_a)
            }
        },
        // Opposite directions: detect emptiness and the degenerate
        // single-point interval; real intervals stay as an And.
        (true, false) => combine_interval(a, op_a, bound_a, op_b, ord, entity),
        (false, true) => {
            combine_interval(a, op_b, bound_b, op_a, ord.reverse(), entity)
        }
    }
}

/// `lower` and `upper` with `ord = lower_bound.compare(upper_bound)`.
fn combine_interval(
    a: &Atom,
    lower: RangeOp,
    lower_bound: &Value,
    upper: RangeOp,
    ord: std::cmp::Ordering,
    entity: relq_model::EntityType,
) -> Option<Predicate> {
    match ord {
        std::cmp::Ordering::Greater => Some(Predicate::None(entity)),
        std::cmp::Ordering::Equal => {
            if lower == RangeOp::GreaterEq && upper == RangeOp::LessEq {
                Some(Predicate::equals(a.attribute.clone(), lower_bound.clone()))
            } else {
                Some(Predicate::None(entity))
            }
        }
        std::cmp::Ordering::Less => None,
    }
}

fn combine_multi_atom(me: &MultiEquality, atom: &Atom) -> Option<Predicate> {
    let entity = me.entity.clone();
    let none = || Some(Predicate::None(entity.clone()));
    let keep_multi = || Some(Predicate::MultiEquality(me.clone()));

    match me.value_for(&atom.attribute) {
        Some(existing) => match &atom.op {
            AtomOp::Eq(v) => {
                if existing == v {
                    keep_multi()
                } else {
                    none()
                }
            }
            AtomOp::NotEq(v) => {
                if existing == v {
                    none()
                } else {
                    keep_multi()
                }
            }
            AtomOp::In(set) => {
                if set.contains(existing) {
                    keep_multi()
                } else {
                    none()
                }
            }
            AtomOp::NotIn(set) => {
                if set.contains(existing) {
                    none()
                } else {
                    keep_multi()
                }
            }
            AtomOp::Range(op, bound) => match existing.compare(bound) {
                Some(ord) if op.accepts(ord) => keep_multi(),
                Some(_) => none(),
                None => None,
            },
            AtomOp::IsNull => none(),
            AtomOp::IsNotNull => keep_multi(),
        },
        None => match &atom.op {
            // A new equality extends the conjunction.
            AtomOp::Eq(v) if !atom.attribute.is_as_of() => {
                let mut pairs = me.pairs.clone();
                pairs.push((atom.attribute.clone(), v.clone()));
                Some(Predicate::multi_equality(pairs))
            }
            _ => None,
        },
    }
}

fn combine_self(a: &SelfCompare, b: &SelfCompare) -> Option<Predicate> {
    let same_pair = (a.left == b.left && a.right == b.right)
        || (a.left == b.right && a.right == b.left);
    if !same_pair {
        return None;
    }
    if a.negated == b.negated {
        Some(Predicate::SelfCompare(a.clone()))
    } else {
        Some(Predicate::None(a.left.entity().clone()))
    }
}

/// Anonymous mapped predicates over the same relationship fold into one
/// traversal. With chained mappers normalized into nested wrappers at
/// construction, this single rule also merges shared multi-hop prefixes.
fn combine_mapped(a: &MappedPredicate, b: &MappedPredicate) -> Option<Predicate> {
    if !a.mapper.is_anonymous() || !b.mapper.is_anonymous() {
        return None;
    }
    if a.mapper != b.mapper {
        return None;
    }
    let inner = a.inner.and(&b.inner);
    if inner.is_none() {
        // An unsatisfiable inner predicate can never have a witness row.
        return Some(Predicate::None(a.mapper.from().clone()));
    }
    Some(Predicate::exists(a.mapper.clone(), inner))
}

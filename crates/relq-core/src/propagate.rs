//! Transitive equality propagation.
//!
//! A predicate tree often implies equalities it never states directly: a
//! join condition `Order.customerId = Customer.id` together with
//! `Customer.id = 42` implies `Order.customerId = 42`, which may unlock an
//! indexed access path on the outer entity. The propagator discovers those
//! implications in one traversal, closes the equality graph transitively,
//! and inserts substituted predicates into scopes that lack a direct one,
//! keeping the rewrite only when it ranks better than the original tree.
//!
//! Equalities discovered inside an OR branch are not registered: they hold
//! only within the branch, and inserting them elsewhere would change the
//! matched row set. OR scopes carry container markers in their mapper
//! stacks, so no insertion position inside a branch can equal an outer
//! scope.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use relq_model::Attribute;

use crate::mapper::{Mapper, MapperStack};
use crate::predicate::{EvalContext, Predicate};

/// An attribute pinned to the scope it was seen in.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ScopedAttribute {
    stack: MapperStack,
    attribute: Attribute,
}

#[derive(Default)]
struct Registry {
    stack: MapperStack,
    container_seq: u64,
    equalities: HashMap<ScopedAttribute, HashSet<ScopedAttribute>>,
    atoms: HashMap<ScopedAttribute, Predicate>,
}

impl Registry {
    fn register(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::Atom(atom) => {
                self.add_atom(atom.attribute().clone(), predicate.clone());
            }
            Predicate::MultiEquality(me) => {
                for (attribute, value) in me.pairs() {
                    self.add_atom(
                        attribute.clone(),
                        Predicate::equals(attribute.clone(), value.clone()),
                    );
                }
            }
            Predicate::SelfCompare(sc) if !sc.negated => {
                let left = self.scoped(sc.left.clone());
                let right = self.scoped(sc.right.clone());
                self.add_equality(left, right);
            }
            Predicate::Mapped(mp) => {
                self.register_mapper(&mp.mapper);
                self.register(&mp.inner);
                self.stack.pop_mapper();
            }
            Predicate::And(children) => {
                for child in children {
                    self.register(child);
                }
            }
            Predicate::Or(children) => {
                self.container_seq += 1;
                self.stack.push_container(self.container_seq);
                for child in children {
                    self.register(child);
                }
                self.stack.pop_container();
            }
            // A negated traversal neither donates nor receives.
            Predicate::NotExists(_) => {}
            _ => {}
        }
    }

    fn register_mapper(&mut self, mapper: &Mapper) {
        if let Some(filter) = mapper.left_filter() {
            self.register(filter);
        }
        self.stack.push_mapper(mapper);
        for (left, right) in mapper.join_pairs() {
            let left = ScopedAttribute {
                stack: self.stack.without_last_mapper(),
                attribute: left.clone(),
            };
            let right = self.scoped(right.clone());
            self.add_equality(left, right);
        }
        if let Some(filter) = mapper.right_filter() {
            self.register(filter);
        }
    }

    fn scoped(&self, attribute: Attribute) -> ScopedAttribute {
        ScopedAttribute {
            stack: self.stack.clone(),
            attribute,
        }
    }

    fn add_atom(&mut self, attribute: Attribute, predicate: Predicate) {
        // The first registered predicate per scope wins.
        self.atoms
            .entry(self.scoped(attribute))
            .or_insert(predicate);
    }

    fn add_equality(&mut self, left: ScopedAttribute, right: ScopedAttribute) {
        if self.stack.has_container() {
            return;
        }
        self.equalities
            .entry(left.clone())
            .or_default()
            .insert(right.clone());
        self.equalities.entry(right).or_default().insert(left);
    }

    /// Union each attribute's equal-set with its members' equal-sets until
    /// nothing changes. The sets are bounded by the attributes in the tree,
    /// so the fixed point is reached.
    fn close_equalities(&mut self) {
        let keys: Vec<ScopedAttribute> = self.equalities.keys().cloned().collect();
        loop {
            let mut changed = false;
            for key in &keys {
                let members: Vec<ScopedAttribute> =
                    self.equalities[key].iter().cloned().collect();
                let mut additions = Vec::new();
                for member in &members {
                    if let Some(set) = self.equalities.get(member) {
                        for candidate in set {
                            if candidate != key && !self.equalities[key].contains(candidate)
                            {
                                additions.push(candidate.clone());
                            }
                        }
                    }
                }
                if !additions.is_empty() {
                    let set = self.equalities.get_mut(key).expect("key registered");
                    for addition in additions {
                        if set.insert(addition) {
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// For every scope with an equality edge but no direct predicate, clone
    /// a donor predicate from its closure with the attribute substituted.
    fn collect_insertions(&self) -> Vec<(MapperStack, Vec<Predicate>)> {
        let mut insertions: HashMap<MapperStack, Vec<Predicate>> = HashMap::new();

        let mut targets: Vec<&ScopedAttribute> = self.equalities.keys().collect();
        targets.sort_by_key(|t| stable_hash(t));

        for target in targets {
            if self.atoms.contains_key(target) {
                continue;
            }
            let mut donors: Vec<&ScopedAttribute> =
                self.equalities[target].iter().collect();
            donors.sort_by_key(|d| stable_hash(d));

            for donor in donors {
                if let Some(donor_predicate) = self.atoms.get(donor) {
                    if let Some(inserted) =
                        donor_predicate.substitute_attribute(&target.attribute)
                    {
                        insertions
                            .entry(target.stack.clone())
                            .or_default()
                            .push(inserted);
                        break;
                    }
                }
            }
        }

        let mut ordered: Vec<(MapperStack, Vec<Predicate>)> = insertions.into_iter().collect();
        ordered.sort_by_key(|(stack, _)| stable_hash(stack));
        ordered
    }
}

fn stable_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Rewrites a predicate tree by inserting transitively implied equalities.
pub struct TransitivePropagator;

impl TransitivePropagator {
    /// Propagate implied equalities through the tree and return the
    /// best-ranked rewrite: an immediate unique-index hit wins outright,
    /// otherwise the smallest estimated return size, with ties keeping the
    /// original tree.
    pub fn propagate(predicate: &Predicate, ctx: &EvalContext<'_>) -> Predicate {
        let mut registry = Registry::default();
        registry.register(predicate);
        if registry.equalities.is_empty() || registry.atoms.is_empty() {
            return predicate.clone();
        }
        registry.close_equalities();

        let insertions = registry.collect_insertions();
        if insertions.is_empty() {
            return predicate.clone();
        }

        let mut best = predicate.clone();
        let mut expected = if predicate.uses_nonunique_index(ctx) {
            predicate.estimate_return_size(ctx)
        } else {
            usize::MAX
        };

        for (stack, to_insert) in insertions {
            let Some(candidate) = insert_at(predicate, &stack, &to_insert) else {
                continue;
            };
            if candidate.uses_unique_index(ctx) {
                return candidate;
            }
            if candidate.is_estimatable(ctx) {
                let estimate = candidate.estimate_return_size(ctx);
                if estimate < expected {
                    expected = estimate;
                    best = candidate;
                }
            }
        }
        best
    }
}

/// Rebuild the tree with `ops` conjoined at the target scope. Returns
/// `None` when the scope is unreachable, which only happens when the tree
/// changed shape between registration and insertion.
fn insert_at(
    predicate: &Predicate,
    target: &MapperStack,
    ops: &[Predicate],
) -> Option<Predicate> {
    if target.is_empty() {
        return Some(ops.iter().fold(predicate.clone(), |acc, op| acc.and(op)));
    }
    let mut current = MapperStack::new();
    insert_walk(predicate, target, &mut current, ops)
}

fn insert_walk(
    predicate: &Predicate,
    target: &MapperStack,
    current: &mut MapperStack,
    ops: &[Predicate],
) -> Option<Predicate> {
    match predicate {
        Predicate::Mapped(mp) => {
            current.push_mapper(&mp.mapper);
            let inner = if current == target {
                Some(ops.iter().fold((*mp.inner).clone(), |acc, op| acc.and(op)))
            } else {
                insert_walk(&mp.inner, target, current, ops)
            };
            current.pop_mapper();
            inner.map(|inner| Predicate::exists(mp.mapper.clone(), inner))
        }
        Predicate::And(children) => {
            for (i, child) in children.iter().enumerate() {
                if let Some(rewritten) = insert_walk(child, target, current, ops) {
                    let mut rebuilt = children.clone();
                    rebuilt[i] = rewritten;
                    return Some(Predicate::and_many(rebuilt));
                }
            }
            None
        }
        // Never insert into an OR branch.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::mapper::Cardinality;
    use crate::resolver::IndexRegistry;
    use crate::source::{CacheSource, IndexInfo};
    use crate::test_support::MemoryCache;
    use relq_model::{EntityType, Value};
    use std::sync::Arc;

    struct Fixture {
        cache: Arc<MemoryCache>,
        order: EntityType,
        customer: EntityType,
        join: Mapper,
    }

    fn fixture() -> Fixture {
        let order = EntityType::new("Order");
        let customer = EntityType::new("Customer");
        let cache = MemoryCache::new();
        cache.define_index(
            vec![customer.attribute("id")],
            IndexInfo::unique_immutable(),
        );

        for i in 0..10i64 {
            cache.insert_row(
                &customer,
                i as u64,
                vec![
                    ("id".into(), Value::Int64(i)),
                    ("name".into(), Value::String(format!("C{i}"))),
                ],
            );
        }
        for i in 0..20i64 {
            cache.insert_row(
                &order,
                (100 + i) as u64,
                vec![
                    ("id".into(), Value::Int64(100 + i)),
                    ("customerId".into(), Value::Int64(i % 10)),
                ],
            );
        }
        cache.set_fully_cached(&order);
        cache.set_fully_cached(&customer);

        let join = Mapper::anonymous_join(
            vec![(order.attribute("customerId"), customer.attribute("id"))],
            Cardinality::ToOne,
        );
        Fixture {
            cache: Arc::new(cache),
            order,
            customer,
            join,
        }
    }

    #[test]
    fn test_join_equality_propagates_to_outer_scope() {
        let f = fixture();
        let registry = IndexRegistry::new(Arc::clone(&f.cache) as Arc<dyn CacheSource>);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        let original = Predicate::exists(
            f.join.clone(),
            Predicate::equals(f.customer.attribute("id"), 4i64),
        );
        let propagated = TransitivePropagator::propagate(&original, &ctx);

        // The rewrite gained a direct constraint on the outer attribute.
        assert_ne!(propagated, original);
        let direct = Predicate::equals(f.order.attribute("customerId"), 4i64);
        let expected = direct.apply_to_full_cache(&ctx).unwrap();
        let actual = propagated.apply_to_full_cache(&ctx).unwrap();

        let mut expected_ids: Vec<_> = expected.iter().map(|r| r.id()).collect();
        let mut actual_ids: Vec<_> = actual.iter().map(|r| r.id()).collect();
        expected_ids.sort();
        actual_ids.sort();
        assert_eq!(actual_ids, expected_ids);
        assert_eq!(actual_ids.len(), 2);
    }

    #[test]
    fn test_propagation_prefers_unique_index_path() {
        let f = fixture();
        let registry = IndexRegistry::new(Arc::clone(&f.cache) as Arc<dyn CacheSource>);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        // Reverse direction: a Customer query joined to Order, where the
        // order-side equality can be pulled up to Customer.id's unique
        // index.
        let reverse = f.join.reverse().clone();
        let original = Predicate::exists(
            reverse,
            Predicate::equals(f.order.attribute("customerId"), 4i64),
        );
        let propagated = TransitivePropagator::propagate(&original, &ctx);

        assert!(propagated.uses_unique_index(&ctx));
    }

    #[test]
    fn test_no_equalities_returns_original() {
        let f = fixture();
        let registry = IndexRegistry::new(Arc::clone(&f.cache) as Arc<dyn CacheSource>);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        let plain = Predicate::equals(f.order.attribute("customerId"), 1i64);
        assert_eq!(TransitivePropagator::propagate(&plain, &ctx), plain);
    }

    #[test]
    fn test_or_branch_equalities_not_propagated() {
        let f = fixture();
        let registry = IndexRegistry::new(Arc::clone(&f.cache) as Arc<dyn CacheSource>);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        // The mapped equality lives under an OR branch; pulling it to the
        // root would drop rows matched by the other branch.
        let mapped = Predicate::exists(
            f.join.clone(),
            Predicate::equals(f.customer.attribute("id"), 4i64),
        );
        let other = Predicate::equals(f.order.attribute("id"), 105i64);
        let original = mapped.or(&other);

        let propagated = TransitivePropagator::propagate(&original, &ctx);
        assert_eq!(propagated, original);
    }

    #[test]
    fn test_self_equality_bridges_attributes() {
        let f = fixture();
        let registry = IndexRegistry::new(Arc::clone(&f.cache) as Arc<dyn CacheSource>);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        // billingId = shippingId and shippingId = 3 implies billingId = 3.
        let original = Predicate::self_equals(
            f.order.attribute("billingId"),
            f.order.attribute("shippingId"),
        )
        .and(&Predicate::equals(f.order.attribute("shippingId"), 3i64));

        let propagated = TransitivePropagator::propagate(&original, &ctx);
        assert_ne!(propagated, original);

        // The inserted billingId equality canonicalizes with the existing
        // shippingId equality into one multi-equality.
        match &propagated {
            Predicate::And(children) => {
                let me = children
                    .iter()
                    .find_map(|c| match c {
                        Predicate::MultiEquality(me) => Some(me),
                        _ => Option::None,
                    })
                    .expect("expected a multi-equality operand");
                assert_eq!(
                    me.value_for(&f.order.attribute("billingId")),
                    Some(&Value::Int64(3))
                );
            }
            other => panic!("expected And, got {other:?}"),
        }
    }
}

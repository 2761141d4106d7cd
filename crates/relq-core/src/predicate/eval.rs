//! Predicate evaluation.
//!
//! Three modes with distinct completeness guarantees:
//! - [`Predicate::apply_to_full_cache`] answers exactly, and only when every
//!   touched entity type is fully cache-resident.
//! - [`Predicate::apply_to_partial_cache`] answers only when completeness
//!   can be proven through unique immutable indexes; otherwise "ask the
//!   database".
//! - [`Predicate::apply_to_list`] filters a caller-supplied candidate list,
//!   preserving input order, avoiding copies until the first non-match, and
//!   fanning out to the worker pool above the configured size threshold.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use relq_model::{Row, RowId, RowList};

use crate::config::ResolverConfig;
use crate::resolver::IndexRegistry;
use crate::source::{collect_rows, CacheSource};

use super::{AtomOp, Predicate};

/// Evaluation context: the resolver's index memo, configuration, and the
/// optional bounded worker pool.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    indexes: &'a IndexRegistry,
    config: &'a ResolverConfig,
    pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> EvalContext<'a> {
    /// Context without a worker pool; filtering stays sequential.
    pub fn new(indexes: &'a IndexRegistry, config: &'a ResolverConfig) -> Self {
        Self {
            indexes,
            config,
            pool: None,
        }
    }

    /// Attach the worker pool for parallel list filtering.
    pub fn with_pool(mut self, pool: Option<&'a rayon::ThreadPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The index-reference memo.
    pub fn indexes(&self) -> &'a IndexRegistry {
        self.indexes
    }

    /// The underlying cache.
    pub fn cache(&self) -> &'a dyn CacheSource {
        self.indexes.cache()
    }

    /// The resolver configuration.
    pub fn config(&self) -> &'a ResolverConfig {
        self.config
    }

    /// The bounded worker pool, when parallel execution is enabled.
    pub fn pool(&self) -> Option<&'a rayon::ThreadPool> {
        self.pool
    }
}

impl Predicate {
    /// Evaluate against one materialized row. A concurrently deleted row is
    /// a non-match, never an error.
    pub fn matches(&self, row: &Row, ctx: &EvalContext<'_>) -> bool {
        if row.is_deleted() {
            return false;
        }
        match self {
            Predicate::All(entity) => row.entity() == entity,
            Predicate::None(_) => false,
            Predicate::Atom(atom) => {
                let value = atom.attribute.value_in(row);
                match &atom.op {
                    AtomOp::Eq(v) => value.is_some_and(|rv| !rv.is_null() && rv == v),
                    AtomOp::NotEq(v) => value.is_some_and(|rv| rv != v),
                    AtomOp::Range(op, bound) => value.is_some_and(|rv| {
                        matches!(rv.compare(bound), Some(ord) if op.accepts(ord))
                    }),
                    AtomOp::In(set) => value.is_some_and(|rv| set.contains(rv)),
                    AtomOp::NotIn(set) => value.map_or(true, |rv| !set.contains(rv)),
                    AtomOp::IsNull => value.map_or(true, |rv| rv.is_null()),
                    AtomOp::IsNotNull => value.is_some_and(|rv| !rv.is_null()),
                }
            }
            Predicate::MultiEquality(me) => me.pairs.iter().all(|(attr, v)| {
                attr.value_in(row)
                    .is_some_and(|rv| !rv.is_null() && rv == v)
            }),
            Predicate::SelfCompare(sc) => {
                let (Some(left), Some(right)) =
                    (sc.left.value_in(row), sc.right.value_in(row))
                else {
                    return false;
                };
                if sc.negated {
                    left != right
                } else {
                    left == right
                }
            }
            Predicate::TupleIn(ti) => {
                let mut tuple = Vec::with_capacity(ti.attributes.len());
                for attr in &ti.attributes {
                    match attr.value_in(row) {
                        Some(v) if !v.is_null() => tuple.push(v.clone()),
                        _ => return false,
                    }
                }
                ti.tuples.contains(&tuple)
            }
            Predicate::Mapped(mp) => mp
                .mapper
                .related_rows(row, ctx)
                .iter()
                .any(|related| mp.inner.matches(related, ctx)),
            Predicate::NotExists(mp) => !mp
                .mapper
                .related_rows(row, ctx)
                .iter()
                .any(|related| mp.inner.matches(related, ctx)),
            Predicate::And(children) => children.iter().all(|c| c.matches(row, ctx)),
            Predicate::Or(children) => children.iter().any(|c| c.matches(row, ctx)),
        }
    }

    /// Filter a candidate list, preserving input order.
    ///
    /// The input handle is returned untouched while every row matches; the
    /// first non-match materializes a new list sized by extrapolating the
    /// observed match ratio. Lists above the configured threshold are
    /// partitioned across the worker pool and concatenated in order.
    pub fn apply_to_list(&self, rows: &RowList, ctx: &EvalContext<'_>) -> RowList {
        if let Some(pool) = ctx.pool {
            if rows.len() > ctx.config.parallel_filter_threshold {
                return self.apply_to_list_parallel(rows, pool, ctx);
            }
        }
        self.apply_to_list_sequential(rows, ctx)
    }

    fn apply_to_list_sequential(&self, rows: &RowList, ctx: &EvalContext<'_>) -> RowList {
        for (i, row) in rows.iter().enumerate() {
            if !self.matches(row, ctx) {
                let ratio = i as f64 / (i + 1) as f64;
                let capacity = (rows.len() as f64 * ratio).ceil() as usize;
                let mut out: Vec<Arc<Row>> = Vec::with_capacity(capacity.max(i));
                out.extend_from_slice(&rows[..i]);
                for row in &rows[i + 1..] {
                    if self.matches(row, ctx) {
                        out.push(Arc::clone(row));
                    }
                }
                return Arc::new(out);
            }
        }
        Arc::clone(rows)
    }

    fn apply_to_list_parallel(
        &self,
        rows: &RowList,
        pool: &rayon::ThreadPool,
        ctx: &EvalContext<'_>,
    ) -> RowList {
        let workers = pool.current_num_threads().max(1);
        let chunk = rows.len().div_ceil(workers);

        let parts: Vec<Vec<Arc<Row>>> = pool.install(|| {
            rows.par_chunks(chunk)
                .map(|part| {
                    part.iter()
                        .filter(|row| self.matches(row, ctx))
                        .cloned()
                        .collect()
                })
                .collect()
        });

        let total: usize = parts.iter().map(Vec::len).sum();
        if total == rows.len() {
            return Arc::clone(rows);
        }
        let mut out = Vec::with_capacity(total);
        for part in parts {
            out.extend(part);
        }
        Arc::new(out)
    }

    /// Resolve against the full cache.
    ///
    /// Returns `None` when any touched entity type is not fully
    /// cache-resident; the caller falls through to the partial-cache probe
    /// or the database.
    pub fn apply_to_full_cache(&self, ctx: &EvalContext<'_>) -> Option<Vec<Arc<Row>>> {
        let mut entities = HashSet::new();
        self.collect_entities(&mut entities);
        if !super::estimate::all_fully_cached(entities.iter(), ctx) {
            return None;
        }
        Some(self.eval_full(ctx))
    }

    /// Full-cache evaluation; every touched entity is known resident.
    fn eval_full(&self, ctx: &EvalContext<'_>) -> Vec<Arc<Row>> {
        match self {
            Predicate::None(_) => Vec::new(),
            Predicate::All(entity) => live(collect_rows(ctx.cache(), entity)),
            Predicate::Atom(atom) => match &atom.op {
                AtomOp::Eq(v) => {
                    let attrs = std::slice::from_ref(&atom.attribute);
                    let entity = atom.attribute.entity();
                    if ctx.indexes.resolve(entity, attrs).is_some() {
                        if let Some(rows) =
                            ctx.indexes.lookup(entity, attrs, &[v.clone()])
                        {
                            return live(rows);
                        }
                    }
                    self.scan_filter(ctx)
                }
                AtomOp::In(set) => {
                    let attrs = std::slice::from_ref(&atom.attribute);
                    let entity = atom.attribute.entity();
                    if ctx.indexes.resolve(entity, attrs).is_some() {
                        let mut out = Vec::new();
                        let mut seen: HashSet<RowId> = HashSet::new();
                        for value in set.iter() {
                            if let Some(rows) =
                                ctx.indexes.lookup(entity, attrs, &[value.clone()])
                            {
                                for row in rows {
                                    if !row.is_deleted() && seen.insert(row.id()) {
                                        out.push(row);
                                    }
                                }
                            }
                        }
                        return out;
                    }
                    self.scan_filter(ctx)
                }
                _ => self.scan_filter(ctx),
            },
            Predicate::MultiEquality(me) => {
                let attrs = me.attributes();
                if ctx.indexes.resolve(&me.entity, &attrs).is_some() {
                    if let Some(rows) = ctx.indexes.lookup(&me.entity, &attrs, &me.values())
                    {
                        return live(rows);
                    }
                }
                self.scan_filter(ctx)
            }
            Predicate::TupleIn(ti) => {
                if ctx.indexes.resolve(self.entity(), &ti.attributes).is_some() {
                    let mut out = Vec::new();
                    let mut seen: HashSet<RowId> = HashSet::new();
                    for tuple in ti.tuples.iter() {
                        if let Some(rows) =
                            ctx.indexes.lookup(self.entity(), &ti.attributes, tuple)
                        {
                            for row in rows {
                                if !row.is_deleted() && seen.insert(row.id()) {
                                    out.push(row);
                                }
                            }
                        }
                    }
                    return out;
                }
                self.scan_filter(ctx)
            }
            Predicate::Mapped(mp) => {
                let inner = mp.inner.eval_full(ctx);
                live(mp.mapper.map(&inner, ctx))
            }
            Predicate::And(children) => {
                // The best-ranked operand drives; the rest filter.
                let mut order: Vec<&Predicate> = children.iter().collect();
                order.sort_by(|a, b| {
                    crate::resolver::cost::compare_access_paths(a, b, ctx)
                });
                let mut rows = order[0].eval_full(ctx);
                for rest in &order[1..] {
                    rows.retain(|row| rest.matches(row, ctx));
                }
                rows
            }
            Predicate::Or(children) => {
                let mut out = Vec::new();
                let mut seen: HashSet<RowId> = HashSet::new();
                for child in children {
                    for row in child.eval_full(ctx) {
                        if seen.insert(row.id()) {
                            out.push(row);
                        }
                    }
                }
                out
            }
            Predicate::SelfCompare(_) | Predicate::NotExists(_) => self.scan_filter(ctx),
        }
    }

    fn scan_filter(&self, ctx: &EvalContext<'_>) -> Vec<Arc<Row>> {
        let mut out = Vec::new();
        ctx.cache().for_each_row(self.entity(), &mut |row| {
            if self.matches(row, ctx) {
                out.push(Arc::clone(row));
            }
        });
        out
    }

    /// Probe the partial cache.
    ///
    /// Returns `Some` only when the predicate proves completeness, e.g. a
    /// unique immutable index hit for every requested key. `None` means
    /// "unknown, ask the database".
    pub fn apply_to_partial_cache(&self, ctx: &EvalContext<'_>) -> Option<Vec<Arc<Row>>> {
        match self {
            Predicate::None(_) => Some(Vec::new()),
            Predicate::Atom(atom) => match &atom.op {
                AtomOp::Eq(v) => {
                    probe_unique(ctx, self, std::slice::from_ref(&atom.attribute), &[v.clone()])
                }
                AtomOp::In(set) => {
                    // Complete only when every member hits.
                    let attrs = std::slice::from_ref(&atom.attribute);
                    let mut out = Vec::new();
                    for value in set.iter() {
                        let rows = probe_unique(ctx, self, attrs, &[value.clone()])?;
                        out.extend(rows);
                    }
                    Some(out)
                }
                _ => None,
            },
            Predicate::MultiEquality(me) => {
                probe_unique(ctx, self, &me.attributes(), &me.values())
            }
            Predicate::TupleIn(ti) => {
                let mut out = Vec::new();
                for tuple in ti.tuples.iter() {
                    let rows = probe_unique(ctx, self, &ti.attributes, tuple)?;
                    out.extend(rows);
                }
                Some(out)
            }
            Predicate::Mapped(mp) => {
                let inner = mp.inner.apply_to_partial_cache(ctx)?;
                if inner.is_empty() {
                    return Some(Vec::new());
                }
                mp.mapper.map_partial(&inner, ctx)
            }
            Predicate::And(children) => {
                let (driver_index, mut rows) = children
                    .iter()
                    .enumerate()
                    .find_map(|(i, c)| c.apply_to_partial_cache(ctx).map(|r| (i, r)))?;
                for (i, child) in children.iter().enumerate() {
                    if i == driver_index {
                        continue;
                    }
                    // Relationship traversals cannot be trusted as filters
                    // against a partial cache.
                    if matches!(child, Predicate::Mapped(_) | Predicate::NotExists(_)) {
                        return None;
                    }
                    rows.retain(|row| child.matches(row, ctx));
                }
                Some(rows)
            }
            Predicate::Or(children) => {
                let mut out = Vec::new();
                let mut seen: HashSet<RowId> = HashSet::new();
                for child in children {
                    let rows = child.apply_to_partial_cache(ctx)?;
                    for row in rows {
                        if seen.insert(row.id()) {
                            out.push(row);
                        }
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }
}

/// A hit on a unique immutable index proves completeness; anything else is
/// unknown.
fn probe_unique(
    ctx: &EvalContext<'_>,
    predicate: &Predicate,
    attrs: &[relq_model::Attribute],
    key: &[relq_model::Value],
) -> Option<Vec<Arc<Row>>> {
    let entity = predicate.entity();
    let reference = ctx.indexes().resolve(entity, attrs)?;
    if !(reference.info.unique && reference.info.immutable) {
        return None;
    }
    let rows = live(ctx.indexes().lookup(entity, attrs, key)?);
    if rows.is_empty() {
        // A miss against a partial cache proves nothing.
        return None;
    }
    Some(rows)
}

fn live(rows: Vec<Arc<Row>>) -> Vec<Arc<Row>> {
    rows.into_iter().filter(|r| !r.is_deleted()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::mapper::{Cardinality, Mapper};
    use crate::source::IndexInfo;
    use crate::test_support::MemoryCache;
    use relq_model::{shared_row_list, EntityType, Value};

    fn customer_cache(fully: bool) -> (Arc<MemoryCache>, EntityType) {
        let customer = EntityType::new("Customer");
        let cache = MemoryCache::new();
        cache.define_index(
            vec![customer.attribute("id")],
            IndexInfo::unique_immutable(),
        );
        for i in 0..20i64 {
            cache.insert_row(
                &customer,
                i as u64,
                vec![
                    ("id".into(), Value::Int64(i)),
                    ("region".into(), Value::String(format!("R{}", i % 4))),
                ],
            );
        }
        if fully {
            cache.set_fully_cached(&customer);
        }
        (Arc::new(cache), customer)
    }

    fn ctx_parts(cache: Arc<MemoryCache>) -> (IndexRegistry, ResolverConfig) {
        (IndexRegistry::new(cache), ResolverConfig::default())
    }

    #[test]
    fn test_matches_atom_operators() {
        let (cache, customer) = customer_cache(true);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let row = Row::new(
            customer.clone(),
            100,
            vec![
                ("id".into(), Value::Int64(5)),
                ("region".into(), Value::String("R1".into())),
                ("note".into(), Value::Null),
            ],
        );

        assert!(Predicate::equals(customer.attribute("id"), 5i64).matches(&row, &ctx));
        assert!(!Predicate::equals(customer.attribute("id"), 6i64).matches(&row, &ctx));
        assert!(Predicate::not_equals(customer.attribute("id"), 6i64).matches(&row, &ctx));
        assert!(Predicate::greater_than(customer.attribute("id"), 4i64).matches(&row, &ctx));
        assert!(!Predicate::greater_than(customer.attribute("id"), 5i64).matches(&row, &ctx));
        assert!(Predicate::greater_eq(customer.attribute("id"), 5i64).matches(&row, &ctx));
        assert!(Predicate::less_than(customer.attribute("id"), 6i64).matches(&row, &ctx));
        assert!(
            Predicate::is_in(customer.attribute("id"), vec![4i64, 5]).matches(&row, &ctx)
        );
        assert!(
            Predicate::not_in(customer.attribute("id"), vec![7i64, 8]).matches(&row, &ctx)
        );
        assert!(Predicate::is_null(customer.attribute("note")).matches(&row, &ctx));
        assert!(Predicate::is_null(customer.attribute("missing")).matches(&row, &ctx));
        assert!(Predicate::is_not_null(customer.attribute("id")).matches(&row, &ctx));
    }

    #[test]
    fn test_deleted_row_never_matches() {
        let (cache, customer) = customer_cache(true);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let row = Row::new(customer.clone(), 100, vec![("id".into(), Value::Int64(5))]);
        let pred = Predicate::equals(customer.attribute("id"), 5i64);
        assert!(pred.matches(&row, &ctx));

        row.mark_deleted();
        assert!(!pred.matches(&row, &ctx));
        assert!(!Predicate::all(customer).matches(&row, &ctx));
    }

    #[test]
    fn test_apply_to_list_preserves_order() {
        let (cache, customer) = customer_cache(true);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let rows = shared_row_list(crate::source::collect_rows(registry.cache(), &customer));
        let pred = Predicate::equals(customer.attribute("region"), "R1");
        let filtered = pred.apply_to_list(&rows, &ctx);

        let ids: Vec<i64> = filtered
            .iter()
            .map(|r| r.get("id").unwrap().as_i64().unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids, vec![1, 5, 9, 13, 17]);
    }

    #[test]
    fn test_apply_to_list_all_match_returns_same_handle() {
        let (cache, customer) = customer_cache(true);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let rows = shared_row_list(crate::source::collect_rows(registry.cache(), &customer));
        let filtered = Predicate::all(customer).apply_to_list(&rows, &ctx);
        assert!(Arc::ptr_eq(&rows, &filtered));
    }

    #[test]
    fn test_apply_to_list_parallel_matches_sequential() {
        let (cache, customer) = customer_cache(true);
        let registry = IndexRegistry::new(cache);
        let config = ResolverConfig::default().with_parallel_filter_threshold(4);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap();

        let rows = shared_row_list(crate::source::collect_rows(registry.cache(), &customer));
        let pred = Predicate::equals(customer.attribute("region"), "R2");

        let sequential =
            pred.apply_to_list(&rows, &EvalContext::new(&registry, &config));
        let parallel = pred.apply_to_list(
            &rows,
            &EvalContext::new(&registry, &config).with_pool(Some(&pool)),
        );

        let seq_ids: Vec<_> = sequential.iter().map(|r| r.id()).collect();
        let par_ids: Vec<_> = parallel.iter().map(|r| r.id()).collect();
        assert_eq!(seq_ids, par_ids);
    }

    #[test]
    fn test_full_cache_unique_lookup() {
        let (cache, customer) = customer_cache(true);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let rows = Predicate::equals(customer.attribute("id"), 7i64)
            .apply_to_full_cache(&ctx)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int64(7)));
    }

    #[test]
    fn test_full_cache_requires_residency() {
        let (cache, customer) = customer_cache(false);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let result =
            Predicate::equals(customer.attribute("region"), "R1").apply_to_full_cache(&ctx);
        assert!(result.is_none());
    }

    #[test]
    fn test_full_cache_and_or() {
        let (cache, customer) = customer_cache(true);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let conj = Predicate::equals(customer.attribute("region"), "R1")
            .and(&Predicate::less_than(customer.attribute("id"), 10i64));
        let rows = conj.apply_to_full_cache(&ctx).unwrap();
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| r.get("id").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(ids.len(), 3); // 1, 5, 9

        let disj = Predicate::equals(customer.attribute("id"), 1i64)
            .or(&Predicate::equals(customer.attribute("id"), 2i64));
        let rows = disj.apply_to_full_cache(&ctx).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_partial_cache_unique_immutable_hit() {
        let (cache, customer) = customer_cache(false);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let hit = Predicate::equals(customer.attribute("id"), 3i64)
            .apply_to_partial_cache(&ctx)
            .unwrap();
        assert_eq!(hit.len(), 1);

        // A miss proves nothing against a partial cache.
        assert!(Predicate::equals(customer.attribute("id"), 999i64)
            .apply_to_partial_cache(&ctx)
            .is_none());

        // Scans are never trustworthy against a partial cache.
        assert!(Predicate::equals(customer.attribute("region"), "R1")
            .apply_to_partial_cache(&ctx)
            .is_none());
    }

    #[test]
    fn test_partial_cache_in_requires_every_member() {
        let (cache, customer) = customer_cache(false);
        let (registry, config) = ctx_parts(cache);
        let ctx = EvalContext::new(&registry, &config);

        let all_present = Predicate::is_in(customer.attribute("id"), vec![1i64, 2, 3])
            .apply_to_partial_cache(&ctx)
            .unwrap();
        assert_eq!(all_present.len(), 3);

        assert!(
            Predicate::is_in(customer.attribute("id"), vec![1i64, 999])
                .apply_to_partial_cache(&ctx)
                .is_none()
        );
    }

    #[test]
    fn test_not_exists_complements_exists() {
        let order = EntityType::new("Order");
        let customer = EntityType::new("Customer");
        let cache = MemoryCache::new();
        cache.insert_row(
            &customer,
            1,
            vec![
                ("id".into(), Value::Int64(1)),
                ("name".into(), Value::String("Alice".into())),
            ],
        );
        cache.insert_row(
            &customer,
            2,
            vec![
                ("id".into(), Value::Int64(2)),
                ("name".into(), Value::String("Bob".into())),
            ],
        );
        for (id, customer_id) in [(10, 1i64), (11, 2), (12, 1)] {
            cache.insert_row(
                &order,
                id,
                vec![
                    ("id".into(), Value::Int64(id as i64)),
                    ("customerId".into(), Value::Int64(customer_id)),
                ],
            );
        }
        cache.set_fully_cached(&customer);
        cache.set_fully_cached(&order);
        let (registry, config) = ctx_parts(Arc::new(cache));
        let ctx = EvalContext::new(&registry, &config);

        let join = Mapper::anonymous_join(
            vec![(order.attribute("customerId"), customer.attribute("id"))],
            Cardinality::ToOne,
        );
        let inner = Predicate::equals(customer.attribute("name"), "Alice");
        let exists = Predicate::exists(join.clone(), inner.clone());
        let not_exists = Predicate::not_exists(join, inner);

        let with: Vec<_> = exists
            .apply_to_full_cache(&ctx)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();
        let without: Vec<_> = not_exists
            .apply_to_full_cache(&ctx)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();

        assert_eq!(with, vec![10, 12]);
        assert_eq!(without, vec![11]);

        // Never provable against a partial cache.
        assert!(not_exists.apply_to_partial_cache(&ctx).is_none());
    }

    #[test]
    fn test_tuple_in_matches_row_tuples() {
        let item = EntityType::new("OrderItem");
        let cache = MemoryCache::new();
        for (id, order_id, line) in [(1u64, 10i64, 1i64), (2, 10, 2), (3, 11, 1)] {
            cache.insert_row(
                &item,
                id,
                vec![
                    ("orderId".into(), Value::Int64(order_id)),
                    ("line".into(), Value::Int64(line)),
                ],
            );
        }
        cache.set_fully_cached(&item);
        let (registry, config) = ctx_parts(Arc::new(cache));
        let ctx = EvalContext::new(&registry, &config);

        let pred = Predicate::tuple_in(
            vec![item.attribute("orderId"), item.attribute("line")],
            vec![
                vec![Value::Int64(10), Value::Int64(2)],
                vec![Value::Int64(11), Value::Int64(1)],
            ],
        );

        let rows = pred.apply_to_full_cache(&ctx).unwrap();
        let mut ids: Vec<_> = rows.iter().map(|r| r.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_mapped_predicate_matches() {
        let order = EntityType::new("Order");
        let customer = EntityType::new("Customer");
        let cache = MemoryCache::new();
        cache.define_index(
            vec![customer.attribute("id")],
            IndexInfo::unique_immutable(),
        );
        cache.insert_row(
            &customer,
            1,
            vec![
                ("id".into(), Value::Int64(1)),
                ("name".into(), Value::String("Alice".into())),
            ],
        );
        cache.insert_row(
            &order,
            10,
            vec![
                ("id".into(), Value::Int64(10)),
                ("customerId".into(), Value::Int64(1)),
            ],
        );
        cache.set_fully_cached(&customer);
        cache.set_fully_cached(&order);
        let (registry, config) = ctx_parts(Arc::new(cache));
        let ctx = EvalContext::new(&registry, &config);

        let mapper = Mapper::anonymous_join(
            vec![(order.attribute("customerId"), customer.attribute("id"))],
            Cardinality::ToOne,
        );
        let by_name = Predicate::exists(
            mapper.clone(),
            Predicate::equals(customer.attribute("name"), "Alice"),
        );
        let by_other = Predicate::exists(
            mapper,
            Predicate::equals(customer.attribute("name"), "Bob"),
        );

        let order_row = Row::new(
            order.clone(),
            10,
            vec![
                ("id".into(), Value::Int64(10)),
                ("customerId".into(), Value::Int64(1)),
            ],
        );
        assert!(by_name.matches(&order_row, &ctx));
        assert!(!by_other.matches(&order_row, &ctx));

        let rows = by_name.apply_to_full_cache(&ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::Int64(10)));
    }
}

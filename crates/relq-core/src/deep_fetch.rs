//! Batched relationship resolution.
//!
//! A deep fetch resolves one relationship for a whole list of parent
//! objects while avoiding the N+1 query pattern: one predicate is derived
//! per parent (deduplicating parents that share a join key), every derived
//! predicate is first tried against the shape-match cache and the
//! in-memory cache, and the entire unresolved remainder is then fetched in
//! a single batched round trip whose rows are redistributed into
//! per-parent buckets. Both the batch predicate and every per-parent
//! predicate populate the shape-match cache, so later single-parent
//! lookups hit memory.
//!
//! A concurrent population change can hand the batch more rows than the
//! parents requested; the excess is logged and dropped rather than
//! corrupting the per-parent association.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use relq_model::{shared_row_list, Attribute, Row, RowId, Value};
use tracing::warn;

use crate::error::Error;
use crate::mapper::Mapper;
use crate::predicate::{EvalContext, Predicate};
use crate::resolver::Resolver;

/// Resolution shape, classified once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepFetchStrategy {
    /// Single hop, at most one related row per parent.
    SimpleToOne,
    /// Single hop, any number of related rows per parent.
    SimpleToMany,
    /// Multi-hop: decomposed into single-hop steps, each resolved against
    /// the previous hop's output list.
    Chained,
}

impl DeepFetchStrategy {
    /// Classify by the mapper's declared shape.
    pub fn classify(mapper: &Mapper) -> Self {
        if mapper.hop_count() > 1 {
            DeepFetchStrategy::Chained
        } else if mapper.is_to_many() {
            DeepFetchStrategy::SimpleToMany
        } else {
            DeepFetchStrategy::SimpleToOne
        }
    }

    /// Classify by the reverse mapper's index-resolvability instead of the
    /// declared cardinality. This is a one-time decision taken at
    /// construction, not a per-call branch.
    pub fn delegating(mapper: &Mapper, ctx: &EvalContext<'_>) -> Self {
        if mapper.hop_count() > 1 {
            DeepFetchStrategy::Chained
        } else if mapper.reverse().unique_index_usable(ctx) {
            DeepFetchStrategy::SimpleToOne
        } else {
            DeepFetchStrategy::SimpleToMany
        }
    }
}

/// Completed deep-fetch association: related rows bucketed per parent.
#[derive(Debug)]
pub struct DeepFetchResult {
    buckets: HashMap<RowId, Vec<Arc<Row>>>,
    round_trips: usize,
}

impl DeepFetchResult {
    /// Related rows for one parent, in resolution order.
    pub fn rows_for(&self, parent: &Row) -> &[Arc<Row>] {
        self.buckets
            .get(&parent.id())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The single related row of a to-one relationship, if present.
    pub fn one_for(&self, parent: &Row) -> Option<&Arc<Row>> {
        self.rows_for(parent).first()
    }

    /// Number of database round trips the resolution paid.
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    /// Total related rows across all parents, counting shared rows once
    /// per parent.
    pub fn total_rows(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// Transient batch-resolution context for one relationship and one parent
/// list.
pub struct DeepFetchNode<'a> {
    resolver: &'a Resolver,
    parents: Vec<Arc<Row>>,
    mapper: Mapper,
    strategy: DeepFetchStrategy,
    buckets: HashMap<RowId, Vec<Arc<Row>>>,
    resolved: HashSet<RowId>,
    round_trips: usize,
}

struct HopOutcome {
    buckets: HashMap<RowId, Vec<Arc<Row>>>,
    resolved: HashSet<RowId>,
    round_trips: usize,
}

impl<'a> DeepFetchNode<'a> {
    /// Create a node; the strategy is classified once from the mapper.
    pub fn new(resolver: &'a Resolver, parents: &[Arc<Row>], mapper: Mapper) -> Self {
        let strategy = DeepFetchStrategy::classify(&mapper);
        Self::with_strategy(resolver, parents, mapper, strategy)
    }

    /// Create a node whose to-one/to-many split is decided by the reverse
    /// mapper's index-resolvability.
    pub fn delegating(resolver: &'a Resolver, parents: &[Arc<Row>], mapper: Mapper) -> Self {
        let strategy = DeepFetchStrategy::delegating(&mapper, &resolver.eval_context());
        Self::with_strategy(resolver, parents, mapper, strategy)
    }

    fn with_strategy(
        resolver: &'a Resolver,
        parents: &[Arc<Row>],
        mapper: Mapper,
        strategy: DeepFetchStrategy,
    ) -> Self {
        Self {
            resolver,
            parents: parents.to_vec(),
            mapper,
            strategy,
            buckets: HashMap::new(),
            resolved: HashSet::new(),
            round_trips: 0,
        }
    }

    /// The classified resolution strategy.
    pub fn strategy(&self) -> DeepFetchStrategy {
        self.strategy
    }

    /// Fraction of parents resolved so far, in [0.0, 1.0].
    pub fn percent_complete(&self) -> f64 {
        if self.parents.is_empty() {
            return 1.0;
        }
        self.resolved.len() as f64 / self.parents.len() as f64
    }

    /// Resolve as far as the in-memory cache allows, without paying any
    /// round trip, and report the fraction of parents satisfied. The
    /// caller can inspect the result before deciding to pay for
    /// [`DeepFetchNode::resolve`].
    pub fn resolve_from_cache(&mut self) -> f64 {
        // Cache-only resolution cannot fail; the error arm is unreachable.
        let _ = self.run(false);
        self.percent_complete()
    }

    /// Resolve the whole batch, paying at most one round trip per hop for
    /// the unresolved remainder.
    pub fn resolve(&mut self) -> Result<DeepFetchResult, Error> {
        self.run(true)?;
        Ok(DeepFetchResult {
            buckets: mem::take(&mut self.buckets),
            round_trips: self.round_trips,
        })
    }

    fn run(&mut self, allow_db: bool) -> Result<(), Error> {
        self.buckets.clear();
        self.resolved.clear();

        match self.strategy {
            DeepFetchStrategy::SimpleToOne | DeepFetchStrategy::SimpleToMany => {
                let outcome = resolve_hop(
                    self.resolver,
                    &self.mapper,
                    &self.parents,
                    allow_db,
                )?;
                self.buckets = outcome.buckets;
                self.resolved = outcome.resolved;
                self.round_trips += outcome.round_trips;
            }
            DeepFetchStrategy::Chained => self.run_chained(allow_db)?,
        }
        Ok(())
    }

    /// Resolve hop by hop: each step's output list becomes the next
    /// step's parent list, and the final frontier is folded back onto the
    /// original parents.
    fn run_chained(&mut self, allow_db: bool) -> Result<(), Error> {
        let hops = self.mapper.hops();

        let mut frontier: HashMap<RowId, Vec<Arc<Row>>> = self
            .parents
            .iter()
            .map(|p| (p.id(), vec![Arc::clone(p)]))
            .collect();
        let mut alive: HashSet<RowId> = self.parents.iter().map(|p| p.id()).collect();

        for hop in &hops {
            let mut hop_parents: Vec<Arc<Row>> = Vec::new();
            let mut seen: HashSet<RowId> = HashSet::new();
            for parent in &self.parents {
                if !alive.contains(&parent.id()) {
                    continue;
                }
                for row in &frontier[&parent.id()] {
                    if seen.insert(row.id()) {
                        hop_parents.push(Arc::clone(row));
                    }
                }
            }
            if hop_parents.is_empty() {
                break;
            }

            let outcome = resolve_hop(self.resolver, hop, &hop_parents, allow_db)?;
            self.round_trips += outcome.round_trips;

            for parent in &self.parents {
                if !alive.contains(&parent.id()) {
                    continue;
                }
                let current = frontier.remove(&parent.id()).unwrap_or_default();
                // A parent survives the hop only if every frontier row
                // resolved; otherwise it stays unresolved for this pass.
                if !current.iter().all(|row| outcome.resolved.contains(&row.id())) {
                    alive.remove(&parent.id());
                    frontier.insert(parent.id(), Vec::new());
                    continue;
                }
                let mut next = Vec::new();
                let mut next_seen: HashSet<RowId> = HashSet::new();
                for row in &current {
                    if let Some(children) = outcome.buckets.get(&row.id()) {
                        for child in children {
                            if next_seen.insert(child.id()) {
                                next.push(Arc::clone(child));
                            }
                        }
                    }
                }
                frontier.insert(parent.id(), next);
            }
        }

        for parent in &self.parents {
            if alive.contains(&parent.id()) {
                self.resolved.insert(parent.id());
                self.buckets.insert(
                    parent.id(),
                    frontier.remove(&parent.id()).unwrap_or_default(),
                );
            }
        }
        Ok(())
    }
}

struct KeyGroup {
    predicate: Predicate,
    parents: Vec<RowId>,
}

/// Resolve one single-hop relationship for a parent batch.
fn resolve_hop(
    resolver: &Resolver,
    mapper: &Mapper,
    parents: &[Arc<Row>],
    allow_db: bool,
) -> Result<HopOutcome, Error> {
    let ctx = resolver.eval_context();
    let pairs = mapper.join_pairs();
    let left_attrs: Vec<Attribute> = pairs.iter().map(|(l, _)| l.clone()).collect();
    let right_attrs: Vec<Attribute> = pairs.iter().map(|(_, r)| r.clone()).collect();

    let mut outcome = HopOutcome {
        buckets: HashMap::new(),
        resolved: HashSet::new(),
        round_trips: 0,
    };

    // Derive one predicate per distinct join key; parents sharing a key
    // share the resolution.
    let mut groups: HashMap<Vec<Value>, KeyGroup> = HashMap::new();
    for parent in parents {
        match key_of(&left_attrs, parent) {
            Some(key) => match groups.entry(key) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().parents.push(parent.id());
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    // A null join value was filtered by key_of, so the
                    // derived predicate always exists here.
                    let predicate = mapper
                        .child_predicate(parent)
                        .expect("non-null join key derives a predicate");
                    entry.insert(KeyGroup {
                        predicate,
                        parents: vec![parent.id()],
                    });
                }
            },
            None => {
                // No related row can exist for a null join value.
                outcome.buckets.insert(parent.id(), Vec::new());
                outcome.resolved.insert(parent.id());
            }
        }
    }

    // Phase 1: full in-memory resolution per derived predicate. Large
    // batches probe on the worker pool, joined before anything proceeds.
    let ordered: Vec<(&Vec<Value>, &KeyGroup)> = groups.iter().collect();
    let probes: Vec<Option<Vec<Arc<Row>>>> = match ctx.pool() {
        Some(pool) if ordered.len() > resolver.config().parallel_deep_fetch_threshold => {
            pool.install(|| {
                use rayon::prelude::*;
                ordered
                    .par_iter()
                    .map(|(_, group)| resolve_in_memory(resolver, &ctx, &group.predicate))
                    .collect()
            })
        }
        _ => ordered
            .iter()
            .map(|(_, group)| resolve_in_memory(resolver, &ctx, &group.predicate))
            .collect(),
    };

    let mut unresolved: Vec<Vec<Value>> = Vec::new();
    for ((key, group), probe) in ordered.into_iter().zip(probes) {
        match probe {
            Some(rows) => bucket_group(mapper, group, rows, &mut outcome),
            None => unresolved.push(key.clone()),
        }
    }

    if unresolved.is_empty() || !allow_db {
        return Ok(outcome);
    }

    // Phase 2: one batched round trip for the entire unresolved subset.
    let batch = batch_predicate(resolver, mapper, &right_attrs, &unresolved, &groups);
    let db_rows = resolver.database().execute(&batch)?;
    outcome.round_trips = 1;

    // Redistribute result rows into per-key buckets; rows outside the
    // requested key set are a tolerated race, not a failure.
    let requested: HashSet<&Vec<Value>> = unresolved.iter().collect();
    let mut by_key: HashMap<Vec<Value>, Vec<Arc<Row>>> = HashMap::new();
    let mut excess = 0usize;
    for row in db_rows {
        match key_of(&right_attrs, &row) {
            Some(key) if requested.contains(&key) => {
                by_key.entry(key).or_default().push(row);
            }
            _ => excess += 1,
        }
    }
    if excess > 0 {
        warn!(
            excess,
            entity = %mapper.to(),
            "deep fetch returned more rows than parents requested; dropping excess"
        );
    }

    let mut batch_rows: Vec<Arc<Row>> = Vec::new();
    for key in &unresolved {
        let group = &groups[key];
        let rows = by_key.remove(key).unwrap_or_default();
        batch_rows.extend(rows.iter().cloned());
        resolver.query_cache().insert(
            &group.predicate,
            shared_row_list(rows.clone()),
            resolver.cache(),
        );
        bucket_group(mapper, group, rows, &mut outcome);
    }
    resolver
        .query_cache()
        .insert(&batch, shared_row_list(batch_rows), resolver.cache());

    Ok(outcome)
}

/// Shape-match cache, then full cache, then provable partial-cache probe.
fn resolve_in_memory(
    resolver: &Resolver,
    ctx: &EvalContext<'_>,
    predicate: &Predicate,
) -> Option<Vec<Arc<Row>>> {
    if let Some(rows) = resolver.query_cache().lookup(predicate, ctx) {
        return Some(rows.iter().cloned().collect());
    }
    let rows = predicate
        .apply_to_full_cache(ctx)
        .or_else(|| predicate.apply_to_partial_cache(ctx))?;
    resolver.query_cache().insert(
        predicate,
        shared_row_list(rows.clone()),
        resolver.cache(),
    );
    Some(rows)
}

fn bucket_group(
    mapper: &Mapper,
    group: &KeyGroup,
    mut rows: Vec<Arc<Row>>,
    outcome: &mut HopOutcome,
) {
    if !mapper.is_to_many() && rows.len() > 1 {
        warn!(
            extra = rows.len() - 1,
            entity = %mapper.to(),
            "to-one deep fetch matched multiple rows for one key; dropping extras"
        );
        rows.truncate(1);
    }
    for parent in &group.parents {
        outcome.buckets.insert(*parent, rows.clone());
        outcome.resolved.insert(*parent);
    }
}

/// One predicate covering every unresolved key: a simplified join
/// predicate (OR of the per-key predicates) below the configured
/// threshold, a bulk IN / tuple-IN above it.
fn batch_predicate(
    resolver: &Resolver,
    mapper: &Mapper,
    right_attrs: &[Attribute],
    unresolved: &[Vec<Value>],
    groups: &HashMap<Vec<Value>, KeyGroup>,
) -> Predicate {
    let threshold = resolver.config().simplified_in_threshold;
    if unresolved.len() < threshold {
        let operands: Vec<Predicate> = unresolved
            .iter()
            .map(|key| groups[key].predicate.clone())
            .collect();
        return Predicate::or_many(operands);
    }

    let base = if right_attrs.len() == 1 {
        Predicate::is_in(
            right_attrs[0].clone(),
            unresolved.iter().map(|key| key[0].clone()),
        )
    } else {
        Predicate::tuple_in(right_attrs.to_vec(), unresolved.to_vec())
    };
    match mapper.right_filter() {
        Some(filter) => base.and(filter),
        None => base,
    }
}

fn key_of(attrs: &[Attribute], row: &Row) -> Option<Vec<Value>> {
    let mut key = Vec::with_capacity(attrs.len());
    for attr in attrs {
        match attr.value_in(row) {
            Some(v) if !v.is_null() => key.push(v.clone()),
            _ => return None,
        }
    }
    Some(key)
}

//! Deterministic access-path ranking.
//!
//! Candidate access paths are ordered by a fixed comparator so the chosen
//! plan is deterministic and explainable. Lower ranks resolve first: a
//! temporal (as-of) qualification must pin the row slice before anything
//! else applies, then index-driven paths beat scans. Ties fall through
//! estimated cardinalities, a structural difficulty score, and finally a
//! stable shape-hash so the order is total.

use std::cmp::Ordering;

use crate::predicate::{shape_hash, EvalContext, IndexStrength, Predicate};

/// Base score before qualifications subtract.
const BASE_SCORE: i32 = 100;
/// Subtracted for a temporal (as-of) qualification.
const AS_OF_BONUS: i32 = 50;
/// Subtracted for unique-index usage.
const UNIQUE_INDEX_BONUS: i32 = 20;
/// Subtracted for non-unique-index usage.
const NON_UNIQUE_INDEX_BONUS: i32 = 10;

/// Score one access path; lower resolves first.
pub fn access_path_score(predicate: &Predicate, ctx: &EvalContext<'_>) -> i32 {
    let mut score = BASE_SCORE;
    if predicate.has_as_of() {
        score -= AS_OF_BONUS;
    }
    match predicate.index_strength(ctx) {
        IndexStrength::Unique | IndexStrength::UniqueImmutable => {
            score -= UNIQUE_INDEX_BONUS;
        }
        IndexStrength::NonUnique => score -= NON_UNIQUE_INDEX_BONUS,
        IndexStrength::None => {}
    }
    score
}

/// Structural difficulty: 10 points per relationship hop nested beneath a
/// mapped wrapper, 10 more when the hop joins on multiple attributes.
pub fn difficulty(predicate: &Predicate) -> u32 {
    match predicate {
        Predicate::Mapped(mp) | Predicate::NotExists(mp) => {
            let mut points = 0;
            for hop in mp.mapper.hops() {
                points += 10;
                if hop.is_multi_attribute() {
                    points += 10;
                }
            }
            points + difficulty(&mp.inner)
        }
        Predicate::And(children) | Predicate::Or(children) => {
            children.iter().map(difficulty).sum()
        }
        _ => 0,
    }
}

/// Total order over candidate access paths. `Ordering::Less` means `a`
/// is the preferred path.
pub fn compare_access_paths(
    a: &Predicate,
    b: &Predicate,
    ctx: &EvalContext<'_>,
) -> Ordering {
    let by_score = access_path_score(a, ctx).cmp(&access_path_score(b, ctx));
    if by_score != Ordering::Equal {
        return by_score;
    }

    // Cardinality ties only apply when both sides can be estimated.
    if a.is_estimatable(ctx) && b.is_estimatable(ctx) {
        let by_max = a
            .estimate_max_return_size(ctx)
            .cmp(&b.estimate_max_return_size(ctx));
        if by_max != Ordering::Equal {
            return by_max;
        }
        let by_avg = a.estimate_return_size(ctx).cmp(&b.estimate_return_size(ctx));
        if by_avg != Ordering::Equal {
            return by_avg;
        }
    }

    let by_difficulty = difficulty(a).cmp(&difficulty(b));
    if by_difficulty != Ordering::Equal {
        return by_difficulty;
    }

    shape_hash(a).cmp(&shape_hash(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::mapper::{Cardinality, Mapper};
    use crate::resolver::IndexRegistry;
    use crate::source::IndexInfo;
    use crate::test_support::MemoryCache;
    use relq_model::{EntityType, Value};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryCache>, EntityType) {
        let customer = EntityType::new("Customer");
        let cache = MemoryCache::new();
        cache.define_index(vec![customer.attribute("id")], IndexInfo::unique());
        cache.define_index(
            vec![customer.attribute("region")],
            IndexInfo::non_unique(10),
        );
        for i in 0..50i64 {
            cache.insert_row(
                &customer,
                i as u64,
                vec![
                    ("id".into(), Value::Int64(i)),
                    ("region".into(), Value::String(format!("R{}", i % 5))),
                ],
            );
        }
        cache.set_fully_cached(&customer);
        (Arc::new(cache), customer)
    }

    #[test]
    fn test_score_favors_unique_index() {
        let (cache, customer) = setup();
        let registry = IndexRegistry::new(cache);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        let unique = Predicate::equals(customer.attribute("id"), 1i64);
        let non_unique = Predicate::equals(customer.attribute("region"), "R1");
        let scan = Predicate::equals(customer.attribute("name"), "x");

        assert_eq!(access_path_score(&unique, &ctx), 80);
        assert_eq!(access_path_score(&non_unique, &ctx), 90);
        assert_eq!(access_path_score(&scan, &ctx), 100);
    }

    #[test]
    fn test_as_of_ranks_first() {
        let (cache, customer) = setup();
        let registry = IndexRegistry::new(cache);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        let temporal = Predicate::equals(
            customer.as_of_attribute("businessDate"),
            Value::Timestamp(100),
        );
        let unique = Predicate::equals(customer.attribute("id"), 1i64);

        assert_eq!(access_path_score(&temporal, &ctx), 50);
        assert_eq!(
            compare_access_paths(&temporal, &unique, &ctx),
            Ordering::Less
        );
    }

    #[test]
    fn test_difficulty_counts_hops() {
        let order = EntityType::new("Order");
        let customer = EntityType::new("Customer");
        let mapper = Mapper::anonymous_join(
            vec![(order.attribute("customerId"), customer.attribute("id"))],
            Cardinality::ToOne,
        );
        let plain = Predicate::equals(order.attribute("status"), "open");
        let mapped = Predicate::exists(
            mapper,
            Predicate::equals(customer.attribute("name"), "Alice"),
        );

        assert_eq!(difficulty(&plain), 0);
        assert_eq!(difficulty(&mapped), 10);
    }

    #[test]
    fn test_difficulty_multi_attribute_hop() {
        let order = EntityType::new("Order");
        let item = EntityType::new("OrderItem");
        let mapper = Mapper::anonymous_join(
            vec![
                (order.attribute("id"), item.attribute("orderId")),
                (order.attribute("version"), item.attribute("orderVersion")),
            ],
            Cardinality::ToMany,
        );
        let mapped = Predicate::exists(
            mapper,
            Predicate::equals(item.attribute("sku"), "X"),
        );
        assert_eq!(difficulty(&mapped), 20);
    }

    #[test]
    fn test_total_order_is_deterministic() {
        let (cache, customer) = setup();
        let registry = IndexRegistry::new(cache);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        // Same score and no estimates distinguish these; the shape hash
        // must still give one stable answer.
        let a = Predicate::equals(customer.attribute("name"), "a");
        let b = Predicate::equals(customer.attribute("email"), "b");

        let first = compare_access_paths(&a, &b, &ctx);
        let second = compare_access_paths(&a, &b, &ctx);
        assert_eq!(first, second);
        assert_eq!(compare_access_paths(&b, &a, &ctx), first.reverse());
    }

    #[test]
    fn test_cardinality_breaks_score_ties() {
        let (cache, customer) = setup();
        let registry = IndexRegistry::new(cache);
        let config = ResolverConfig::default();
        let ctx = EvalContext::new(&registry, &config);

        let one = Predicate::equals(customer.attribute("id"), 1i64);
        let three = Predicate::is_in(customer.attribute("id"), vec![1i64, 2, 3]);

        // Both unique-index paths, but the single-row lookup is smaller.
        assert_eq!(compare_access_paths(&one, &three, &ctx), Ordering::Less);
    }
}

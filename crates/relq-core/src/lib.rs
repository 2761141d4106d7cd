//! Relq core - predicate algebra, mapper composition, and cache-aware
//! query resolution.
//!
//! This crate is the predicate-resolution core of an object/relational
//! query engine. Callers build constraint trees through the [`Predicate`]
//! builder API, optionally spanning relationships via [`Mapper`]-wrapped
//! sub-predicates; the [`Resolver`] rewrites the tree through transitive
//! equality propagation, ranks access paths, answers from the cache when it
//! can, and records database results in a shape-keyed query cache for reuse
//! across differing literals. [`DeepFetchNode`] batch-resolves a
//! relationship for a list of parent objects in minimal round trips.

pub mod config;
pub mod deep_fetch;
pub mod error;
pub mod mapper;
pub mod predicate;
pub mod propagate;
pub mod query_cache;
pub mod resolver;
pub mod source;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ResolverConfig;
pub use deep_fetch::{DeepFetchNode, DeepFetchResult, DeepFetchStrategy};
pub use error::Error;
pub use mapper::{Cardinality, Mapper, MapperId, MapperStack};
pub use predicate::{
    shape_hash, shape_match, AtomOp, EvalContext, IndexStrength, Predicate, RangeOp, ShapeMatch,
};
pub use propagate::TransitivePropagator;
pub use query_cache::{QueryCache, QueryCacheStats};
pub use resolver::{IndexReference, IndexRegistry, Resolver};
pub use source::{CacheSource, DatabaseSource, IndexHandle, IndexInfo};

/// Re-export the model types.
pub use relq_model as model;

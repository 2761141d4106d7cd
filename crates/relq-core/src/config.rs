//! Resolver configuration.
//!
//! All tunables thread through [`ResolverConfig`] rather than process-wide
//! statics, so tests and embedding applications can vary them without
//! cross-talk.

/// Tunable limits and thresholds for a [`crate::Resolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Below this many unresolved parents, a deep fetch batches with a
    /// simplified join predicate; at or above it, a bulk IN / tuple-IN
    /// predicate is used instead.
    pub simplified_in_threshold: usize,
    /// Maximum cached-set size considered for shape super-matching.
    /// Above this bound classification degrades to a miss rather than
    /// paying an unbounded set comparison.
    pub super_match_max_set_size: usize,
    /// Lists longer than this are filtered on the worker pool by
    /// partitioning and concatenating in original order.
    pub parallel_filter_threshold: usize,
    /// Deep-fetch batches with more distinct join keys than this probe the
    /// in-memory cache on the worker pool.
    pub parallel_deep_fetch_threshold: usize,
    /// Number of threads in the bounded filter pool. Zero disables
    /// parallel filtering entirely.
    pub filter_workers: usize,
    /// Maximum number of entries retained by the shape-match query cache.
    pub query_cache_capacity: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            simplified_in_threshold: 32,
            super_match_max_set_size: 1024,
            parallel_filter_threshold: 10_000,
            parallel_deep_fetch_threshold: 256,
            filter_workers: 4,
            query_cache_capacity: 1000,
        }
    }
}

impl ResolverConfig {
    /// Set the simplified-IN threshold.
    pub fn with_simplified_in_threshold(mut self, threshold: usize) -> Self {
        self.simplified_in_threshold = threshold;
        self
    }

    /// Set the super-match set-size bound.
    pub fn with_super_match_max_set_size(mut self, size: usize) -> Self {
        self.super_match_max_set_size = size;
        self
    }

    /// Set the parallel filtering threshold.
    pub fn with_parallel_filter_threshold(mut self, threshold: usize) -> Self {
        self.parallel_filter_threshold = threshold;
        self
    }

    /// Set the parallel deep-fetch threshold.
    pub fn with_parallel_deep_fetch_threshold(mut self, threshold: usize) -> Self {
        self.parallel_deep_fetch_threshold = threshold;
        self
    }

    /// Set the filter worker count. Zero disables parallel filtering.
    pub fn with_filter_workers(mut self, workers: usize) -> Self {
        self.filter_workers = workers;
        self
    }

    /// Set the shape-match cache capacity.
    pub fn with_query_cache_capacity(mut self, capacity: usize) -> Self {
        self.query_cache_capacity = capacity;
        self
    }
}

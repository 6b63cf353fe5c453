#![forbid(unsafe_code)]

//! Query planning and batched execution over linked collections.
//!
//! A query specification is parsed once into tagged entries, planned into a
//! tree of fetch nodes, and resolved level by level with one store fetch per
//! node.

/// Plan caching keyed by specification and registry epoch.
pub mod cache;

/// Level-synchronous plan execution.
pub mod executor;

/// Plan trees, explain output and plan hashing.
pub mod planner;

/// Performance profiling for query and cascade operations.
///
/// Collects timing and count statistics to identify performance bottlenecks.
pub mod profile;

/// Parsing of nested query specifications.
pub mod spec;

pub use cache::{PlanCache, PlanCacheStats};
pub use executor::{
    BatchExecutor, CardinalityViolation, ExecutionReport, ExecutorOptions, QueryResult,
};
pub use planner::{ExplainNode, ExplainProp, PlanExplain, Planner, QueryNode, QueryPlan};
pub use spec::{QuerySpec, SpecEntry};

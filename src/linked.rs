#![forbid(unsafe_code)]

//! Store facade tying planning, execution and cascades together.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::{ConfigError, LinkConfig};
use crate::consistency::{CascadeReport, ConsistencyManager};
use crate::links::{LinkMutator, LinkRegistry};
use crate::query::spec::OPTIONS_KEY;
use crate::query::{
    BatchExecutor, ExecutorOptions, PlanCache, PlanCacheStats, Planner, QueryResult,
};
use crate::store::{DocumentStore, Filter};
use crate::types::{Document, Result};

/// A document store paired with its link graph.
///
/// Queries go through the plan cache and the batch executor; removals go
/// through the consistency manager so link storage never points at deleted
/// documents.
pub struct LinkedStore<S> {
    store: S,
    planner: Planner,
    executor: BatchExecutor,
    cache: PlanCache,
    consistency: ConsistencyManager,
}

impl<S: DocumentStore> LinkedStore<S> {
    /// Wraps `store` with default executor settings.
    pub fn new(store: S, registry: Arc<LinkRegistry>) -> Self {
        Self {
            store,
            planner: Planner::new(Arc::clone(&registry)),
            executor: BatchExecutor::default(),
            cache: PlanCache::default(),
            consistency: ConsistencyManager::new(registry),
        }
    }

    /// Wraps `store` with the links and executor settings of `config`.
    pub fn from_config(store: S, config: &LinkConfig) -> std::result::Result<Self, ConfigError> {
        let registry = config.build_registry()?;
        Ok(Self {
            executor: BatchExecutor::new(config.executor_options()),
            cache: PlanCache::new(config.executor.plan_cache_capacity),
            ..Self::new(store, registry)
        })
    }

    /// Replaces the executor options.
    pub fn with_executor_options(mut self, options: ExecutorOptions) -> Self {
        self.executor = BatchExecutor::new(options);
        self
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Link graph in use.
    pub fn registry(&self) -> &Arc<LinkRegistry> {
        self.planner.registry()
    }

    /// Resolves `spec` against `collection`.
    pub fn query(&self, collection: &str, spec: &Value) -> Result<QueryResult> {
        self.query_with_cancel(collection, spec, None)
    }

    /// Resolves `spec`, giving up between levels once `cancel` is set.
    pub fn query_with_cancel(
        &self,
        collection: &str,
        spec: &Value,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<QueryResult> {
        let plan = self.cache.get_or_plan(&self.planner, collection, spec)?;
        self.executor.execute(&self.store, &plan, cancel)
    }

    /// First root document of `spec`, fetched with a root limit of one.
    pub fn query_one(&self, collection: &str, spec: &Value) -> Result<Option<Document>> {
        let mut spec = spec.clone();
        if let Value::Object(map) = &mut spec {
            let options = map
                .entry(OPTIONS_KEY)
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(options) = options {
                options.insert("limit".to_owned(), Value::from(1));
            }
        }
        Ok(self.query(collection, &spec)?.documents.into_iter().next())
    }

    /// Textual plan for `spec`.
    pub fn explain(&self, collection: &str, spec: &Value) -> Result<String> {
        let plan = self.cache.get_or_plan(&self.planner, collection, spec)?;
        Ok(plan.explain.to_string())
    }

    /// Deletes matching documents and cascades through dependent links.
    pub fn remove(&self, collection: &str, filter: &Filter) -> Result<CascadeReport> {
        let report = self.consistency.remove(&self.store, collection, filter)?;
        debug!(collection, removed = report.removed, "linked.remove");
        Ok(report)
    }

    /// Cascades for documents already deleted elsewhere.
    pub fn after_delete(&self, collection: &str, removed: &[Document]) -> Result<CascadeReport> {
        self.consistency.after_delete(&self.store, collection, removed)
    }

    /// Link writer over this store.
    pub fn link(&self) -> LinkMutator<'_, S> {
        LinkMutator::new(self.planner.registry(), &self.store)
    }

    /// Plan cache counters.
    pub fn plan_cache_stats(&self) -> PlanCacheStats {
        self.cache.stats()
    }
}

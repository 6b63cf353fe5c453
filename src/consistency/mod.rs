#![forbid(unsafe_code)]

//! Referential cleanup after document removal.
//!
//! Removal is handled in two phases. [`ConsistencyManager::plan_removal`]
//! walks the dependent-link index and produces a [`CascadePlan`];
//! [`ConsistencyManager::apply`] replays it against the store. Every step is
//! idempotent, so a plan interrupted by a store failure can simply be applied
//! again.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::links::LinkRegistry;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::store::{DocumentStore, Filter, FindOptions, Projection};
use crate::types::{Document, Result, ID_FIELD};

mod plan;

pub use plan::{CascadeOp, CascadePlan, CascadeStep};

/// Outcome of applying a cascade.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CascadeReport {
    /// Documents removed by the caller's delete.
    pub removed: u64,
    /// Steps replayed.
    pub steps: usize,
    /// Documents whose storage fields changed.
    pub pruned: u64,
    /// Documents deleted by the cascade.
    pub deleted: u64,
    /// Wall time spent applying, in milliseconds.
    pub duration_ms: f64,
}

/// Keeps link storage consistent when documents go away.
#[derive(Clone, Debug)]
pub struct ConsistencyManager {
    registry: Arc<LinkRegistry>,
}

impl ConsistencyManager {
    /// Creates a manager over `registry`.
    pub fn new(registry: Arc<LinkRegistry>) -> Self {
        Self { registry }
    }

    /// Computes the cascade triggered by removing `removed` from `collection`.
    pub fn plan_removal<S>(
        &self,
        store: &S,
        collection: &str,
        removed: &[Document],
    ) -> Result<CascadePlan>
    where
        S: DocumentStore + ?Sized,
    {
        plan::build_plan(store, &self.registry, collection, removed)
    }

    /// Replays `plan` in order, stopping at the first store failure.
    pub fn apply<S>(&self, store: &S, plan: &CascadePlan) -> Result<CascadeReport>
    where
        S: DocumentStore + ?Sized,
    {
        let timer = profile_timer();
        let started = Instant::now();
        let mut report = CascadeReport::default();
        for step in &plan.steps {
            let affected = match &step.op {
                CascadeOp::Prune(mutation) => {
                    let changed = store.update_many(&step.collection, &step.filter, mutation)?;
                    report.pruned += changed;
                    changed
                }
                CascadeOp::Delete => {
                    let deleted = store.delete_many(&step.collection, &step.filter)?;
                    report.deleted += deleted;
                    deleted
                }
            };
            report.steps += 1;
            debug!(step = %step, affected, "cascade.step.applied");
        }
        report.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        record_profile_timer(QueryProfileKind::CascadeApply, timer);
        Ok(report)
    }

    /// Cleans up after documents the caller already deleted.
    pub fn after_delete<S>(
        &self,
        store: &S,
        collection: &str,
        removed: &[Document],
    ) -> Result<CascadeReport>
    where
        S: DocumentStore + ?Sized,
    {
        let plan = self.plan_removal(store, collection, removed)?;
        let mut report = self.apply(store, &plan)?;
        report.removed = removed.len() as u64;
        if !plan.is_empty() {
            info!(
                collection,
                removed = report.removed,
                pruned = report.pruned,
                deleted = report.deleted,
                "cascade.completed"
            );
        }
        Ok(report)
    }

    /// Deletes every document of `collection` matching `filter` and cascades.
    ///
    /// The matching documents are read in full first so their storage fields
    /// are still available to the cascade once they are gone. The delete then
    /// targets exactly the snapshot ids, so a document that starts matching
    /// `filter` in between is left alone rather than deleted uncascaded.
    pub fn remove<S>(&self, store: &S, collection: &str, filter: &Filter) -> Result<CascadeReport>
    where
        S: DocumentStore + ?Sized,
    {
        let snapshot = store.find_many(
            collection,
            filter,
            &Projection::All,
            &FindOptions::default(),
        )?;
        if snapshot.is_empty() {
            return Ok(CascadeReport::default());
        }
        let ids: Vec<Value> = snapshot
            .iter()
            .filter_map(|doc| doc.get(ID_FIELD).cloned())
            .collect();
        let deleted = store.delete_many(collection, &Filter::in_values(ID_FIELD, ids))?;
        let mut report = self.after_delete(store, collection, &snapshot)?;
        report.removed = deleted;
        Ok(report)
    }
}

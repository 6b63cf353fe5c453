#![forbid(unsafe_code)]

//! Cascade planning: the dependent-link walk behind
//! [`ConsistencyManager::plan_removal`](super::ConsistencyManager::plan_removal).

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::debug;

use crate::links::keys::referenced_ids;
use crate::links::{Cardinality, DependentLink, DependentSide, LinkRegistry};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::store::{DocumentStore, Filter, FindOptions, Mutation, Projection};
use crate::types::{DocKey, Document, Result, ID_FIELD};

/// What a cascade step does to the documents it matches.
#[derive(Clone, Debug, PartialEq)]
pub enum CascadeOp {
    /// Strip the reference to the target from a storage field.
    Prune(Mutation),
    /// Delete the target document.
    Delete,
}

/// One replayable `(collection, operation, target id)` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeStep {
    /// Collection the step writes to.
    pub collection: String,
    /// Operation to run.
    pub op: CascadeOp,
    /// Documents the operation applies to.
    pub filter: Filter,
    /// For prunes, the removed document whose references are stripped; for
    /// deletes, the document deleted.
    pub target: DocKey,
    /// Link the step runs through.
    pub link: String,
}

impl fmt::Display for CascadeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            CascadeOp::Prune(mutation) => write!(
                f,
                "prune {}.{} -> {} via {}",
                self.collection,
                mutation.field(),
                self.target,
                self.link
            ),
            CascadeOp::Delete => {
                write!(f, "delete {}/{} via {}", self.collection, self.target, self.link)
            }
        }
    }
}

/// Ordered cascade for one removal event.
///
/// Built by walking the dependent-link index breadth-first from the removed
/// documents. Each `(collection, id)` enters the walk at most once, so cycles
/// terminate and every cascaded document is deleted exactly once. The plan
/// never contains the removed documents themselves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CascadePlan {
    /// Collection the removal started from.
    pub collection: String,
    /// Steps in application order.
    pub steps: Vec<CascadeStep>,
}

impl CascadePlan {
    /// Whether the removal touches no other document.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Documents the plan deletes, as `(collection, id)`.
    pub fn deletions(&self) -> impl Iterator<Item = (&str, &DocKey)> {
        self.steps
            .iter()
            .filter(|step| step.op == CascadeOp::Delete)
            .map(|step| (step.collection.as_str(), &step.target))
    }

    /// Number of prune steps.
    pub fn prune_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.op, CascadeOp::Prune(_)))
            .count()
    }
}

/// Walks the dependent-link index from `removed` documents of `collection`.
///
/// Autoremove dependents are looked up in the store while planning so the
/// walk can continue through them; prunes need no lookup.
pub(crate) fn build_plan<S>(
    store: &S,
    registry: &LinkRegistry,
    collection: &str,
    removed: &[Document],
) -> Result<CascadePlan>
where
    S: DocumentStore + ?Sized,
{
    let timer = profile_timer();
    let mut visited: FxHashSet<(String, DocKey)> = FxHashSet::default();
    let mut queue: VecDeque<(String, Document)> = VecDeque::new();
    for doc in removed {
        if let Some(key) = DocKey::of(doc) {
            if visited.insert((collection.to_owned(), key)) {
                queue.push_back((collection.to_owned(), doc.clone()));
            }
        }
    }

    let mut plan = CascadePlan {
        collection: collection.to_owned(),
        steps: Vec::new(),
    };
    while let Some((current, doc)) = queue.pop_front() {
        let (Some(id), Some(key)) = (doc.get(ID_FIELD), DocKey::of(&doc)) else {
            continue;
        };
        for dep in registry.dependents_of(&current) {
            let found = match (dep.side, dep.autoremove) {
                (DependentSide::Holder, false) => {
                    plan.steps.push(prune_step(dep, id, &key));
                    continue;
                }
                (DependentSide::Holder, true) => store.find_many(
                    &dep.collection,
                    &Filter::eq(join_path(dep), id.clone()),
                    &Projection::All,
                    &FindOptions::default(),
                )?,
                (DependentSide::Referenced, _) => {
                    let ids: Vec<Value> = doc
                        .get(&dep.storage_field)
                        .map(|stored| referenced_ids(stored).into_iter().cloned().collect())
                        .unwrap_or_default();
                    let pending: Vec<Value> = ids
                        .into_iter()
                        .filter(|id| {
                            DocKey::from_value(id).is_some_and(|k| {
                                !visited.contains(&(dep.collection.clone(), k))
                            })
                        })
                        .collect();
                    if pending.is_empty() {
                        continue;
                    }
                    store.find_many(
                        &dep.collection,
                        &Filter::in_values(ID_FIELD, pending),
                        &Projection::All,
                        &FindOptions::default(),
                    )?
                }
            };
            for dependent in found {
                let dep_key = DocKey::of(&dependent);
                let (Some(dep_id), Some(dep_key)) = (dependent.get(ID_FIELD), dep_key) else {
                    continue;
                };
                if !visited.insert((dep.collection.clone(), dep_key.clone())) {
                    continue;
                }
                plan.steps.push(CascadeStep {
                    collection: dep.collection.clone(),
                    op: CascadeOp::Delete,
                    filter: Filter::eq(ID_FIELD, dep_id.clone()),
                    target: dep_key,
                    link: dep.link.clone(),
                });
                queue.push_back((dep.collection.clone(), dependent));
            }
        }
    }
    record_profile_timer(QueryProfileKind::CascadePlan, timer);
    debug!(
        collection,
        removed = removed.len(),
        steps = plan.steps.len(),
        deletes = plan.deletions().count(),
        "cascade.plan.built"
    );
    Ok(plan)
}

fn join_path(dep: &DependentLink) -> String {
    if dep.metadata {
        format!("{}.{}", dep.storage_field, ID_FIELD)
    } else {
        dep.storage_field.clone()
    }
}

fn prune_step(dep: &DependentLink, id: &Value, key: &DocKey) -> CascadeStep {
    let field = dep.storage_field.clone();
    let mutation = match (dep.storage_cardinality, dep.metadata) {
        (Cardinality::One, _) => Mutation::Unset { field },
        (Cardinality::Many, false) => Mutation::Pull {
            field,
            value: id.clone(),
        },
        (Cardinality::Many, true) => Mutation::PullById {
            field,
            id: id.clone(),
        },
    };
    CascadeStep {
        collection: dep.holder.clone(),
        op: CascadeOp::Prune(mutation),
        filter: Filter::eq(join_path(dep), id.clone()),
        target: key.clone(),
        link: dep.link.clone(),
    }
}

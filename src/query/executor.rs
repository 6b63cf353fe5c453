//! Level-synchronous batch resolution of query plans.
//!
//! Every node of a plan costs exactly one `find_many`, whatever the number of
//! parent documents. Nodes are fetched breadth-first: a level can only be
//! fetched once its parents are in memory, because the parents supply the
//! join keys. Assembly then runs bottom-up over the fetched documents.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::links::keys::{entry_metadata, referenced_ids, referenced_keys};
use crate::links::{Cardinality, LinkSide};
use crate::query::planner::{QueryNode, QueryPlan};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::store::{DocumentStore, Filter, FindOptions, Projection};
use crate::types::{DocKey, Document, LinkError, Result, ID_FIELD, METADATA_FIELD};

/// Executor tuning knobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Issue the fetches of one level on scoped threads.
    pub parallel_level_fetch: bool,
}

/// Several documents matched a link that attaches at most one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardinalityViolation {
    /// Collection of the parent document.
    pub collection: String,
    /// Link being attached.
    pub link: String,
    /// Parent document id.
    pub parent_id: DocKey,
    /// Ids of every matching document, in fetch order.
    pub candidates: Vec<DocKey>,
    /// Id that was attached.
    pub chosen: DocKey,
}

/// What an execution did besides producing documents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Store fetches issued.
    pub fetches: usize,
    /// Levels resolved.
    pub levels: usize,
    /// Data inconsistencies found while attaching `one` links.
    pub violations: Vec<CardinalityViolation>,
}

/// Materialised result returned by [`BatchExecutor::execute`].
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    /// Root documents with their links attached.
    pub documents: Vec<Document>,
    /// Execution diagnostics.
    pub report: ExecutionReport,
}

impl QueryResult {
    /// Converts the documents into JSON values.
    pub fn into_values(self) -> Vec<Value> {
        self.documents.into_iter().map(Value::Object).collect()
    }
}

struct FlatNode<'p> {
    node: &'p QueryNode,
    parent: Option<usize>,
    children: Vec<usize>,
    level: usize,
}

struct FetchRequest<'p> {
    collection: &'p str,
    filter: Filter,
    projection: Projection,
    options: FindOptions,
}

/// Executes [`QueryPlan`]s against a [`DocumentStore`].
#[derive(Clone, Debug, Default)]
pub struct BatchExecutor {
    options: ExecutorOptions,
}

impl BatchExecutor {
    /// Creates an executor with the given options.
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Options in effect.
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Resolves `plan`, checking `cancel` before each level.
    pub fn execute<S>(
        &self,
        store: &S,
        plan: &QueryPlan,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<QueryResult>
    where
        S: DocumentStore + ?Sized,
    {
        let nodes = flatten(&plan.root);
        let depth = nodes.last().map_or(0, |n| n.level + 1);
        let mut fetched: Vec<Vec<Document>> = vec![Vec::new(); nodes.len()];
        let mut report = ExecutionReport::default();

        let mut start = 0;
        for level in 0..depth {
            check_cancel(cancel.as_ref())?;
            let end = start + nodes[start..].iter().take_while(|n| n.level == level).count();
            let requests: Vec<FetchRequest<'_>> = nodes[start..end]
                .iter()
                .map(|flat| fetch_request(flat, &fetched))
                .collect();
            let results = self.fetch_level(store, &requests);
            let mut documents = 0;
            for (offset, result) in results.into_iter().enumerate() {
                let docs = result?;
                documents += docs.len();
                fetched[start + offset] = docs;
            }
            report.fetches += requests.len();
            debug!(level, nodes = requests.len(), documents, "query.level.fetched");
            start = end;
        }
        report.levels = depth;

        let timer = profile_timer();
        let documents = assemble(&nodes, fetched, &mut report.violations);
        record_profile_timer(QueryProfileKind::Assemble, timer);
        Ok(QueryResult { documents, report })
    }

    fn fetch_level<S>(
        &self,
        store: &S,
        requests: &[FetchRequest<'_>],
    ) -> Vec<Result<Vec<Document>>>
    where
        S: DocumentStore + ?Sized,
    {
        if !self.options.parallel_level_fetch || requests.len() < 2 {
            return requests.iter().map(|req| fetch(store, req)).collect();
        }
        std::thread::scope(|scope| {
            let handles: Vec<_> = requests
                .iter()
                .map(|req| scope.spawn(move || fetch(store, req)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    }
}

fn check_cancel(cancel: Option<&Arc<AtomicBool>>) -> Result<()> {
    if let Some(flag) = cancel {
        if flag.load(Ordering::SeqCst) {
            return Err(LinkError::Cancelled);
        }
    }
    Ok(())
}

fn fetch<S>(store: &S, req: &FetchRequest<'_>) -> Result<Vec<Document>>
where
    S: DocumentStore + ?Sized,
{
    let timer = profile_timer();
    let docs = store.find_many(req.collection, &req.filter, &req.projection, &req.options)?;
    record_profile_timer(QueryProfileKind::Fetch, timer);
    Ok(docs)
}

// Breadth-first order: parents always precede their children, and every
// level is a contiguous run.
fn flatten(root: &QueryNode) -> Vec<FlatNode<'_>> {
    let mut nodes = vec![FlatNode {
        node: root,
        parent: None,
        children: Vec::new(),
        level: 0,
    }];
    let mut cursor = 0;
    while cursor < nodes.len() {
        let node = nodes[cursor].node;
        let level = nodes[cursor].level;
        for child in node.children.values() {
            let idx = nodes.len();
            nodes.push(FlatNode {
                node: child,
                parent: Some(cursor),
                children: Vec::new(),
                level: level + 1,
            });
            nodes[cursor].children.push(idx);
        }
        cursor += 1;
    }
    nodes
}

fn fetch_request<'p>(flat: &FlatNode<'p>, fetched: &[Vec<Document>]) -> FetchRequest<'p> {
    let node = flat.node;
    let (Some(parent), Some(link)) = (flat.parent, node.link.as_ref()) else {
        return FetchRequest {
            collection: &node.collection,
            filter: node.filter.clone(),
            projection: node.projection(),
            options: node.options.clone(),
        };
    };
    let parents = &fetched[parent];
    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    let mut push = |value: &Value| {
        if let Some(key) = DocKey::from_value(value) {
            if seen.insert(key) {
                keys.push(value.clone());
            }
        }
    };
    let join = match link.side {
        LinkSide::Direct => {
            for doc in parents {
                if let Some(stored) = doc.get(&link.storage_field) {
                    referenced_ids(stored).into_iter().for_each(&mut push);
                }
            }
            Filter::in_values(ID_FIELD, keys)
        }
        LinkSide::Inverse => {
            for doc in parents {
                if let Some(id) = doc.get(ID_FIELD) {
                    push(id);
                }
            }
            Filter::in_values(link.join_path(), keys)
        }
    };
    FetchRequest {
        collection: &node.collection,
        filter: Filter::and([join, node.filter.clone()]),
        projection: node.projection(),
        options: node.options.sort_only(),
    }
}

// Children always sit after their parent, so walking backwards finalizes
// every child before the parent that embeds it.
fn assemble(
    nodes: &[FlatNode<'_>],
    fetched: Vec<Vec<Document>>,
    violations: &mut Vec<CardinalityViolation>,
) -> Vec<Document> {
    let mut finished: Vec<Vec<Document>> = vec![Vec::new(); nodes.len()];
    for idx in (0..nodes.len()).rev() {
        let flat = &nodes[idx];
        let strip = flat.node.join_only_fields();
        let mut out: Vec<Document> = fetched[idx]
            .iter()
            .map(|doc| {
                let mut doc = doc.clone();
                for field in &strip {
                    doc.remove(field);
                }
                doc
            })
            .collect();
        for &child in &flat.children {
            attach(
                flat,
                &fetched[idx],
                &mut out,
                &nodes[child],
                &fetched[child],
                &finished[child],
                violations,
            );
        }
        finished[idx] = out;
    }
    finished.swap_remove(0)
}

#[allow(clippy::too_many_arguments)]
fn attach(
    parent: &FlatNode<'_>,
    parent_raw: &[Document],
    parent_out: &mut [Document],
    child: &FlatNode<'_>,
    child_raw: &[Document],
    child_out: &[Document],
    violations: &mut Vec<CardinalityViolation>,
) {
    let Some(link) = child.node.link.as_ref() else {
        return;
    };
    let child_keys: Vec<Option<DocKey>> = child_raw.iter().map(DocKey::of).collect();

    // Parent key -> positions of matching child documents, in fetch order.
    let mut by_parent: FxHashMap<DocKey, Vec<usize>> = FxHashMap::default();
    let mut by_id: FxHashMap<&DocKey, usize> = FxHashMap::default();
    match link.side {
        LinkSide::Direct => {
            for (pos, key) in child_keys.iter().enumerate() {
                if let Some(key) = key {
                    by_id.entry(key).or_insert(pos);
                }
            }
        }
        LinkSide::Inverse => {
            for (pos, doc) in child_raw.iter().enumerate() {
                let mut seen = BTreeSet::new();
                for key in referenced_keys(doc, &link.storage_field) {
                    if seen.insert(key.clone()) {
                        by_parent.entry(key).or_default().push(pos);
                    }
                }
            }
        }
    }

    for (raw, out) in parent_raw.iter().zip(parent_out.iter_mut()) {
        let parent_key = DocKey::of(raw);
        let mut matches: Vec<usize> = match link.side {
            LinkSide::Direct => {
                let mut positions: Vec<usize> = referenced_keys(raw, &link.storage_field)
                    .iter()
                    .filter_map(|key| by_id.get(key).copied())
                    .collect();
                positions.sort_unstable();
                positions.dedup();
                positions
            }
            LinkSide::Inverse => parent_key
                .as_ref()
                .and_then(|key| by_parent.get(key))
                .cloned()
                .unwrap_or_default(),
        };

        let render = |pos: usize| -> Value {
            let mut doc = child_out[pos].clone();
            if link.metadata {
                let metadata = match (link.side, &child_keys[pos], &parent_key) {
                    (LinkSide::Direct, Some(child_key), _) => {
                        entry_metadata(raw, &link.storage_field, child_key)
                    }
                    (LinkSide::Inverse, _, Some(parent_key)) => {
                        entry_metadata(&child_raw[pos], &link.storage_field, parent_key)
                    }
                    _ => None,
                };
                doc.insert(
                    METADATA_FIELD.to_owned(),
                    Value::Object(metadata.unwrap_or_default()),
                );
            }
            Value::Object(doc)
        };

        let value = match link.cardinality {
            Cardinality::Many => {
                let options = &child.node.options;
                let skip = options.skip.unwrap_or(0);
                let limit = options.limit.unwrap_or(usize::MAX);
                matches = matches.into_iter().skip(skip).take(limit).collect();
                Value::Array(matches.into_iter().map(render).collect())
            }
            Cardinality::One => match matches.len() {
                0 => Value::Null,
                1 => render(matches[0]),
                _ => {
                    let chosen = pick_smallest(&matches, &child_keys);
                    if let (Some(parent_id), Some(chosen_id)) =
                        (parent_key.clone(), child_keys[chosen].clone())
                    {
                        let candidates: Vec<DocKey> = matches
                            .iter()
                            .filter_map(|&pos| child_keys[pos].clone())
                            .collect();
                        warn!(
                            collection = %parent.node.collection,
                            link = %link.name,
                            parent = %parent_id,
                            matches = candidates.len(),
                            chosen = %chosen_id,
                            "query.cardinality.violation"
                        );
                        violations.push(CardinalityViolation {
                            collection: parent.node.collection.clone(),
                            link: link.name.clone(),
                            parent_id,
                            candidates,
                            chosen: chosen_id,
                        });
                    }
                    render(chosen)
                }
            },
        };
        out.insert(link.name.clone(), value);
    }
}

// Smallest id wins; documents without a usable id lose to any that have one,
// and ties fall back to fetch order.
fn pick_smallest(matches: &[usize], keys: &[Option<DocKey>]) -> usize {
    matches
        .iter()
        .copied()
        .min_by(|&a, &b| match (&keys[a], &keys[b]) {
            (Some(x), Some(y)) => x.cmp(y).then(a.cmp(&b)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(&b),
        })
        .unwrap_or(matches[0])
}

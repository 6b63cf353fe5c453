#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::trace;

use crate::store::value::{sort_documents, values_equal};
use crate::store::{
    DocumentStore, Filter, FindOptions, Mutation, Projection, StoreError, StoreResult,
};
use crate::types::{DocKey, Document, ID_FIELD};

/// Snapshot of the operations a [`MemoryStore`] has served.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    /// `find_many` calls.
    pub find_calls: u64,
    /// `update_many` calls.
    pub update_calls: u64,
    /// `delete_many` calls.
    pub delete_calls: u64,
    /// Documents returned across all finds.
    pub documents_returned: u64,
    /// Documents removed across all deletes.
    pub documents_deleted: u64,
}

impl StoreMetrics {
    /// Total round trips of any kind.
    pub fn round_trips(&self) -> u64 {
        self.find_calls + self.update_calls + self.delete_calls
    }
}

#[derive(Default)]
struct Counters {
    find_calls: AtomicU64,
    update_calls: AtomicU64,
    delete_calls: AtomicU64,
    documents_returned: AtomicU64,
    documents_deleted: AtomicU64,
}

/// Store operation kinds, used to target injected failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    /// `find_many`.
    Find,
    /// `update_many`.
    Update,
    /// `delete_many`.
    Delete,
}

/// Insertion-ordered in-process document store.
///
/// Collections spring into existence on first insert. Reads return documents
/// in insertion order unless a sort is requested.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
    counters: Counters,
    find_log: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<(StoreOp, StoreError)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document. The document must be an object carrying `_id`;
    /// an existing document with the same id is replaced.
    pub fn insert(&self, collection: &str, doc: Value) -> StoreResult<DocKey> {
        let Value::Object(doc) = doc else {
            return Err(StoreError::Backend("documents must be JSON objects".into()));
        };
        let key = DocKey::of(&doc)
            .ok_or_else(|| StoreError::Backend(format!("document in '{collection}' lacks _id")))?;
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_owned()).or_default();
        match docs.iter_mut().find(|d| DocKey::of(d).as_ref() == Some(&key)) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(key)
    }

    /// Inserts several documents into one collection.
    pub fn insert_all<I>(&self, collection: &str, docs: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = Value>,
    {
        for doc in docs {
            self.insert(collection, doc)?;
        }
        Ok(())
    }

    /// Looks a document up by id without touching the metrics.
    pub fn get(&self, collection: &str, id: impl Into<Value>) -> Option<Document> {
        let key = DocKey::from_value(&id.into())?;
        self.collections
            .read()
            .get(collection)?
            .iter()
            .find(|d| DocKey::of(d).as_ref() == Some(&key))
            .cloned()
    }

    /// Every document of a collection, in insertion order.
    pub fn all(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, Vec::len)
    }

    /// Returns a snapshot of the operation counters.
    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            find_calls: self.counters.find_calls.load(Ordering::Relaxed),
            update_calls: self.counters.update_calls.load(Ordering::Relaxed),
            delete_calls: self.counters.delete_calls.load(Ordering::Relaxed),
            documents_returned: self.counters.documents_returned.load(Ordering::Relaxed),
            documents_deleted: self.counters.documents_deleted.load(Ordering::Relaxed),
        }
    }

    /// Collections targeted by `find_many`, in call order.
    pub fn find_log(&self) -> Vec<String> {
        self.find_log.lock().clone()
    }

    /// Zeroes the counters and clears the find log.
    pub fn reset_metrics(&self) {
        self.counters.find_calls.store(0, Ordering::Relaxed);
        self.counters.update_calls.store(0, Ordering::Relaxed);
        self.counters.delete_calls.store(0, Ordering::Relaxed);
        self.counters.documents_returned.store(0, Ordering::Relaxed);
        self.counters.documents_deleted.store(0, Ordering::Relaxed);
        self.find_log.lock().clear();
    }

    /// Makes the next operation of kind `op` fail with `err`.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.failures.lock().push_back((op, err));
    }

    fn take_failure(&self, op: StoreOp) -> StoreResult<()> {
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|(kind, _)| *kind == op) {
            if let Some((_, err)) = failures.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        projection: &Projection,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        self.counters.find_calls.fetch_add(1, Ordering::Relaxed);
        self.find_log.lock().push(collection.to_owned());
        self.take_failure(StoreOp::Find)?;

        let mut matched: Vec<Document> = {
            let collections = self.collections.read();
            collections
                .get(collection)
                .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
                .unwrap_or_default()
        };
        sort_documents(&mut matched, &options.sort);
        let skip = options.skip.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        let out: Vec<Document> = matched
            .iter()
            .skip(skip)
            .take(limit)
            .map(|d| projection.apply(d))
            .collect();
        self.counters
            .documents_returned
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        trace!(collection, returned = out.len(), "memory_store.find");
        Ok(out)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
    ) -> StoreResult<u64> {
        self.counters.update_calls.fetch_add(1, Ordering::Relaxed);
        self.take_failure(StoreOp::Update)?;

        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut changed = 0;
        for doc in docs.iter_mut().filter(|d| filter.matches(d)) {
            if apply_mutation(doc, mutation) {
                changed += 1;
            }
        }
        trace!(collection, changed, field = mutation.field(), "memory_store.update");
        Ok(changed)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.counters.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.take_failure(StoreOp::Delete)?;

        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(d));
        let removed = (before - docs.len()) as u64;
        self.counters
            .documents_deleted
            .fetch_add(removed, Ordering::Relaxed);
        trace!(collection, removed, "memory_store.delete");
        Ok(removed)
    }
}

fn is_entry_with_id(item: &Value, id: &Value) -> bool {
    item.as_object()
        .and_then(|entry| entry.get(ID_FIELD))
        .is_some_and(|entry_id| values_equal(entry_id, id))
}

/// Applies a mutation in place; returns whether the document changed.
pub(crate) fn apply_mutation(doc: &mut Document, mutation: &Mutation) -> bool {
    match mutation {
        Mutation::Set { field, value } => {
            if doc.get(field) == Some(value) {
                return false;
            }
            doc.insert(field.clone(), value.clone());
            true
        }
        Mutation::Unset { field } => doc.remove(field).is_some(),
        Mutation::AddToSet { field, value } => match doc.get_mut(field) {
            Some(Value::Array(items)) => {
                if items.iter().any(|item| values_equal(item, value)) {
                    false
                } else {
                    items.push(value.clone());
                    true
                }
            }
            Some(Value::Null) | None => {
                doc.insert(field.clone(), Value::Array(vec![value.clone()]));
                true
            }
            Some(other) => {
                if values_equal(other, value) {
                    *other = Value::Array(vec![value.clone()]);
                } else {
                    let previous = other.take();
                    *other = Value::Array(vec![previous, value.clone()]);
                }
                true
            }
        },
        Mutation::Pull { field, value } => match doc.get_mut(field) {
            Some(Value::Array(items)) => {
                let before = items.len();
                items.retain(|item| !values_equal(item, value));
                items.len() != before
            }
            _ => false,
        },
        Mutation::PullById { field, id } => match doc.get_mut(field) {
            Some(Value::Array(items)) => {
                let before = items.len();
                items.retain(|item| !is_entry_with_id(item, id));
                items.len() != before
            }
            _ => false,
        },
    }
}

#![forbid(unsafe_code)]

//! Document store contract consumed by the planner, executor and
//! consistency layers.
//!
//! The storage engine itself lives outside this crate. Everything here is the
//! narrow surface the link engine needs: batched reads, bulk updates with a
//! small mutation vocabulary, and bulk deletes. [`MemoryStore`] is a complete
//! in-process implementation used by tests and embedders without a backend.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Document, ID_FIELD};

/// Filter expressions evaluated by stores.
pub mod filter;
/// In-memory reference store.
pub mod memory;
/// Path lookup and value ordering shared by filters and sorting.
pub mod value;

pub use filter::{CmpOp, Filter};
pub use memory::{MemoryStore, StoreMetrics, StoreOp};
pub use serde_json::Value;

/// Failures reported by a document store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// Any other backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "StoreUnavailable",
            StoreError::Timeout(_) => "StoreTimeout",
            StoreError::Backend(_) => "StoreBackend",
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Top-level fields returned by a fetch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Projection {
    /// Every stored field.
    #[default]
    All,
    /// Only the listed top-level fields. `_id` is always returned.
    Fields(BTreeSet<String>),
}

impl Projection {
    /// Builds a field projection.
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Fields(fields.into_iter().map(Into::into).collect())
    }

    /// Whether `field` survives this projection.
    pub fn includes(&self, field: &str) -> bool {
        match self {
            Projection::All => true,
            Projection::Fields(fields) => field == ID_FIELD || fields.contains(field),
        }
    }

    /// Applies the projection to a stored document.
    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Projection::All => doc.clone(),
            Projection::Fields(_) => doc
                .iter()
                .filter(|(key, _)| self.includes(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Single sort key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

/// Sort, skip and limit applied to a fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FindOptions {
    /// Sort keys, most significant first.
    pub sort: Vec<SortKey>,
    /// Documents skipped after sorting.
    pub skip: Option<usize>,
    /// Maximum documents returned after skipping.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Keeps only the sort keys; used when skip/limit apply per parent instead.
    pub fn sort_only(&self) -> Self {
        Self {
            sort: self.sort.clone(),
            skip: None,
            limit: None,
        }
    }

    /// Whether skip or limit is set.
    pub fn is_paginated(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }
}

/// Bulk update applied to every matching document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Overwrite a field.
    Set {
        /// Top-level field name.
        field: String,
        /// New value.
        value: Value,
    },
    /// Remove a field.
    Unset {
        /// Top-level field name.
        field: String,
    },
    /// Append to an array field unless an equal element is present.
    AddToSet {
        /// Top-level field name.
        field: String,
        /// Element to append.
        value: Value,
    },
    /// Remove every array element equal to `value`.
    Pull {
        /// Top-level field name.
        field: String,
        /// Element to remove.
        value: Value,
    },
    /// Remove every array element that is an object whose `_id` equals `id`.
    PullById {
        /// Top-level field name.
        field: String,
        /// Id of the embedded entries to remove.
        id: Value,
    },
}

impl Mutation {
    /// Field the mutation writes to.
    pub fn field(&self) -> &str {
        match self {
            Mutation::Set { field, .. }
            | Mutation::Unset { field }
            | Mutation::AddToSet { field, .. }
            | Mutation::Pull { field, .. }
            | Mutation::PullById { field, .. } => field,
        }
    }
}

/// Batched document store capability consumed by the link engine.
///
/// Implementations must be safe to call from several threads at once: the
/// executor may issue the fetches of one query level concurrently.
pub trait DocumentStore: Send + Sync {
    /// Returns every document of `collection` matching `filter`.
    fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        projection: &Projection,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    /// Applies `mutation` to every matching document and returns how many changed.
    fn update_many(&self, collection: &str, filter: &Filter, mutation: &Mutation)
        -> StoreResult<u64>;

    /// Deletes every matching document and returns how many were removed.
    fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;
}

impl<S: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<S> {
    fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        projection: &Projection,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        (**self).find_many(collection, filter, projection, options)
    }

    fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        mutation: &Mutation,
    ) -> StoreResult<u64> {
        (**self).update_many(collection, filter, mutation)
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        (**self).delete_many(collection, filter)
    }
}

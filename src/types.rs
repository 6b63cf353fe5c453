#![forbid(unsafe_code)]

//! Shared document vocabulary and the crate-wide error type.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::store::StoreError;

/// Field every document carries as its identity.
pub const ID_FIELD: &str = "_id";

/// Key under which metadata-bearing links expose their extra attributes.
pub const METADATA_FIELD: &str = "$metadata";

/// A stored or resolved document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Hashable, totally ordered form of a document id.
///
/// Integers order numerically and strings lexicographically; integers sort
/// before strings. Integral floats key as integers. Anything else (floats, objects) keys on its canonical JSON
/// text so it still participates in joins.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocKey {
    /// Integral id.
    Int(i64),
    /// String id.
    Str(String),
    /// Canonical JSON rendering of any other id shape.
    Other(String),
}

impl DocKey {
    /// Builds a key from an id value. `null` never identifies a document.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(DocKey::Str(s.clone())),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(DocKey::Int(i)),
                // Stores compare `1.0` equal to `1`, so joins must too.
                None => match n.as_f64() {
                    Some(f) if is_integral(f) => Some(DocKey::Int(f as i64)),
                    _ => Some(DocKey::Other(n.to_string())),
                },
            },
            other => Some(DocKey::Other(other.to_string())),
        }
    }

    /// Reads the `_id` of a document.
    pub fn of(doc: &Document) -> Option<Self> {
        doc.get(ID_FIELD).and_then(Self::from_value)
    }
}

fn is_integral(f: f64) -> bool {
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Int(i) => write!(f, "{i}"),
            DocKey::Str(s) => write!(f, "{s}"),
            DocKey::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Errors surfaced by the registry, planner, executor and consistency layers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Malformed link declaration; fatal at startup.
    #[error("invalid link '{name}' on '{collection}': {reason}")]
    InvalidLinkDefinition {
        /// Collection the link is declared on.
        collection: String,
        /// Link name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A query referenced a link the registry cannot resolve.
    #[error("link '{name}' not found on collection '{collection}'")]
    LinkNotFound {
        /// Collection the lookup ran against.
        collection: String,
        /// Requested link name.
        name: String,
    },
    /// The query specification itself is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The caller abandoned the operation between two levels or steps.
    #[error("operation cancelled")]
    Cancelled,
    /// Failure reported by the document store, passed through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LinkError {
    pub(crate) fn invalid_link(
        collection: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LinkError::InvalidLinkDefinition {
            collection: collection.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn link_not_found(collection: impl Into<String>, name: impl Into<String>) -> Self {
        LinkError::LinkNotFound {
            collection: collection.into(),
            name: name.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::InvalidLinkDefinition { .. } => "InvalidLinkDefinition",
            LinkError::LinkNotFound { .. } => "LinkNotFound",
            LinkError::InvalidQuery(_) => "InvalidQuery",
            LinkError::Cancelled => "Cancelled",
            LinkError::Store(err) => err.code(),
        }
    }
}

/// Convenience wrapper that formats link errors with their codes.
pub struct LinkErrorWithCode<'a>(pub &'a LinkError);

impl fmt::Display for LinkErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LinkError>;

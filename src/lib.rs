//! Declarative links between document collections.
//!
//! Collections declare links to each other once, in a [`LinkRegistry`].
//! Queries then name links instead of join conditions and are resolved with
//! one store fetch per query node, and removals cascade through the link
//! graph so no document keeps pointing at something that is gone.
//!
//! ```
//! use linkgraph::links::{Cardinality, LinkDefinition, LinkRegistry};
//! use linkgraph::store::MemoryStore;
//! use linkgraph::LinkedStore;
//! use serde_json::json;
//!
//! let mut registry = LinkRegistry::new();
//! registry
//!     .add_link("posts", "author", LinkDefinition::direct("users", "authorId", Cardinality::One))
//!     .unwrap();
//! let linked = LinkedStore::new(MemoryStore::new(), registry.freeze().unwrap());
//! linked.store().insert("users", json!({"_id": 1, "name": "ada"})).unwrap();
//! linked.store().insert("posts", json!({"_id": 7, "title": "hi", "authorId": 1})).unwrap();
//!
//! let result = linked
//!     .query("posts", &json!({"title": 1, "author": {"name": 1}}))
//!     .unwrap();
//! assert_eq!(result.documents[0]["author"]["name"], "ada");
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod consistency;
pub mod linked;
pub mod links;
pub mod query;
pub mod store;
pub mod types;

pub use config::{ConfigError, LinkConfig};
pub use consistency::{CascadePlan, CascadeReport, ConsistencyManager};
pub use linked::LinkedStore;
pub use links::{Cardinality, LinkDefinition, LinkRegistry};
pub use query::{BatchExecutor, ExecutorOptions, Planner, QueryResult};
pub use store::{DocumentStore, Filter, MemoryStore, StoreError};
pub use types::{DocKey, Document, LinkError, Result};

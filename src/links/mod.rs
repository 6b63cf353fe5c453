#![forbid(unsafe_code)]

//! Declared relationships between collections.
//!
//! Links are declared per source collection, validated as a whole, and then
//! shared read-only. Inverse links are derived from the direct link they
//! mirror, and a dependent-link index tells the consistency layer which
//! collections react when a document is removed.

/// Link declarations and their resolved form.
pub mod definition;
/// Readers for the shapes a storage field can take.
pub mod keys;
/// Writes to link storage fields.
pub mod mutator;
/// The validated relationship graph.
pub mod registry;

pub use definition::{
    derive_inverse, inverse_cardinality, Cardinality, LinkDefinition, LinkSide, ResolvedLink,
};
pub use mutator::LinkMutator;
pub use registry::{DependentLink, DependentSide, IndexAdvice, LinkRegistry};

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::types::{LinkError, Result, ID_FIELD};

/// How many documents a link attaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// A single document (or `null`).
    One,
    /// An ordered sequence of documents.
    #[default]
    Many,
}

/// Which collection physically stores the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkSide {
    /// The source document holds the target id(s).
    Direct,
    /// The target document holds the source id(s).
    Inverse,
}

/// Relationship declared on a source collection.
///
/// Exactly one of `storage_field` and `inverse_of` is set. A direct link keeps
/// the target id (or ids, or id-bearing objects when `metadata` is on) in
/// `storage_field` on the source document. An inverse link names the direct
/// link on `target_collection` whose direction it mirrors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkDefinition {
    /// Related collection.
    pub target_collection: String,
    /// Declared cardinality. Ignored on inverse links, whose cardinality is derived.
    pub cardinality: Cardinality,
    /// Top-level field holding the reference(s).
    pub storage_field: Option<String>,
    /// Name of the mirrored direct link on `target_collection`.
    pub inverse_of: Option<String>,
    /// References are objects carrying `_id` plus extra attributes.
    pub metadata: bool,
    /// At most one source references a given target.
    pub unique: bool,
    /// Removing a document of this collection deletes what it links to.
    pub autoremove: bool,
    /// Index advice for the store's DDL layer.
    pub indexed: bool,
}

impl LinkDefinition {
    /// Direct link stored in `field`.
    pub fn direct(
        target: impl Into<String>,
        field: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            target_collection: target.into(),
            cardinality,
            storage_field: Some(field.into()),
            inverse_of: None,
            metadata: false,
            unique: false,
            autoremove: false,
            indexed: false,
        }
    }

    /// Inverse of the direct link `of` declared on `target`.
    pub fn inverse(target: impl Into<String>, of: impl Into<String>) -> Self {
        Self {
            target_collection: target.into(),
            cardinality: Cardinality::Many,
            storage_field: None,
            inverse_of: Some(of.into()),
            metadata: false,
            unique: false,
            autoremove: false,
            indexed: false,
        }
    }

    /// Marks the references as metadata-bearing objects.
    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    /// Marks a direct `one` link as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Enables cascade deletion from this side.
    pub fn autoremove(mut self) -> Self {
        self.autoremove = true;
        self
    }

    /// Requests an index on the storage field.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Physical side of the link.
    pub fn side(&self) -> LinkSide {
        if self.inverse_of.is_some() {
            LinkSide::Inverse
        } else {
            LinkSide::Direct
        }
    }

    /// Checks the invariants that need no other definition.
    pub(crate) fn check_shape(&self, collection: &str, name: &str) -> Result<()> {
        let invalid = |reason: &str| Err(LinkError::invalid_link(collection, name, reason));
        if name.is_empty() || name.starts_with('$') {
            return invalid("link names must be non-empty and must not start with '$'");
        }
        if self.target_collection.is_empty() {
            return invalid("target collection must be set");
        }
        match (&self.storage_field, &self.inverse_of) {
            (Some(_), Some(_)) => return invalid("storage field and inverse-of are exclusive"),
            (None, None) => return invalid("one of storage field or inverse-of is required"),
            (Some(field), None) => {
                if field.is_empty() || field.contains('.') || field.starts_with('$') {
                    return invalid("storage field must be a plain top-level field name");
                }
                if field == ID_FIELD {
                    return invalid("storage field cannot be _id");
                }
                if self.unique && self.cardinality == Cardinality::Many {
                    return invalid("unique is only valid on a 'one' link");
                }
            }
            (None, Some(of)) => {
                if of.is_empty() {
                    return invalid("inverse-of must name a link");
                }
                if self.unique {
                    return invalid("unique belongs on the direct side of a link");
                }
            }
        }
        Ok(())
    }
}

/// Effective cardinality of the inverse direction of a direct link.
///
/// Only a unique `one` link collapses to a single object when read backwards;
/// everything else reads back as a sequence.
pub fn inverse_cardinality(direct: &LinkDefinition) -> Cardinality {
    collapse(direct.cardinality, direct.unique)
}

fn collapse(direct: Cardinality, unique: bool) -> Cardinality {
    if direct == Cardinality::One && unique {
        Cardinality::One
    } else {
        Cardinality::Many
    }
}

/// A link as seen from one collection, with its effective shape resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLink {
    /// Link name on `collection`.
    pub name: String,
    /// Collection the link is resolved from.
    pub collection: String,
    /// Collection the link attaches documents from.
    pub target: String,
    /// Which side stores the reference.
    pub side: LinkSide,
    /// Effective cardinality when read from `collection`.
    pub cardinality: Cardinality,
    /// Field holding the reference, on the storage collection.
    pub storage_field: String,
    /// Shape of the storage field (the direct link's cardinality).
    pub storage_cardinality: Cardinality,
    /// References carry extra attributes.
    pub metadata: bool,
    /// The direct side is a unique `one` link.
    pub unique: bool,
    /// Removing a `collection` document deletes its linked documents.
    pub autoremove: bool,
    /// Name of the direct link this resolves through (equals `name` when direct).
    pub direct_name: String,
}

impl ResolvedLink {
    /// Resolves a direct definition as declared.
    pub fn direct(collection: &str, name: &str, def: &LinkDefinition) -> Option<Self> {
        let field = def.storage_field.as_ref()?;
        Some(Self {
            name: name.to_owned(),
            collection: collection.to_owned(),
            target: def.target_collection.clone(),
            side: LinkSide::Direct,
            cardinality: def.cardinality,
            storage_field: field.clone(),
            storage_cardinality: def.cardinality,
            metadata: def.metadata,
            unique: def.unique,
            autoremove: def.autoremove,
            direct_name: name.to_owned(),
        })
    }

    /// Collection whose documents hold `storage_field`.
    pub fn storage_collection(&self) -> &str {
        match self.side {
            LinkSide::Direct => &self.collection,
            LinkSide::Inverse => &self.target,
        }
    }

    /// Path matched against target ids when filtering the storage collection.
    pub fn join_path(&self) -> String {
        if self.metadata {
            format!("{}.{}", self.storage_field, ID_FIELD)
        } else {
            self.storage_field.clone()
        }
    }
}

/// Derives the inverse view of a resolved direct link.
///
/// `name` and `autoremove` come from the inverse declaration; everything else
/// is mirrored from the direct side.
pub fn derive_inverse(direct: &ResolvedLink, name: &str, autoremove: bool) -> ResolvedLink {
    let cardinality = collapse(direct.storage_cardinality, direct.unique);
    ResolvedLink {
        name: name.to_owned(),
        collection: direct.target.clone(),
        target: direct.collection.clone(),
        side: LinkSide::Inverse,
        cardinality,
        storage_field: direct.storage_field.clone(),
        storage_cardinality: direct.storage_cardinality,
        metadata: direct.metadata,
        unique: direct.unique,
        autoremove,
        direct_name: direct.direct_name.clone(),
    }
}

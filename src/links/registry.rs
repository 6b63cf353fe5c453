#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::links::definition::{
    derive_inverse, Cardinality, LinkDefinition, LinkSide, ResolvedLink,
};
use crate::types::{LinkError, Result};

/// Which end of a link the affected collection sits on, relative to a
/// removed document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependentSide {
    /// The affected collection stores references to the removed document.
    Holder,
    /// The removed document stored references into the affected collection.
    Referenced,
}

/// Entry of the dependent-link index: a collection whose documents react when
/// a document of the indexed collection is removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependentLink {
    /// Collection whose documents are pruned or deleted.
    pub collection: String,
    /// Direct link the dependency runs through.
    pub link: String,
    /// Collection holding the storage field.
    pub holder: String,
    /// Storage field on `holder`.
    pub storage_field: String,
    /// Shape of the storage field.
    pub storage_cardinality: Cardinality,
    /// Storage entries are metadata objects.
    pub metadata: bool,
    /// Position of `collection` relative to the removed document.
    pub side: DependentSide,
    /// Delete the affected documents instead of pruning references.
    pub autoremove: bool,
}

/// Index advice surfaced to the store's DDL layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexAdvice {
    /// Collection to index.
    pub collection: String,
    /// Field to index.
    pub field: String,
}

#[derive(Debug, Default)]
struct RegistryIndex {
    resolved: FxHashMap<String, FxHashMap<String, ResolvedLink>>,
    broken: FxHashMap<String, FxHashMap<String, String>>,
    dependents: FxHashMap<String, Vec<DependentLink>>,
}

/// Relationship graph between collections.
///
/// Links are registered during start-up, then the registry is validated and
/// shared read-only behind an [`Arc`]. Resolved links (including derived
/// inverses) and the dependent-link index are computed lazily on first use
/// and rebuilt after any further registration.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: BTreeMap<String, BTreeMap<String, LinkDefinition>>,
    epoch: u64,
    index: OnceLock<RegistryIndex>,
}

impl LinkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `definition` as link `name` on `collection`.
    ///
    /// Cross-collection checks run immediately when the other side is already
    /// registered and otherwise wait for [`LinkRegistry::validate`].
    pub fn add_link(
        &mut self,
        collection: &str,
        name: &str,
        definition: LinkDefinition,
    ) -> Result<()> {
        definition.check_shape(collection, name)?;
        if self
            .links
            .get(collection)
            .is_some_and(|defs| defs.contains_key(name))
        {
            return Err(LinkError::invalid_link(
                collection,
                name,
                "a link with this name is already declared",
            ));
        }
        match definition.side() {
            LinkSide::Inverse => {
                let declared = definition.inverse_of.as_deref().and_then(|of| {
                    self.links
                        .get(&definition.target_collection)
                        .and_then(|defs| defs.get(of))
                });
                if declared.is_some() {
                    self.resolve_inverse(collection, name, &definition)
                        .map_err(|reason| LinkError::invalid_link(collection, name, reason))?;
                }
            }
            LinkSide::Direct => {
                if !definition.metadata {
                    let metadata_inverse = self
                        .links
                        .get(&definition.target_collection)
                        .into_iter()
                        .flat_map(|defs| defs.values())
                        .any(|inv| {
                            inv.metadata
                                && inv.inverse_of.as_deref() == Some(name)
                                && inv.target_collection == collection
                        });
                    if metadata_inverse {
                        return Err(LinkError::invalid_link(
                            collection,
                            name,
                            "an inverse declared as metadata mirrors this non-metadata link",
                        ));
                    }
                }
            }
        }
        debug!(
            collection,
            name,
            target = %definition.target_collection,
            side = ?definition.side(),
            "links.registry.added"
        );
        self.links
            .entry(collection.to_owned())
            .or_default()
            .insert(name.to_owned(), definition);
        self.epoch += 1;
        self.index = OnceLock::new();
        Ok(())
    }

    /// Checks the whole graph: every inverse must resolve to a compatible
    /// direct link.
    pub fn validate(&self) -> Result<()> {
        for (collection, defs) in &self.links {
            for (name, def) in defs {
                if def.side() == LinkSide::Inverse {
                    self.resolve_inverse(collection, name, def)
                        .map_err(|reason| LinkError::invalid_link(collection, name, reason))?;
                }
            }
        }
        Ok(())
    }

    /// Validates and wraps the registry for sharing.
    pub fn freeze(self) -> Result<Arc<Self>> {
        self.validate()?;
        let _ = self.index();
        Ok(Arc::new(self))
    }

    /// Effective link `name` as seen from `collection`.
    pub fn resolve(&self, collection: &str, name: &str) -> Result<&ResolvedLink> {
        let index = self.index();
        if let Some(link) = index.resolved.get(collection).and_then(|m| m.get(name)) {
            return Ok(link);
        }
        if let Some(reason) = index.broken.get(collection).and_then(|m| m.get(name)) {
            return Err(LinkError::invalid_link(collection, name, reason.clone()));
        }
        Err(LinkError::link_not_found(collection, name))
    }

    /// Whether `name` resolves on `collection`.
    pub fn has_link(&self, collection: &str, name: &str) -> bool {
        self.links
            .get(collection)
            .is_some_and(|defs| defs.contains_key(name))
    }

    /// Collections whose documents react to removals from `collection`.
    pub fn dependents_of(&self, collection: &str) -> &[DependentLink] {
        self.index()
            .dependents
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Declared definition, as registered.
    pub fn definition(&self, collection: &str, name: &str) -> Option<&LinkDefinition> {
        self.links.get(collection)?.get(name)
    }

    /// Every `(collection, name, definition)` triple in a stable order.
    pub fn definitions(&self) -> impl Iterator<Item = (&str, &str, &LinkDefinition)> {
        self.links.iter().flat_map(|(collection, defs)| {
            defs.iter()
                .map(move |(name, def)| (collection.as_str(), name.as_str(), def))
        })
    }

    /// Number of registrations so far; changes whenever the graph changes.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Fields the store should index to keep link joins cheap.
    pub fn index_advice(&self) -> Vec<IndexAdvice> {
        let index = self.index();
        let mut advice = BTreeSet::new();
        for (collection, name, def) in self.definitions() {
            if !def.indexed {
                continue;
            }
            if let Some(link) = index.resolved.get(collection).and_then(|m| m.get(name)) {
                advice.insert(IndexAdvice {
                    collection: link.storage_collection().to_owned(),
                    field: link.storage_field.clone(),
                });
            }
        }
        advice.into_iter().collect()
    }

    fn index(&self) -> &RegistryIndex {
        self.index.get_or_init(|| self.build_index())
    }

    fn resolve_inverse(
        &self,
        collection: &str,
        name: &str,
        def: &LinkDefinition,
    ) -> std::result::Result<ResolvedLink, String> {
        let of = def.inverse_of.as_deref().unwrap_or_default();
        let target = &def.target_collection;
        let direct = self
            .links
            .get(target)
            .and_then(|defs| defs.get(of))
            .ok_or_else(|| format!("inverse-of '{of}' is not declared on '{target}'"))?;
        if direct.side() != LinkSide::Direct {
            return Err(format!("'{target}.{of}' is itself an inverse link"));
        }
        if direct.target_collection != collection {
            return Err(format!(
                "'{target}.{of}' targets '{}', not '{collection}'",
                direct.target_collection
            ));
        }
        if def.metadata && !direct.metadata {
            return Err(format!(
                "declared as metadata but '{target}.{of}' does not carry metadata"
            ));
        }
        let resolved = ResolvedLink::direct(target, of, direct)
            .ok_or_else(|| format!("'{target}.{of}' has no storage field"))?;
        Ok(derive_inverse(&resolved, name, def.autoremove))
    }

    fn build_index(&self) -> RegistryIndex {
        let mut index = RegistryIndex::default();
        for (collection, name, def) in self.definitions() {
            let resolved = match def.side() {
                LinkSide::Direct => ResolvedLink::direct(collection, name, def)
                    .ok_or_else(|| "direct link without storage field".to_owned()),
                LinkSide::Inverse => self.resolve_inverse(collection, name, def),
            };
            match resolved {
                Ok(link) => {
                    index
                        .resolved
                        .entry(collection.to_owned())
                        .or_default()
                        .insert(name.to_owned(), link);
                }
                Err(reason) => {
                    warn!(collection, name, %reason, "links.registry.unresolved");
                    index
                        .broken
                        .entry(collection.to_owned())
                        .or_default()
                        .insert(name.to_owned(), reason);
                }
            }
        }

        let links: Vec<&ResolvedLink> = index
            .resolved
            .values()
            .flat_map(|m| m.values())
            .collect();
        let mut dependents: FxHashMap<String, Vec<DependentLink>> = FxHashMap::default();
        let mut directs: Vec<&ResolvedLink> = links
            .iter()
            .copied()
            .filter(|l| l.side == LinkSide::Direct)
            .collect();
        directs.sort_by(|a, b| (&a.collection, &a.name).cmp(&(&b.collection, &b.name)));
        for direct in directs {
            let inverse_autoremove = links.iter().any(|l| {
                l.side == LinkSide::Inverse
                    && l.autoremove
                    && l.collection == direct.target
                    && l.direct_name == direct.name
                    && l.target == direct.collection
            });
            let entry = |collection: &str, side, autoremove| DependentLink {
                collection: collection.to_owned(),
                link: direct.name.clone(),
                holder: direct.collection.clone(),
                storage_field: direct.storage_field.clone(),
                storage_cardinality: direct.storage_cardinality,
                metadata: direct.metadata,
                side,
                autoremove,
            };
            dependents.entry(direct.target.clone()).or_default().push(entry(
                &direct.collection,
                DependentSide::Holder,
                inverse_autoremove,
            ));
            if direct.autoremove {
                dependents.entry(direct.collection.clone()).or_default().push(entry(
                    &direct.target,
                    DependentSide::Referenced,
                    true,
                ));
            }
        }
        index.dependents = dependents;
        debug!(
            epoch = self.epoch,
            collections = self.links.len(),
            "links.registry.indexed"
        );
        index
    }
}

#![forbid(unsafe_code)]

use serde_json::Value;
use tracing::debug;

use crate::links::registry::LinkRegistry;
use crate::links::{Cardinality, LinkSide, ResolvedLink};
use crate::store::{DocumentStore, Filter, FindOptions, Mutation, Projection};
use crate::types::{Document, LinkError, Result, ID_FIELD};

/// Writes link references through the registry, from either side of a link.
///
/// A direct link writes the source document's storage field. An inverse link
/// writes the storage field of the documents on the other side, which point
/// back at the source.
pub struct LinkMutator<'a, S: ?Sized> {
    registry: &'a LinkRegistry,
    store: &'a S,
}

impl<'a, S> LinkMutator<'a, S>
where
    S: DocumentStore + ?Sized,
{
    /// Creates a mutator writing to `store`.
    pub fn new(registry: &'a LinkRegistry, store: &'a S) -> Self {
        Self { registry, store }
    }

    /// Points the `one` link `name` of `source` at `target`.
    pub fn set(
        &self,
        collection: &str,
        name: &str,
        source: impl Into<Value>,
        target: impl Into<Value>,
    ) -> Result<u64> {
        self.set_entry(collection, name, source.into(), target.into(), None)
    }

    /// Like [`LinkMutator::set`], storing `metadata` alongside the reference.
    pub fn set_with_metadata(
        &self,
        collection: &str,
        name: &str,
        source: impl Into<Value>,
        target: impl Into<Value>,
        metadata: Document,
    ) -> Result<u64> {
        self.set_entry(collection, name, source.into(), target.into(), Some(metadata))
    }

    /// Clears the `one` link `name` of `source`.
    pub fn unset(&self, collection: &str, name: &str, source: impl Into<Value>) -> Result<u64> {
        let link = self.expect(collection, name, Cardinality::One)?;
        let source = source.into();
        let changed = match link.side {
            LinkSide::Direct => self.update(
                &link.collection,
                by_id(&source),
                Mutation::Unset {
                    field: link.storage_field.clone(),
                },
            )?,
            LinkSide::Inverse => self.detach_holders(link, &source, None)?,
        };
        self.log(link, "unset", changed);
        Ok(changed)
    }

    /// Adds `targets` to the `many` link `name` of `source`.
    pub fn add<I>(
        &self,
        collection: &str,
        name: &str,
        source: impl Into<Value>,
        targets: I,
    ) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let link = self.expect(collection, name, Cardinality::Many)?;
        let source = source.into();
        let mut changed = 0;
        for target in targets {
            let target = target.into();
            changed += match link.side {
                LinkSide::Direct => self.push_entry(
                    &link.collection,
                    &source,
                    link,
                    entry(&target, link.metadata, None),
                )?,
                LinkSide::Inverse => self.point_holder(link, &target, &source, None)?,
            };
        }
        self.log(link, "add", changed);
        Ok(changed)
    }

    /// Removes `targets` from the `many` link `name` of `source`.
    pub fn remove<I>(
        &self,
        collection: &str,
        name: &str,
        source: impl Into<Value>,
        targets: I,
    ) -> Result<u64>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let link = self.expect(collection, name, Cardinality::Many)?;
        let source = source.into();
        let mut changed = 0;
        for target in targets {
            let target = target.into();
            changed += match link.side {
                LinkSide::Direct => {
                    self.update(&link.collection, by_id(&source), pull(link, &target))?
                }
                LinkSide::Inverse => self.detach_holders(link, &source, Some(&target))?,
            };
        }
        self.log(link, "remove", changed);
        Ok(changed)
    }

    /// Replaces the attributes stored with the reference from `source` to
    /// `target` on a metadata link, keeping the entry's position.
    ///
    /// Returns 0 when no such reference exists.
    pub fn set_metadata(
        &self,
        collection: &str,
        name: &str,
        source: impl Into<Value>,
        target: impl Into<Value>,
        metadata: Document,
    ) -> Result<u64> {
        let link = self.registry.resolve(collection, name)?;
        if !link.metadata {
            return Err(LinkError::InvalidQuery(format!(
                "link '{name}' on '{collection}' does not carry metadata"
            )));
        }
        let (source, target) = (source.into(), target.into());
        // The holder document and the id its entry points at.
        let (holder, entry_id) = match link.side {
            LinkSide::Direct => (&source, &target),
            LinkSide::Inverse => (&target, &source),
        };
        let docs = self.store.find_many(
            link.storage_collection(),
            &by_id(holder),
            &Projection::fields([link.storage_field.as_str()]),
            &FindOptions::default(),
        )?;
        let Some(doc) = docs.into_iter().next() else {
            return Ok(0);
        };
        let Some(mut stored) = doc.get(&link.storage_field).cloned() else {
            return Ok(0);
        };
        if !replace_entry(&mut stored, entry_id, &metadata) {
            return Ok(0);
        }
        let changed = self.update(
            link.storage_collection(),
            by_id(holder),
            Mutation::Set {
                field: link.storage_field.clone(),
                value: stored,
            },
        )?;
        self.log(link, "set_metadata", changed);
        Ok(changed)
    }

    fn set_entry(
        &self,
        collection: &str,
        name: &str,
        source: Value,
        target: Value,
        metadata: Option<Document>,
    ) -> Result<u64> {
        let link = self.expect(collection, name, Cardinality::One)?;
        let changed = match link.side {
            LinkSide::Direct => self.update(
                &link.collection,
                by_id(&source),
                Mutation::Set {
                    field: link.storage_field.clone(),
                    value: entry(&target, link.metadata, metadata.as_ref()),
                },
            )?,
            LinkSide::Inverse => {
                // A one-sided inverse is unique: only one holder may point back.
                let detached = self.detach_holders(link, &source, None)?;
                detached + self.point_holder(link, &target, &source, metadata.as_ref())?
            }
        };
        self.log(link, "set", changed);
        Ok(changed)
    }

    fn expect(
        &self,
        collection: &str,
        name: &str,
        cardinality: Cardinality,
    ) -> Result<&ResolvedLink> {
        let link = self.registry.resolve(collection, name)?;
        if link.cardinality != cardinality {
            let verb = match cardinality {
                Cardinality::One => "set/unset",
                Cardinality::Many => "add/remove",
            };
            return Err(LinkError::InvalidQuery(format!(
                "{verb} does not apply to link '{name}' on '{collection}' ({:?})",
                link.cardinality
            )));
        }
        Ok(link)
    }

    // Makes the holder document `holder` reference `source`.
    fn point_holder(
        &self,
        link: &ResolvedLink,
        holder: &Value,
        source: &Value,
        metadata: Option<&Document>,
    ) -> Result<u64> {
        let value = entry(source, link.metadata, metadata);
        match link.storage_cardinality {
            Cardinality::One => self.update(
                &link.target,
                by_id(holder),
                Mutation::Set {
                    field: link.storage_field.clone(),
                    value,
                },
            ),
            Cardinality::Many => self.push_entry(&link.target, holder, link, value),
        }
    }

    // Drops references to `source` held on the other side of an inverse link,
    // optionally only on the holder `only`.
    fn detach_holders(
        &self,
        link: &ResolvedLink,
        source: &Value,
        only: Option<&Value>,
    ) -> Result<u64> {
        let filter = Filter::and([
            Filter::eq(link.join_path(), source.clone()),
            only.map(by_id).unwrap_or_default(),
        ]);
        let mutation = match link.storage_cardinality {
            Cardinality::One => Mutation::Unset {
                field: link.storage_field.clone(),
            },
            Cardinality::Many => pull(link, source),
        };
        self.update(&link.target, filter, mutation)
    }

    fn push_entry(
        &self,
        collection: &str,
        holder: &Value,
        link: &ResolvedLink,
        value: Value,
    ) -> Result<u64> {
        if link.metadata {
            if let Some(id) = value.get(ID_FIELD) {
                self.update(
                    collection,
                    by_id(holder),
                    Mutation::PullById {
                        field: link.storage_field.clone(),
                        id: id.clone(),
                    },
                )?;
            }
        }
        self.update(
            collection,
            by_id(holder),
            Mutation::AddToSet {
                field: link.storage_field.clone(),
                value,
            },
        )
    }

    fn update(&self, collection: &str, filter: Filter, mutation: Mutation) -> Result<u64> {
        Ok(self.store.update_many(collection, &filter, &mutation)?)
    }

    fn log(&self, link: &ResolvedLink, op: &str, changed: u64) {
        debug!(
            collection = %link.collection,
            link = %link.name,
            side = ?link.side,
            op,
            changed,
            "links.mutated"
        );
    }
}

fn by_id(id: &Value) -> Filter {
    Filter::eq(ID_FIELD, id.clone())
}

fn pull(link: &ResolvedLink, id: &Value) -> Mutation {
    if link.metadata {
        Mutation::PullById {
            field: link.storage_field.clone(),
            id: id.clone(),
        }
    } else {
        Mutation::Pull {
            field: link.storage_field.clone(),
            value: id.clone(),
        }
    }
}

fn entry(id: &Value, metadata: bool, attrs: Option<&Document>) -> Value {
    if !metadata {
        return id.clone();
    }
    let mut object = Document::new();
    object.insert(ID_FIELD.to_owned(), id.clone());
    if let Some(attrs) = attrs {
        for (key, value) in attrs {
            if key != ID_FIELD {
                object.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(object)
}

// Rewrites the entry for `id` inside a stored reference value in place.
fn replace_entry(stored: &mut Value, id: &Value, attrs: &Document) -> bool {
    let matches = |item: &Value| match item {
        Value::Object(map) => map.get(ID_FIELD) == Some(id),
        scalar => scalar == id,
    };
    match stored {
        Value::Array(items) => match items.iter_mut().find(|item| matches(item)) {
            Some(item) => {
                *item = entry(id, true, Some(attrs));
                true
            }
            None => false,
        },
        other if matches(other) => {
            *other = entry(id, true, Some(attrs));
            true
        }
        _ => false,
    }
}

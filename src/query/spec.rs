//! Query specification: the nested JSON object a caller submits, parsed in a
//! single pass into tagged entries.
//!
//! ```json
//! {
//!   "$filters": {"status": "published"},
//!   "$options": {"sort": {"createdAt": -1}, "limit": 10},
//!   "title": 1,
//!   "author": {"name": 1},
//!   "comments": {"$options": {"limit": 3}, "text": 1}
//! }
//! ```

use serde_json::Value;

use crate::links::{Cardinality, LinkRegistry, ResolvedLink};
use crate::store::{Filter, FindOptions, SortKey, SortOrder};
use crate::types::{LinkError, Result};

/// Reserved key carrying a node's filter.
pub const FILTERS_KEY: &str = "$filters";
/// Reserved key carrying a node's sort/skip/limit.
pub const OPTIONS_KEY: &str = "$options";

/// One parsed key of a query specification.
#[derive(Clone, Debug, PartialEq)]
pub enum SpecEntry {
    /// Scalar field request.
    Field(String),
    /// Link request with its own nested specification.
    Link {
        /// Link as resolved on the enclosing collection.
        link: ResolvedLink,
        /// Specification for the linked collection.
        spec: QuerySpec,
    },
    /// `$filters` block.
    Filters(Filter),
    /// `$options` block.
    Options(FindOptions),
}

/// Parsed specification bound to a collection.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct QuerySpec {
    /// Collection the specification applies to.
    pub collection: String,
    /// Entries in the order they appeared.
    pub entries: Vec<SpecEntry>,
}

impl QuerySpec {
    /// Parses `value` against `collection`, resolving link names through the
    /// registry. Fails before any store access when a link is unresolvable.
    pub fn parse(registry: &LinkRegistry, collection: &str, value: &Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::empty(collection)),
            other => {
                return Err(LinkError::InvalidQuery(format!(
                    "specification for '{collection}' must be an object, got {other}"
                )))
            }
        };
        let mut entries = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                FILTERS_KEY => entries.push(SpecEntry::Filters(parse_filters(collection, value)?)),
                OPTIONS_KEY => entries.push(SpecEntry::Options(parse_options(collection, value)?)),
                reserved if reserved.starts_with('$') => {
                    return Err(LinkError::InvalidQuery(format!(
                        "unknown reserved key '{reserved}' on '{collection}'"
                    )))
                }
                name if registry.has_link(collection, name) => {
                    if !is_requested(value) {
                        continue;
                    }
                    let link = registry.resolve(collection, name)?.clone();
                    let spec = if value.is_object() {
                        Self::parse(registry, &link.target, value)?
                    } else {
                        Self::empty(&link.target)
                    };
                    if link.cardinality == Cardinality::One && spec.is_paginated() {
                        return Err(LinkError::InvalidQuery(format!(
                            "skip/limit on '{collection}.{name}' needs a 'many' link"
                        )));
                    }
                    entries.push(SpecEntry::Link { link, spec });
                }
                name => {
                    if value.is_object() {
                        return Err(LinkError::link_not_found(collection, name));
                    }
                    if is_requested(value) {
                        entries.push(SpecEntry::Field(name.to_owned()));
                    }
                }
            }
        }
        Ok(Self {
            collection: collection.to_owned(),
            entries,
        })
    }

    fn is_paginated(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry, SpecEntry::Options(opts) if opts.is_paginated()))
    }

    fn empty(collection: &str) -> Self {
        Self {
            collection: collection.to_owned(),
            entries: Vec::new(),
        }
    }
}

// `0`, `false` and `null` opt a key out; anything else opts it in.
fn is_requested(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn parse_filters(collection: &str, value: &Value) -> Result<Filter> {
    Filter::from_json(value)
        .map_err(|err| LinkError::InvalidQuery(format!("$filters on '{collection}': {err}")))
}

fn parse_options(collection: &str, value: &Value) -> Result<FindOptions> {
    let invalid =
        |msg: String| LinkError::InvalidQuery(format!("$options on '{collection}': {msg}"));
    let Value::Object(map) = value else {
        return Err(invalid("must be an object".into()));
    };
    let mut options = FindOptions::default();
    for (key, value) in map {
        match key.as_str() {
            "sort" => options.sort = parse_sort(value).map_err(invalid)?,
            "limit" => options.limit = Some(parse_count(value).map_err(invalid)?),
            "skip" => options.skip = Some(parse_count(value).map_err(invalid)?),
            other => return Err(invalid(format!("unknown option '{other}'"))),
        }
    }
    Ok(options)
}

fn parse_count(value: &Value) -> std::result::Result<usize, String> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| format!("expected a non-negative integer, got {value}"))
}

fn parse_direction(value: &Value) -> std::result::Result<SortOrder, String> {
    match value {
        Value::Number(n) if n.as_i64() == Some(1) => Ok(SortOrder::Asc),
        Value::Number(n) if n.as_i64() == Some(-1) => Ok(SortOrder::Desc),
        Value::String(s) if s.eq_ignore_ascii_case("asc") => Ok(SortOrder::Asc),
        Value::String(s) if s.eq_ignore_ascii_case("desc") => Ok(SortOrder::Desc),
        other => Err(format!("sort direction must be 1, -1, 'asc' or 'desc', got {other}")),
    }
}

// Accepts `{"field": 1, ...}` or `[["field", -1], ...]`.
fn parse_sort(value: &Value) -> std::result::Result<Vec<SortKey>, String> {
    let key = |field: &str, dir: &Value| -> std::result::Result<SortKey, String> {
        Ok(SortKey {
            field: field.to_owned(),
            order: parse_direction(dir)?,
        })
    };
    match value {
        Value::Object(map) => map.iter().map(|(field, dir)| key(field, dir)).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.as_array().map(Vec::as_slice) {
                Some([Value::String(field), dir]) => key(field, dir),
                _ => Err(format!("sort entries must be [field, direction] pairs, got {item}")),
            })
            .collect(),
        other => Err(format!("sort must be an object or an array, got {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::LinkDefinition;
    use serde_json::json;

    fn registry() -> LinkRegistry {
        let mut reg = LinkRegistry::new();
        reg.add_link(
            "posts",
            "author",
            LinkDefinition::direct("users", "authorId", Cardinality::One),
        )
        .unwrap();
        reg.add_link("users", "posts", LinkDefinition::inverse("posts", "author"))
            .unwrap();
        reg
    }

    #[test]
    fn splits_fields_links_and_control_keys() {
        let reg = registry();
        let spec = QuerySpec::parse(
            &reg,
            "posts",
            &json!({
                "$filters": {"status": "open"},
                "$options": {"sort": {"createdAt": -1}, "limit": 5},
                "title": 1,
                "draft": 0,
                "author": {"name": 1},
            }),
        )
        .unwrap();
        assert_eq!(spec.entries.len(), 4);
        assert!(matches!(&spec.entries[0], SpecEntry::Filters(Filter::Eq { .. })));
        match &spec.entries[1] {
            SpecEntry::Options(opts) => {
                assert_eq!(opts.limit, Some(5));
                assert_eq!(opts.sort[0].order, SortOrder::Desc);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(spec.entries[2], SpecEntry::Field("title".into()));
        match &spec.entries[3] {
            SpecEntry::Link { link, spec } => {
                assert_eq!(link.name, "author");
                assert_eq!(spec.collection, "users");
                assert_eq!(spec.entries, vec![SpecEntry::Field("name".into())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn link_with_scalar_value_requests_default_projection() {
        let reg = registry();
        let spec = QuerySpec::parse(&reg, "users", &json!({"posts": 1})).unwrap();
        match &spec.entries[0] {
            SpecEntry::Link { spec, .. } => assert!(spec.entries.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn object_under_unknown_key_is_link_not_found() {
        let reg = registry();
        let err = QuerySpec::parse(&reg, "posts", &json!({"editor": {"name": 1}})).unwrap_err();
        assert_eq!(err.code(), "LinkNotFound");
        let ok = QuerySpec::parse(&reg, "posts", &json!({"editor": 1})).unwrap();
        assert_eq!(ok.entries, vec![SpecEntry::Field("editor".into())]);
    }

    #[test]
    fn rejects_malformed_control_blocks() {
        let reg = registry();
        for bad in [
            json!({"$options": {"limit": -1}}),
            json!({"$options": {"sort": {"a": 2}}}),
            json!({"$options": {"page": 1}}),
            json!({"$filters": {"a": {"$near": 1}}}),
            json!({"$postFilters": {}}),
        ] {
            let err = QuerySpec::parse(&reg, "posts", &bad).unwrap_err();
            assert_eq!(err.code(), "InvalidQuery", "{bad}");
        }
    }

    #[test]
    fn pagination_needs_a_many_link() {
        let reg = registry();
        let err = QuerySpec::parse(
            &reg,
            "posts",
            &json!({"author": {"name": 1, "$options": {"limit": 1}}}),
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidQuery");
        let ok = QuerySpec::parse(
            &reg,
            "posts",
            &json!({"author": {"name": 1, "$options": {"sort": {"name": 1}}}}),
        );
        assert!(ok.is_ok(), "sort alone is fine on a one link");
        let ok = QuerySpec::parse(
            &reg,
            "users",
            &json!({"posts": {"$options": {"skip": 1, "limit": 2}}}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn sort_accepts_pair_lists() {
        let sort = parse_sort(&json!([["b", "desc"], ["a", 1]])).unwrap();
        assert_eq!(sort[0].field, "b");
        assert_eq!(sort[0].order, SortOrder::Desc);
        assert_eq!(sort[1].order, SortOrder::Asc);
    }
}

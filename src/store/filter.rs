#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde_json::Value;

use crate::store::value::{compare_values, path_values, values_equal};
use crate::types::Document;

/// Range comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Gte => ord != Ordering::Less,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Lte => ord != Ordering::Greater,
        }
    }
}

/// Document predicate over dotted field paths.
///
/// The JSON form accepted by [`Filter::from_json`] follows the familiar
/// document-store dialect: `{"status": "open", "age": {"$gte": 18}}`,
/// `{"$or": [...]}`, `{"tags": {"$in": ["a", "b"]}}`.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Filter {
    /// Matches everything.
    #[default]
    All,
    /// Some value at `path` equals `value`.
    Eq {
        /// Dotted path.
        path: String,
        /// Expected value.
        value: Value,
    },
    /// No value at `path` equals `value`.
    Ne {
        /// Dotted path.
        path: String,
        /// Rejected value.
        value: Value,
    },
    /// Some value at `path` is one of `values`.
    In {
        /// Dotted path.
        path: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// No value at `path` is one of `values`.
    Nin {
        /// Dotted path.
        path: String,
        /// Rejected values.
        values: Vec<Value>,
    },
    /// Some value at `path` of the same type compares as `op` against `value`.
    Cmp {
        /// Dotted path.
        path: String,
        /// Operator.
        op: CmpOp,
        /// Right-hand side.
        value: Value,
    },
    /// Whether `path` resolves to anything.
    Exists {
        /// Dotted path.
        path: String,
        /// Required presence.
        exists: bool,
    },
    /// Every clause matches.
    And(Vec<Filter>),
    /// At least one clause matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// `path == value`.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            path: path.into(),
            value: value.into(),
        }
    }

    /// `path ∈ values`.
    pub fn in_values<I>(path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Filter::In {
            path: path.into(),
            values: values.into_iter().collect(),
        }
    }

    /// Conjunction that drops `All` clauses and flattens nested conjunctions.
    pub fn and(clauses: impl IntoIterator<Item = Filter>) -> Self {
        let mut flat = Vec::new();
        for clause in clauses {
            match clause {
                Filter::All => {}
                Filter::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Filter::All,
            1 => flat.pop().unwrap_or_default(),
            _ => Filter::And(flat),
        }
    }

    /// Evaluates the filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { path, value } => any_equal(doc, path, value),
            Filter::Ne { path, value } => !any_equal(doc, path, value),
            Filter::In { path, values } => values.iter().any(|v| any_equal(doc, path, v)),
            Filter::Nin { path, values } => !values.iter().any(|v| any_equal(doc, path, v)),
            Filter::Cmp { path, op, value } => path_values(doc, path).into_iter().any(|found| {
                same_kind(found, value) && op.holds(compare_values(found, value))
            }),
            Filter::Exists { path, exists } => !path_values(doc, path).is_empty() == *exists,
            Filter::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches(doc)),
        }
    }

    /// Parses the JSON filter dialect.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("filter must be an object, got {value}"));
        };
        let mut clauses = Vec::with_capacity(map.len());
        for (key, operand) in map {
            match key.as_str() {
                "$and" | "$or" => {
                    let Value::Array(items) = operand else {
                        return Err(format!("{key} expects an array"));
                    };
                    let parsed = items
                        .iter()
                        .map(Filter::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    clauses.push(if key == "$and" {
                        Filter::and(parsed)
                    } else {
                        Filter::Or(parsed)
                    });
                }
                other if other.starts_with('$') => {
                    return Err(format!("unsupported top-level filter operator '{other}'"));
                }
                path => clauses.push(parse_field(path, operand)?),
            }
        }
        Ok(Filter::and(clauses))
    }
}

fn any_equal(doc: &Document, path: &str, value: &Value) -> bool {
    let found = path_values(doc, path);
    if value.is_null() && found.is_empty() {
        return true;
    }
    found.into_iter().any(|v| values_equal(v, value))
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

fn parse_field(path: &str, operand: &Value) -> Result<Filter, String> {
    let operators = match operand {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        _ => return Ok(Filter::eq(path, operand.clone())),
    };
    let mut clauses = Vec::with_capacity(operators.len());
    for (op, arg) in operators {
        let clause = match op.as_str() {
            "$eq" => Filter::eq(path, arg.clone()),
            "$ne" => Filter::Ne {
                path: path.to_owned(),
                value: arg.clone(),
            },
            "$in" | "$nin" => {
                let Value::Array(items) = arg else {
                    return Err(format!("{op} on '{path}' expects an array"));
                };
                if op == "$in" {
                    Filter::in_values(path, items.iter().cloned())
                } else {
                    Filter::Nin {
                        path: path.to_owned(),
                        values: items.clone(),
                    }
                }
            }
            "$gt" | "$gte" | "$lt" | "$lte" => Filter::Cmp {
                path: path.to_owned(),
                op: match op.as_str() {
                    "$gt" => CmpOp::Gt,
                    "$gte" => CmpOp::Gte,
                    "$lt" => CmpOp::Lt,
                    _ => CmpOp::Lte,
                },
                value: arg.clone(),
            },
            "$exists" => Filter::Exists {
                path: path.to_owned(),
                exists: arg.as_bool().ok_or_else(|| {
                    format!("$exists on '{path}' expects a boolean")
                })?,
            },
            other => return Err(format!("unsupported filter operator '{other}' on '{path}'")),
        };
        clauses.push(clause);
    }
    Ok(Filter::and(clauses))
}

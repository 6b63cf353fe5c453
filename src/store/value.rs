#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde_json::Value;

use crate::store::{SortKey, SortOrder};
use crate::types::Document;

// Cross-type ordering: null < numbers < strings < objects < arrays < bools.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values used for sorting, range filters and
/// deterministic tie-breaks.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()).then_with(|| {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

/// Values reachable at a dotted `path`.
///
/// Arrays met on the way fan out over their elements, and an array at the end
/// of the path yields both itself and each element, so `{tags: "x"}` matches a
/// document whose `tags` array contains `"x"`.
pub fn path_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Vec::new();
    };
    let mut current: Vec<&Value> = doc.get(first).into_iter().collect();
    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(segment)),
                Value::Array(items) => {
                    for item in items {
                        if let Value::Object(map) = item {
                            next.extend(map.get(segment));
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    let mut out = Vec::with_capacity(current.len());
    for value in current {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

/// First value at `path` for sorting purposes; arrays sort by their smallest element.
fn sort_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    path_values(doc, path)
        .into_iter()
        .filter(|v| !v.is_array())
        .min_by(|a, b| compare_values(a, b))
}

/// Compares two documents by a list of sort keys. Missing fields sort first.
pub fn compare_documents(a: &Document, b: &Document, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let ord = match (sort_value(a, &key.field), sort_value(b, &key.field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare_values(x, y),
        };
        let ord = match key.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable sort of `docs` by `sort`.
pub fn sort_documents(docs: &mut [Document], sort: &[SortKey]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| compare_documents(a, b, sort));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn path_values_fan_out_over_arrays() {
        let d = doc(json!({
            "refs": [{"_id": 1, "role": "a"}, {"_id": 2, "role": "b"}],
            "tags": ["x", "y"],
        }));
        let ids: Vec<_> = path_values(&d, "refs._id").into_iter().cloned().collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);
        let tags = path_values(&d, "tags");
        assert_eq!(tags.len(), 3, "array itself plus both elements");
        assert!(path_values(&d, "missing").is_empty());
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(5), &json!("5")), Ordering::Less);
    }

    #[test]
    fn sorts_by_multiple_keys() {
        let mut docs = vec![
            doc(json!({"_id": 1, "team": "b", "age": 30})),
            doc(json!({"_id": 2, "team": "a", "age": 20})),
            doc(json!({"_id": 3, "team": "a", "age": 40})),
            doc(json!({"_id": 4})),
        ];
        sort_documents(
            &mut docs,
            &[
                SortKey {
                    field: "team".into(),
                    order: SortOrder::Asc,
                },
                SortKey {
                    field: "age".into(),
                    order: SortOrder::Desc,
                },
            ],
        );
        let order: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(order, vec![json!(4), json!(3), json!(2), json!(1)]);
    }
}

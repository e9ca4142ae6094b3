//! Stable multi-key sort with MongoDB's canonical cross-type ordering.

use std::cmp::Ordering;

use mangrove_bson::{canonical_cmp, Document, Value};
use mangrove_common::{MongoError, MongoResult};

use super::path;

/// Validates a sort document into `(path, direction)` pairs.
pub fn validate(sort: &Document) -> MongoResult<Vec<(String, i32)>> {
    let mut spec = Vec::with_capacity(sort.len());
    for (field, direction) in sort.iter() {
        let dir = direction
            .as_integer()
            .filter(|d| *d == 1 || *d == -1)
            .ok_or_else(|| {
                MongoError::bad_value(format!(
                    "sort direction for {field:?} must be 1 or -1"
                ))
            })?;
        spec.push((field.to_owned(), dir as i32));
    }
    Ok(spec)
}

/// Sorts in place, stable across equal keys. Missing fields sort as
/// null; array fields sort by their smallest (ascending) or largest
/// (descending) element.
pub fn sort_documents(documents: &mut [Document], spec: &[(String, i32)]) {
    documents.sort_by(|a, b| {
        for (field, direction) in spec {
            let va = sort_key(a, field, *direction);
            let vb = sort_key(b, field, *direction);
            let ord = canonical_cmp(&va, &vb);
            let ord = if *direction < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn sort_key(doc: &Document, field: &str, direction: i32) -> Value {
    let mut leaves: Vec<&Value> = Vec::new();
    for candidate in path::gather(doc, field) {
        match candidate {
            Value::Array(elements) if !elements.is_empty() => leaves.extend(elements.iter()),
            other => leaves.push(other),
        }
    }
    if leaves.is_empty() {
        return Value::Null;
    }
    let extreme = if direction >= 0 {
        leaves.into_iter().min_by(|a, b| canonical_cmp(a, b))
    } else {
        leaves.into_iter().max_by(|a, b| canonical_cmp(a, b))
    };
    extreme.cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_bson::doc;

    fn ids(documents: &[Document]) -> Vec<i64> {
        documents
            .iter()
            .map(|d| d.get("_id").and_then(Value::as_integer).unwrap())
            .collect()
    }

    #[test]
    fn test_single_key_ascending_and_descending() {
        let mut docs = vec![
            doc! { "_id" => 1, "n" => 5 },
            doc! { "_id" => 2, "n" => 1 },
            doc! { "_id" => 3, "n" => 3 },
        ];
        sort_documents(&mut docs, &[("n".into(), 1)]);
        assert_eq!(ids(&docs), vec![2, 3, 1]);
        sort_documents(&mut docs, &[("n".into(), -1)]);
        assert_eq!(ids(&docs), vec![1, 3, 2]);
    }

    #[test]
    fn test_multi_key_is_stable() {
        let mut docs = vec![
            doc! { "_id" => 1, "a" => 1, "b" => 2 },
            doc! { "_id" => 2, "a" => 1, "b" => 1 },
            doc! { "_id" => 3, "a" => 0, "b" => 9 },
        ];
        sort_documents(&mut docs, &[("a".into(), 1), ("b".into(), 1)]);
        assert_eq!(ids(&docs), vec![3, 2, 1]);
    }

    #[test]
    fn test_missing_fields_sort_as_null_first() {
        let mut docs = vec![
            doc! { "_id" => 1, "n" => 1 },
            doc! { "_id" => 2 },
            doc! { "_id" => 3, "n" => Value::Null },
        ];
        sort_documents(&mut docs, &[("n".into(), 1)]);
        // Null and missing tie; stability keeps their relative order.
        assert_eq!(ids(&docs), vec![2, 3, 1]);
    }

    #[test]
    fn test_mixed_types_follow_canonical_order() {
        let mut docs = vec![
            doc! { "_id" => 1, "n" => "text" },
            doc! { "_id" => 2, "n" => 10 },
            doc! { "_id" => 3, "n" => true },
        ];
        sort_documents(&mut docs, &[("n".into(), 1)]);
        // numbers < strings < booleans
        assert_eq!(ids(&docs), vec![2, 1, 3]);
    }

    #[test]
    fn test_arrays_sort_by_extreme_element() {
        let mut docs = vec![
            doc! { "_id" => 1, "n" => vec![Value::from(4), Value::from(9)] },
            doc! { "_id" => 2, "n" => vec![Value::from(2), Value::from(99)] },
        ];
        sort_documents(&mut docs, &[("n".into(), 1)]);
        assert_eq!(ids(&docs), vec![2, 1]);
        sort_documents(&mut docs, &[("n".into(), -1)]);
        assert_eq!(ids(&docs), vec![2, 1]);
    }

    #[test]
    fn test_validate_rejects_bad_directions() {
        assert!(validate(&doc! { "a" => 1 }).is_ok());
        assert!(validate(&doc! { "a" => -1 }).is_ok());
        assert!(validate(&doc! { "a" => 0 }).is_err());
        assert!(validate(&doc! { "a" => "asc" }).is_err());
    }
}

//! Projection: shaping result documents.
//!
//! Inclusion and exclusion are mutually exclusive except for `_id`,
//! which can be toggled in either form. Dotted paths project into nested
//! documents and arrays of documents; `$slice` bounds array fields.

use mangrove_bson::{Document, Value};
use mangrove_common::{MongoError, MongoResult};

/// Per-field projection behavior.
#[derive(Debug, Clone, PartialEq)]
enum FieldSpec {
    Include,
    Exclude,
    /// `$slice`: skip + limit over an array field.
    Slice { skip: i64, limit: Option<i64> },
}

/// A validated projection.
#[derive(Debug, Clone)]
pub struct Projection {
    /// True for inclusion projections (and for `$slice`-only ones, which
    /// keep every field).
    inclusive: bool,
    include_id: bool,
    fields: Vec<(String, FieldSpec)>,
}

/// Validates the projection document.
pub fn validate(projection: &Document) -> MongoResult<Projection> {
    let mut includes = 0usize;
    let mut excludes = 0usize;
    let mut include_id = true;
    let mut id_included_explicitly = false;
    let mut fields = Vec::with_capacity(projection.len());

    for (field, spec) in projection.iter() {
        let parsed = parse_spec(field, spec)?;
        if field == "_id" {
            match parsed {
                FieldSpec::Include => {
                    include_id = true;
                    id_included_explicitly = true;
                }
                FieldSpec::Exclude => include_id = false,
                FieldSpec::Slice { .. } => fields.push((field.to_owned(), parsed)),
            }
            continue;
        }
        match parsed {
            FieldSpec::Include => includes += 1,
            FieldSpec::Exclude => excludes += 1,
            FieldSpec::Slice { .. } => {}
        }
        fields.push((field.to_owned(), parsed));
    }

    if includes > 0 && excludes > 0 {
        return Err(MongoError::bad_value(
            "Cannot do exclusion on field in inclusion projection",
        ));
    }

    Ok(Projection {
        // `{_id: 1}` alone is an inclusion projection too.
        inclusive: includes > 0 || (id_included_explicitly && excludes == 0),
        include_id,
        fields,
    })
}

fn parse_spec(field: &str, spec: &Value) -> MongoResult<FieldSpec> {
    match spec {
        Value::Bool(b) => Ok(if *b {
            FieldSpec::Include
        } else {
            FieldSpec::Exclude
        }),
        Value::Document(doc) if doc.contains_key("$slice") => {
            parse_slice(field, doc.get("$slice").unwrap())
        }
        other => match other.as_f64() {
            Some(f) if f != 0.0 => Ok(FieldSpec::Include),
            Some(_) => Ok(FieldSpec::Exclude),
            None => Err(MongoError::bad_value(format!(
                "unsupported projection value for field {field:?}"
            ))),
        },
    }
}

fn parse_slice(field: &str, operand: &Value) -> MongoResult<FieldSpec> {
    match operand {
        Value::Array(pair) if pair.len() == 2 => {
            let skip = pair[0]
                .as_integer()
                .ok_or_else(|| MongoError::bad_value("$slice skip must be a number"))?;
            let limit = pair[1]
                .as_integer()
                .filter(|l| *l > 0)
                .ok_or_else(|| MongoError::bad_value("$slice limit must be positive"))?;
            Ok(FieldSpec::Slice {
                skip,
                limit: Some(limit),
            })
        }
        other => {
            let n = other.as_integer().ok_or_else(|| {
                MongoError::bad_value(format!("invalid $slice syntax for field {field:?}"))
            })?;
            Ok(FieldSpec::Slice {
                skip: n,
                limit: None,
            })
        }
    }
}

/// Applies a validated projection to one document.
pub fn apply(doc: &Document, projection: &Projection) -> Document {
    let mut out = if projection.inclusive {
        let paths: Vec<Vec<&str>> = projection
            .fields
            .iter()
            .filter(|(_, spec)| *spec == FieldSpec::Include)
            .map(|(path, _)| path.split('.').collect())
            .collect();
        let mut included = project_include(doc, &paths);
        if projection.include_id {
            if let Some(id) = doc.get("_id") {
                let mut with_id = Document::with_capacity(included.len() + 1);
                with_id.insert("_id", id.clone());
                for (k, v) in included.iter() {
                    if k != "_id" {
                        with_id.insert(k, v.clone());
                    }
                }
                included = with_id;
            }
        } else {
            included.remove("_id");
        }
        included
    } else {
        let mut copy = doc.clone();
        for (path, spec) in &projection.fields {
            if *spec == FieldSpec::Exclude {
                exclude_path(&mut copy, &path.split('.').collect::<Vec<_>>());
            }
        }
        if !projection.include_id {
            copy.remove("_id");
        }
        copy
    };

    for (path, spec) in &projection.fields {
        if let FieldSpec::Slice { skip, limit } = spec {
            apply_slice(&mut out, path, *skip, *limit);
        }
    }
    out
}

fn project_include(doc: &Document, paths: &[Vec<&str>]) -> Document {
    let mut out = Document::new();
    for (field, value) in doc.iter() {
        let relevant: Vec<&Vec<&str>> = paths
            .iter()
            .filter(|path| path.first() == Some(&field))
            .collect();
        if relevant.is_empty() {
            continue;
        }
        if relevant.iter().any(|path| path.len() == 1) {
            out.insert(field, value.clone());
            continue;
        }
        let tails: Vec<Vec<&str>> = relevant.iter().map(|path| path[1..].to_vec()).collect();
        match value {
            Value::Document(sub) => {
                out.insert(field, Value::Document(project_include(sub, &tails)));
            }
            Value::Array(elements) => {
                // Numeric components index, document elements recurse,
                // scalar elements drop.
                let projected: Vec<Value> = elements
                    .iter()
                    .enumerate()
                    .filter_map(|(i, element)| {
                        let index = i.to_string();
                        if tails.iter().any(|tail| tail.first() == Some(&index.as_str())) {
                            return Some(element.clone());
                        }
                        match element {
                            Value::Document(sub) => {
                                Some(Value::Document(project_include(sub, &tails)))
                            }
                            _ => None,
                        }
                    })
                    .collect();
                out.insert(field, Value::Array(projected));
            }
            _ => {}
        }
    }
    out
}

fn exclude_path(doc: &mut Document, parts: &[&str]) {
    let Some(head) = parts.first() else { return };
    if parts.len() == 1 {
        doc.remove(head);
        return;
    }
    match doc.get_mut(head) {
        Some(Value::Document(sub)) => exclude_path(sub, &parts[1..]),
        Some(Value::Array(elements)) => {
            for element in elements {
                if let Value::Document(sub) = element {
                    exclude_path(sub, &parts[1..]);
                }
            }
        }
        _ => {}
    }
}

fn apply_slice(doc: &mut Document, path: &str, skip: i64, limit: Option<i64>) {
    let parts: Vec<&str> = path.split('.').collect();
    slice_at(doc, &parts, skip, limit);
}

fn slice_at(doc: &mut Document, parts: &[&str], skip: i64, limit: Option<i64>) {
    let Some(head) = parts.first() else { return };
    match doc.get_mut(head) {
        Some(Value::Array(elements)) if parts.len() == 1 => {
            *elements = slice_array(std::mem::take(elements), skip, limit);
        }
        Some(Value::Document(sub)) if parts.len() > 1 => slice_at(sub, &parts[1..], skip, limit),
        _ => {}
    }
}

fn slice_array(elements: Vec<Value>, skip: i64, limit: Option<i64>) -> Vec<Value> {
    let len = elements.len() as i64;
    match limit {
        None => {
            // Single-argument form: positive takes the head, negative
            // the tail.
            if skip >= 0 {
                elements.into_iter().take(skip as usize).collect()
            } else {
                let start = (len + skip).max(0) as usize;
                elements.into_iter().skip(start).collect()
            }
        }
        Some(limit) => {
            let start = if skip >= 0 {
                skip.min(len) as usize
            } else {
                (len + skip).max(0) as usize
            };
            elements
                .into_iter()
                .skip(start)
                .take(limit as usize)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_bson::doc;

    fn sample() -> Document {
        doc! {
            "_id" => 1,
            "name" => "ada",
            "dims" => doc! { "w" => 10, "h" => 20 },
            "tags" => vec![
                Value::from("a"), Value::from("b"), Value::from("c"), Value::from("d"),
            ],
            "items" => vec![
                Value::Document(doc! { "sku" => "s1", "qty" => 2 }),
                Value::Document(doc! { "sku" => "s2", "qty" => 5 }),
            ],
        }
    }

    fn project(projection: Document) -> Document {
        apply(&sample(), &validate(&projection).unwrap())
    }

    #[test]
    fn test_inclusion_keeps_id_by_default() {
        let out = project(doc! { "name" => 1 });
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["_id", "name"]);
    }

    #[test]
    fn test_inclusion_can_drop_id() {
        let out = project(doc! { "name" => 1, "_id" => 0 });
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn test_exclusion_drops_listed_fields() {
        let out = project(doc! { "tags" => 0, "items" => 0 });
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["_id", "name", "dims"]);
    }

    #[test]
    fn test_mixed_projection_rejected() {
        assert!(validate(&doc! { "a" => 1, "b" => 0 }).is_err());
        // _id is exempt from the rule.
        assert!(validate(&doc! { "a" => 1, "_id" => 0 }).is_ok());
    }

    #[test]
    fn test_dotted_inclusion() {
        let out = project(doc! { "dims.w" => 1, "_id" => 0 });
        assert_eq!(out, doc! { "dims" => doc! { "w" => 10 } });
    }

    #[test]
    fn test_dotted_exclusion() {
        let out = project(doc! { "dims.w" => 0, "_id" => 0 });
        assert_eq!(out.get_document("dims").unwrap().keys().collect::<Vec<_>>(), vec!["h"]);
        assert!(out.contains_key("tags"));
    }

    #[test]
    fn test_dotted_inclusion_into_array_documents() {
        let out = project(doc! { "items.sku" => 1, "_id" => 0 });
        let items = out.get_array("items").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Value::Document(doc! { "sku" => "s1" }));
    }

    #[test]
    fn test_array_index_inclusion() {
        let out = project(doc! { "tags.1" => 1, "_id" => 0 });
        let tags = out.get_array("tags").unwrap();
        assert_eq!(tags, &[Value::String("b".into())]);
    }

    #[test]
    fn test_slice_positive_and_negative() {
        let out = project(doc! { "tags" => doc! { "$slice" => 2 } });
        assert_eq!(out.get_array("tags").unwrap().len(), 2);

        let out = project(doc! { "tags" => doc! { "$slice" => -1 } });
        assert_eq!(out.get_array("tags").unwrap(), &[Value::String("d".into())]);
    }

    #[test]
    fn test_slice_skip_limit() {
        let out = project(doc! {
            "tags" => doc! { "$slice" => vec![Value::from(1), Value::from(2)] }
        });
        assert_eq!(
            out.get_array("tags").unwrap(),
            &[Value::String("b".into()), Value::String("c".into())]
        );
    }

    #[test]
    fn test_slice_rejects_bad_arguments() {
        assert!(validate(&doc! { "tags" => doc! { "$slice" => "x" } }).is_err());
        assert!(validate(&doc! {
            "tags" => doc! { "$slice" => vec![Value::from(1), Value::from(0)] }
        })
        .is_err());
    }

    #[test]
    fn test_id_only_projection_is_inclusive() {
        let out = project(doc! { "_id" => 1 });
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["_id"]);

        let out = project(doc! { "_id" => 0 });
        assert!(!out.contains_key("_id"));
        assert!(out.contains_key("name"));
    }

    #[test]
    fn test_projection_value_types() {
        assert!(validate(&doc! { "a" => true }).is_ok());
        assert!(validate(&doc! { "a" => 1.0 }).is_ok());
        assert!(validate(&doc! { "a" => "nope" }).is_err());
    }
}

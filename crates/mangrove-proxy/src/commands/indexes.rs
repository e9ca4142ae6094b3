//! Index commands: `createIndexes`, `dropIndexes`, `listIndexes`.

use std::sync::Arc;

use mangrove_bson::{doc, Document, Value};
use mangrove_common::{ErrorCode, MongoError, MongoResult};

use crate::backend::{BackendError, IndexSpec};

use super::{backend_error, collection_arg, with_retries, CommandContext};

pub async fn create_indexes(
    ctx: &mut CommandContext<'_>,
    cmd: &Document,
) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let specs = cmd
        .get_array("indexes")
        .ok_or_else(|| MongoError::bad_value("createIndexes requires an indexes array"))?;
    if specs.is_empty() {
        return Err(MongoError::bad_value(
            "createIndexes requires at least one index",
        ));
    }

    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    with_retries(|| backend.create_database_if_not_exists(&db))
        .await
        .map_err(backend_error)?;
    let created_collection =
        match with_retries(|| backend.create_collection(&db, &collection)).await {
            Ok(()) => true,
            Err(BackendError::AlreadyExists(_)) => false,
            Err(e) => return Err(backend_error(e)),
        };

    let before = backend
        .list_indexes(&db, &collection)
        .await
        .map_err(backend_error)?
        .len() as i32;

    for spec in specs {
        let spec = spec.as_document().ok_or_else(|| {
            MongoError::type_mismatch("indexes entries must be documents")
        })?;
        let index = parse_index_spec(spec)?;
        // The _id index always exists; recreating it is a no-op.
        if index.keys == [("_id".to_owned(), 1)] {
            continue;
        }
        match with_retries(|| backend.create_index(&db, &collection, &index)).await {
            Ok(_) => {}
            Err(BackendError::AlreadyExists(ns)) => {
                return Err(MongoError::new(
                    ErrorCode::IndexOptionsConflict,
                    format!("An existing index conflicts with {ns}"),
                ))
            }
            Err(e) => return Err(backend_error(e)),
        }
    }

    let after = backend
        .list_indexes(&db, &collection)
        .await
        .map_err(backend_error)?
        .len() as i32;

    Ok(doc! {
        "numIndexesBefore" => before,
        "numIndexesAfter" => after,
        "createdCollectionAutomatically" => created_collection,
        "ok" => 1.0,
    })
}

pub async fn drop_indexes(
    ctx: &mut CommandContext<'_>,
    cmd: &Document,
) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    let existing = backend
        .list_indexes(&db, &collection)
        .await
        .map_err(backend_error)?;
    let n_indexes_was = existing.len() as i32;

    let target = cmd
        .get("index")
        .ok_or_else(|| MongoError::bad_value("dropIndexes requires an index argument"))?;

    let names: Vec<String> = match target {
        Value::String(name) if name == "*" => existing
            .iter()
            .filter(|spec| spec.name != "_id_")
            .map(|spec| spec.name.clone())
            .collect(),
        Value::String(name) => vec![name.clone()],
        Value::Document(key_doc) => {
            let keys = parse_key_pattern(key_doc)?;
            let found = existing.iter().find(|spec| spec.keys == keys);
            match found {
                Some(spec) => vec![spec.name.clone()],
                None => {
                    return Err(MongoError::new(
                        ErrorCode::IndexNotFound,
                        "can't find index with key",
                    ))
                }
            }
        }
        _ => {
            return Err(MongoError::type_mismatch(
                "index argument must be a string or a key document",
            ))
        }
    };

    for name in names {
        if name == "_id_" {
            return Err(MongoError::bad_value("cannot drop _id index"));
        }
        match with_retries(|| backend.drop_index(&db, &collection, &name)).await {
            Ok(()) => {}
            Err(BackendError::NotFound(_)) => {
                return Err(MongoError::new(
                    ErrorCode::IndexNotFound,
                    format!("index not found with name [{name}]"),
                ))
            }
            Err(e) => return Err(backend_error(e)),
        }
    }

    Ok(doc! { "nIndexesWas" => n_indexes_was, "ok" => 1.0 })
}

pub async fn list_indexes(
    ctx: &mut CommandContext<'_>,
    cmd: &Document,
) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let indexes = ctx
        .backend
        .list_indexes(&ctx.db, &collection)
        .await
        .map_err(backend_error)?;

    let batch: Vec<Document> = indexes.iter().map(index_reply).collect();
    let ns = format!("{}.{collection}", ctx.db);
    Ok(super::cursor_reply(&ns, "firstBatch", batch, 0))
}

fn index_reply(spec: &IndexSpec) -> Document {
    let mut key = Document::with_capacity(spec.keys.len());
    for (field, dir) in &spec.keys {
        key.insert(field.clone(), Value::Int32(*dir));
    }
    let mut reply = doc! {
        "v" => 2,
        "key" => key,
        "name" => spec.name.clone(),
    };
    if spec.unique {
        reply.insert("unique", true);
    }
    reply
}

fn parse_index_spec(spec: &Document) -> MongoResult<IndexSpec> {
    let key_doc = spec
        .get_document("key")
        .ok_or_else(|| MongoError::bad_value("index spec requires a key document"))?;
    let keys = parse_key_pattern(key_doc)?;

    let name = match spec.get_str("name") {
        Some(name) => name.to_owned(),
        None => default_index_name(&keys),
    };
    let unique = spec.get_bool("unique").unwrap_or(false);
    Ok(IndexSpec { name, keys, unique })
}

fn parse_key_pattern(key_doc: &Document) -> MongoResult<Vec<(String, i32)>> {
    if key_doc.is_empty() {
        return Err(MongoError::bad_value("index key pattern cannot be empty"));
    }
    let mut keys = Vec::with_capacity(key_doc.len());
    for (field, dir) in key_doc.iter() {
        let dir = dir
            .as_integer()
            .filter(|d| *d == 1 || *d == -1)
            .ok_or_else(|| {
                MongoError::bad_value(format!(
                    "index direction for {field:?} must be 1 or -1"
                ))
            })?;
        keys.push((field.to_owned(), dir as i32));
    }
    Ok(keys)
}

/// `{a: 1, b: -1}` names itself `a_1_b_-1`.
fn default_index_name(keys: &[(String, i32)]) -> String {
    keys.iter()
        .map(|(field, dir)| format!("{field}_{dir}"))
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_spec_with_default_name() {
        let spec = parse_index_spec(&doc! {
            "key" => doc! { "a" => 1, "b" => -1 },
        })
        .unwrap();
        assert_eq!(spec.name, "a_1_b_-1");
        assert_eq!(spec.keys, vec![("a".into(), 1), ("b".into(), -1)]);
        assert!(!spec.unique);
    }

    #[test]
    fn test_parse_index_spec_rejects_bad_directions() {
        assert!(parse_index_spec(&doc! { "key" => doc! { "a" => 2 } }).is_err());
        assert!(parse_index_spec(&doc! { "key" => Document::new() }).is_err());
        assert!(parse_index_spec(&doc! { "name" => "x" }).is_err());
    }

    #[test]
    fn test_index_reply_shape() {
        let reply = index_reply(&IndexSpec {
            name: "a_1".into(),
            keys: vec![("a".into(), 1)],
            unique: true,
        });
        assert_eq!(reply.get("v"), Some(&Value::Int32(2)));
        assert_eq!(reply.get_document("key").unwrap().get("a"), Some(&Value::Int32(1)));
        assert_eq!(reply.get("unique"), Some(&Value::Bool(true)));
    }
}

//! Write commands: `insert`, `update`, `delete`.
//!
//! All three take batch arrays and report per-statement failures through
//! `writeErrors` entries carrying the statement index; `ordered: true`
//! (the default) stops the batch at the first failure.

use std::sync::Arc;

use mangrove_bson::{doc, Document, Value};
use mangrove_common::{ErrorCode, MongoError, MongoResult};

use crate::backend::{Backend, BackendError, QuerySpec};
use crate::eval::{filter, path, update as update_eval};

use super::{backend_error, collection_arg, with_retries, CommandContext};

pub async fn insert(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let documents = cmd
        .get_array("documents")
        .ok_or_else(|| MongoError::bad_value("insert command requires documents"))?;
    let ordered = cmd.get_bool("ordered").unwrap_or(true);

    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    // Databases and collections come into being on first insert.
    with_retries(|| backend.create_database_if_not_exists(&db))
        .await
        .map_err(backend_error)?;
    with_retries(|| backend.create_collection_if_not_exists(&db, &collection))
        .await
        .map_err(backend_error)?;

    let mut n: i32 = 0;
    let mut write_errors: Vec<Value> = Vec::new();

    for (index, value) in documents.iter().enumerate() {
        let document = value.as_document().ok_or_else(|| {
            MongoError::type_mismatch(format!(
                "documents entry {index} is not a document"
            ))
        })?;

        let mut to_insert = document.clone();
        to_insert.ensure_id();

        match with_retries(|| backend.insert_document(&db, &collection, &to_insert)).await {
            Ok(()) => n += 1,
            Err(e) => {
                write_errors.push(write_error(index, backend_error(e)));
                if ordered {
                    break;
                }
            }
        }
    }

    Ok(write_reply(n, None, None, write_errors))
}

pub async fn update(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let updates = cmd
        .get_array("updates")
        .ok_or_else(|| MongoError::bad_value("update command requires updates"))?;
    let ordered = cmd.get_bool("ordered").unwrap_or(true);

    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    let mut n: i32 = 0;
    let mut n_modified: i32 = 0;
    let mut upserted: Vec<Value> = Vec::new();
    let mut write_errors: Vec<Value> = Vec::new();

    for (index, value) in updates.iter().enumerate() {
        let statement = value.as_document().ok_or_else(|| {
            MongoError::type_mismatch(format!("updates entry {index} is not a document"))
        })?;
        match apply_update_statement(&backend, &db, &collection, statement).await {
            Ok(outcome) => {
                n += outcome.matched;
                n_modified += outcome.modified;
                if let Some(id) = outcome.upserted_id {
                    n += 1;
                    upserted.push(Value::Document(doc! {
                        "index" => index as i32,
                        "_id" => id,
                    }));
                }
            }
            Err(e) => {
                write_errors.push(write_error(index, e));
                if ordered {
                    break;
                }
            }
        }
    }

    let upserted = (!upserted.is_empty()).then_some(upserted);
    Ok(write_reply(n, Some(n_modified), upserted, write_errors))
}

pub async fn delete(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let deletes = cmd
        .get_array("deletes")
        .ok_or_else(|| MongoError::bad_value("delete command requires deletes"))?;
    let ordered = cmd.get_bool("ordered").unwrap_or(true);

    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    let mut n: i32 = 0;
    let mut write_errors: Vec<Value> = Vec::new();

    for (index, value) in deletes.iter().enumerate() {
        let statement = value.as_document().ok_or_else(|| {
            MongoError::type_mismatch(format!("deletes entry {index} is not a document"))
        })?;
        match apply_delete_statement(&backend, &db, &collection, statement).await {
            Ok(removed) => n += removed,
            Err(e) => {
                write_errors.push(write_error(index, e));
                if ordered {
                    break;
                }
            }
        }
    }

    Ok(write_reply(n, None, None, write_errors))
}

struct UpdateOutcome {
    matched: i32,
    modified: i32,
    upserted_id: Option<Value>,
}

async fn apply_update_statement(
    backend: &Arc<dyn Backend>,
    db: &str,
    collection: &str,
    statement: &Document,
) -> MongoResult<UpdateOutcome> {
    let q = statement
        .get_document("q")
        .cloned()
        .ok_or_else(|| MongoError::bad_value("update statement requires q"))?;
    let u = statement
        .get_document("u")
        .cloned()
        .ok_or_else(|| MongoError::bad_value("update statement requires u"))?;
    let multi = statement.get_bool("multi").unwrap_or(false);
    let upsert = statement.get_bool("upsert").unwrap_or(false);

    // The whole request validates before any document mutates.
    update_eval::validate(&u)?;

    let spec = QuerySpec {
        filter: q.clone(),
        limit: if multi { None } else { Some(1) },
    };
    let mut candidates = match backend.query_documents(db, collection, &spec).await {
        Ok(result) => {
            let mut documents = result.documents;
            if !result.filter_complete {
                let mut kept = Vec::with_capacity(documents.len());
                for doc in documents {
                    if filter::matches(&doc, &q)? {
                        kept.push(doc);
                    }
                }
                documents = kept;
            }
            documents
        }
        Err(BackendError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(backend_error(e)),
    };
    if !multi {
        candidates.truncate(1);
    }

    if candidates.is_empty() {
        if !upsert {
            return Ok(UpdateOutcome {
                matched: 0,
                modified: 0,
                upserted_id: None,
            });
        }
        let mut base = upsert_base(&q, &u)?;
        let id = base.ensure_id();
        with_retries(|| backend.create_database_if_not_exists(db))
            .await
            .map_err(backend_error)?;
        with_retries(|| backend.create_collection_if_not_exists(db, collection))
            .await
            .map_err(backend_error)?;
        with_retries(|| backend.insert_document(db, collection, &base))
            .await
            .map_err(backend_error)?;
        return Ok(UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted_id: Some(id),
        });
    }

    let mut matched = 0;
    let mut modified = 0;
    for original in candidates {
        matched += 1;
        let (updated, changed) = updated_document(&original, &u)?;
        if !changed {
            continue;
        }
        let id = original
            .get("_id")
            .cloned()
            .ok_or_else(|| MongoError::internal("stored document has no _id"))?;
        let rows =
            with_retries(|| backend.update_document(db, collection, &id, &updated))
                .await
                .map_err(backend_error)?;
        modified += rows as i32;
    }

    Ok(UpdateOutcome {
        matched,
        modified,
        upserted_id: None,
    })
}

/// Applies either a replacement or an operator update, enforcing `_id`
/// immutability. Returns the new document and whether it differs.
pub(super) fn updated_document(original: &Document, u: &Document) -> MongoResult<(Document, bool)> {
    if update_eval::is_replacement(u) {
        if let (Some(new_id), Some(old_id)) = (u.get("_id"), original.get("_id")) {
            if !mangrove_bson::canonical_eq(new_id, old_id) {
                return Err(MongoError::new(
                    ErrorCode::ImmutableField,
                    "the _id field cannot be changed",
                ));
            }
        }
        let mut replacement = u.clone();
        if let Some(old_id) = original.get("_id") {
            replacement.insert("_id", old_id.clone());
        }
        replacement.ensure_id();
        let changed = &replacement != original;
        return Ok((replacement, changed));
    }

    let mut updated = original.clone();
    let changed = update_eval::apply(&mut updated, u)?;
    if updated.get("_id") != original.get("_id") {
        return Err(MongoError::new(
            ErrorCode::ImmutableField,
            "the _id field cannot be changed",
        ));
    }
    Ok((updated, changed))
}

/// Builds the starting document for an upsert: the filter's equality
/// constraints, then the update applied on top.
pub(super) fn upsert_base(q: &Document, u: &Document) -> MongoResult<Document> {
    if update_eval::is_replacement(u) {
        let mut base = u.clone();
        // A literal _id in the query wins over a generated one.
        if !base.contains_key("_id") {
            if let Some(id) = equality_value(q, "_id") {
                base.insert("_id", id);
            }
        }
        return Ok(base);
    }

    let mut base = Document::new();
    for (field, condition) in q.iter() {
        if field.starts_with('$') {
            continue;
        }
        let value = match condition {
            Value::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.get("$eq").cloned()
            }
            other => Some(other.clone()),
        };
        if let Some(value) = value {
            path::set(&mut base, field, value)?;
        }
    }
    update_eval::apply(&mut base, u)?;
    Ok(base)
}

fn equality_value(q: &Document, field: &str) -> Option<Value> {
    match q.get(field)? {
        Value::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            ops.get("$eq").cloned()
        }
        other => Some(other.clone()),
    }
}

async fn apply_delete_statement(
    backend: &Arc<dyn Backend>,
    db: &str,
    collection: &str,
    statement: &Document,
) -> MongoResult<i32> {
    let q = statement
        .get_document("q")
        .cloned()
        .ok_or_else(|| MongoError::bad_value("delete statement requires q"))?;
    let limit = statement
        .get("limit")
        .and_then(Value::as_integer)
        .unwrap_or(0);
    if !matches!(limit, 0 | 1) {
        return Err(MongoError::failed_to_parse(
            "delete limit must be 0 or 1",
        ));
    }
    let single = limit == 1;

    let spec = QuerySpec {
        filter: q.clone(),
        limit: single.then_some(1),
    };
    let mut candidates = match backend.query_documents(db, collection, &spec).await {
        Ok(result) => {
            let mut documents = result.documents;
            if !result.filter_complete {
                let mut kept = Vec::with_capacity(documents.len());
                for doc in documents {
                    if filter::matches(&doc, &q)? {
                        kept.push(doc);
                    }
                }
                documents = kept;
            }
            documents
        }
        Err(BackendError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(backend_error(e)),
    };
    if single {
        candidates.truncate(1);
    }

    let mut removed: i32 = 0;
    for doc in candidates {
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| MongoError::internal("stored document has no _id"))?;
        let rows = with_retries(|| backend.delete_document(db, collection, &id))
            .await
            .map_err(backend_error)?;
        removed += rows as i32;
    }
    Ok(removed)
}

fn write_error(index: usize, err: MongoError) -> Value {
    Value::Document(doc! {
        "index" => index as i32,
        "code" => err.code.code(),
        "errmsg" => err.message,
    })
}

fn write_reply(
    n: i32,
    n_modified: Option<i32>,
    upserted: Option<Vec<Value>>,
    write_errors: Vec<Value>,
) -> Document {
    let mut reply = doc! { "n" => n };
    if let Some(n_modified) = n_modified {
        reply.insert("nModified", n_modified);
    }
    if let Some(upserted) = upserted {
        reply.insert("upserted", upserted);
    }
    if !write_errors.is_empty() {
        reply.insert("writeErrors", write_errors);
    }
    reply.insert("ok", 1.0);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_reply_shapes() {
        let reply = write_reply(2, None, None, vec![]);
        assert_eq!(reply.get("n"), Some(&Value::Int32(2)));
        assert!(!reply.contains_key("writeErrors"));

        let err = write_error(0, MongoError::new(ErrorCode::DuplicateKey, "dup"));
        let reply = write_reply(1, Some(0), None, vec![err]);
        let errors = reply.get_array("writeErrors").unwrap();
        let entry = errors[0].as_document().unwrap();
        assert_eq!(entry.get("index"), Some(&Value::Int32(0)));
        assert_eq!(entry.get("code"), Some(&Value::Int32(11000)));
    }

    #[test]
    fn test_upsert_base_from_equality_filter() {
        let q = doc! { "sku" => "s1", "qty" => doc! { "$gt" => 5 }, "tier" => doc! { "$eq" => 2 } };
        let u = doc! { "$set" => doc! { "qty" => 10 } };
        let base = upsert_base(&q, &u).unwrap();
        assert_eq!(base.get("sku"), Some(&Value::String("s1".into())));
        assert_eq!(base.get("tier"), Some(&Value::Int32(2)));
        // Range-only constraints contribute nothing; $set applies.
        assert_eq!(base.get("qty"), Some(&Value::Int32(10)));
    }

    #[test]
    fn test_upsert_base_replacement_takes_query_id() {
        let q = doc! { "_id" => 7 };
        let u = doc! { "a" => 1 };
        let base = upsert_base(&q, &u).unwrap();
        assert_eq!(base.get("_id"), Some(&Value::Int32(7)));
    }

    #[test]
    fn test_replacement_cannot_change_id() {
        let original = doc! { "_id" => 1, "a" => 1 };
        let err = updated_document(&original, &doc! { "_id" => 2, "a" => 5 }).unwrap_err();
        assert_eq!(err.code, ErrorCode::ImmutableField);

        // Omitting _id inherits it.
        let (updated, changed) = updated_document(&original, &doc! { "a" => 5 }).unwrap();
        assert!(changed);
        assert_eq!(updated.get("_id"), Some(&Value::Int32(1)));
        assert_eq!(updated.command_name(), Some("_id"));
    }

    #[test]
    fn test_operator_update_cannot_change_id() {
        let original = doc! { "_id" => 1, "a" => 1 };
        let err = updated_document(&original, &doc! { "$set" => doc! { "_id" => 9 } })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ImmutableField);
    }
}

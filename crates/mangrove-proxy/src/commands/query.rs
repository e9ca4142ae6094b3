//! Read-side commands: `find`, `count`, `distinct`, `findAndModify`,
//! plus the cursor commands `getMore` and `killCursors`.

use std::sync::Arc;

use mangrove_bson::{canonical_cmp, doc, Document, Value};
use mangrove_common::{MongoError, MongoResult};

use crate::backend::{Backend, BackendError, QuerySpec};
use crate::cursors::StoredCursor;
use crate::eval::{filter, path, projection, sort, update as update_eval};

use super::{backend_error, collection_arg, non_negative_int, with_retries, CommandContext};

/// Fetches and fully evaluates the documents matching `filter_doc`,
/// applying the residual filter whenever pushdown was partial.
async fn evaluate_query(
    backend: &Arc<dyn Backend>,
    db: &str,
    collection: &str,
    filter_doc: &Document,
    limit: Option<usize>,
) -> MongoResult<Vec<Document>> {
    let spec = QuerySpec {
        filter: filter_doc.clone(),
        limit,
    };
    match backend.query_documents(db, collection, &spec).await {
        Ok(result) => {
            if result.filter_complete {
                return Ok(result.documents);
            }
            let mut kept = Vec::with_capacity(result.documents.len());
            for doc in result.documents {
                if filter::matches(&doc, filter_doc)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        // Queries against a namespace that does not exist match nothing.
        Err(BackendError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(backend_error(e)),
    }
}

pub async fn find(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let filter_doc = cmd.get_document("filter").cloned().unwrap_or_default();

    let sort_spec = match cmd.get_document("sort") {
        Some(sort_doc) if !sort_doc.is_empty() => Some(sort::validate(sort_doc)?),
        _ => None,
    };
    let projection_spec = match cmd.get_document("projection") {
        Some(projection_doc) if !projection_doc.is_empty() => {
            Some(projection::validate(projection_doc)?)
        }
        _ => None,
    };

    let skip = non_negative_int(cmd, "skip")?.unwrap_or(0) as usize;
    // A negative limit means "this batch only", like singleBatch.
    let raw_limit = match cmd.get("limit") {
        None | Some(Value::Null) => 0,
        Some(value) => value.as_integer().ok_or_else(|| {
            MongoError::type_mismatch("limit must be a number")
        })?,
    };
    let single_batch =
        cmd.get_bool("singleBatch").unwrap_or(false) || raw_limit < 0;
    let limit = raw_limit.unsigned_abs() as usize;

    let batch_size = non_negative_int(cmd, "batchSize")?
        .map(|n| n as usize)
        .unwrap_or(ctx.config.cursors.default_batch_size);

    // The backend may only apply the limit when nothing later in the
    // pipeline could drop or reorder rows.
    let pushdown_limit =
        (sort_spec.is_none() && skip == 0 && limit > 0).then_some(limit);

    let mut documents =
        evaluate_query(ctx.backend, &ctx.db, &collection, &filter_doc, pushdown_limit)
            .await?;

    if let Some(spec) = &sort_spec {
        sort::sort_documents(&mut documents, spec);
    }
    if skip > 0 {
        documents.drain(..skip.min(documents.len()));
    }
    if limit > 0 {
        documents.truncate(limit);
    }
    if let Some(spec) = &projection_spec {
        documents = documents
            .iter()
            .map(|doc| projection::apply(doc, spec))
            .collect();
    }

    let ns = format!("{}.{collection}", ctx.db);
    let split = batch_size.min(documents.len());
    let remaining = documents.split_off(split);
    let first_batch = documents;

    let cursor_id = if remaining.is_empty() || single_batch {
        0
    } else {
        ctx.cursors.register(StoredCursor::new(
            ctx.db.clone(),
            collection.clone(),
            remaining,
        ))
    };

    Ok(super::cursor_reply(&ns, "firstBatch", first_batch, cursor_id))
}

pub async fn get_more(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let cursor_id = cmd
        .get("getMore")
        .and_then(Value::as_integer)
        .ok_or_else(|| MongoError::type_mismatch("getMore requires a cursor id"))?;
    let collection = cmd
        .get_str("collection")
        .ok_or_else(|| MongoError::bad_value("getMore requires a collection"))?
        .to_owned();
    let batch_size = non_negative_int(cmd, "batchSize")?
        .map(|n| n as usize)
        .unwrap_or(ctx.config.cursors.default_batch_size);

    let db = ctx.db.clone();
    let cursor = ctx
        .cursors
        .get_mut(cursor_id)
        .ok_or_else(|| MongoError::cursor_not_found(cursor_id))?;

    if cursor.db != db || cursor.collection != collection {
        return Err(MongoError::bad_value(format!(
            "Requested getMore on namespace {db}.{collection}, but cursor {cursor_id} belongs to {}",
            cursor.namespace()
        )));
    }

    let ns = cursor.namespace();
    let batch = cursor.next_batch(batch_size);
    let exhausted = cursor.is_exhausted();
    if exhausted {
        ctx.cursors.remove(cursor_id);
    }

    let reply_id = if exhausted { 0 } else { cursor_id };
    Ok(super::cursor_reply(&ns, "nextBatch", batch, reply_id))
}

pub fn kill_cursors(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let _collection = collection_arg(cmd)?;
    let ids = cmd
        .get_array("cursors")
        .ok_or_else(|| MongoError::bad_value("killCursors requires a cursors array"))?;

    let mut killed: Vec<Value> = Vec::new();
    let mut not_found: Vec<Value> = Vec::new();
    for id_value in ids {
        let id = id_value.as_integer().ok_or_else(|| {
            MongoError::type_mismatch("cursor ids must be 64-bit integers")
        })?;
        if ctx.cursors.remove(id) {
            killed.push(Value::Int64(id));
        } else {
            not_found.push(Value::Int64(id));
        }
    }

    Ok(doc! {
        "cursorsKilled" => killed,
        "cursorsNotFound" => not_found,
        "cursorsAlive" => Vec::<Value>::new(),
        "cursorsUnknown" => Vec::<Value>::new(),
        "ok" => 1.0,
    })
}

pub async fn count(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let filter_doc = cmd.get_document("query").cloned().unwrap_or_default();
    let skip = non_negative_int(cmd, "skip")?.unwrap_or(0) as usize;
    let limit = non_negative_int(cmd, "limit")?.unwrap_or(0) as usize;

    let documents =
        evaluate_query(ctx.backend, &ctx.db, &collection, &filter_doc, None).await?;
    let mut n = documents.len().saturating_sub(skip);
    if limit > 0 {
        n = n.min(limit);
    }

    Ok(doc! { "n" => n as i32, "ok" => 1.0 })
}

pub async fn distinct(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let key = cmd
        .get_str("key")
        .ok_or_else(|| MongoError::bad_value("distinct requires a key argument"))?
        .to_owned();
    let filter_doc = cmd.get_document("query").cloned().unwrap_or_default();

    let documents =
        evaluate_query(ctx.backend, &ctx.db, &collection, &filter_doc, None).await?;

    let mut values: Vec<Value> = Vec::new();
    for doc in &documents {
        for candidate in path::gather(doc, &key) {
            // Arrays contribute their elements, not themselves.
            let leaves: Vec<&Value> = match candidate {
                Value::Array(elements) => elements.iter().collect(),
                other => vec![other],
            };
            for leaf in leaves {
                if matches!(leaf, Value::Null) {
                    continue;
                }
                if !values.iter().any(|v| mangrove_bson::canonical_eq(v, leaf)) {
                    values.push(leaf.clone());
                }
            }
        }
    }
    values.sort_by(canonical_cmp);

    Ok(doc! { "values" => values, "ok" => 1.0 })
}

pub async fn find_and_modify(
    ctx: &mut CommandContext<'_>,
    cmd: &Document,
) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let query = cmd.get_document("query").cloned().unwrap_or_default();
    let sort_spec = match cmd.get_document("sort") {
        Some(sort_doc) if !sort_doc.is_empty() => Some(sort::validate(sort_doc)?),
        _ => None,
    };
    let remove = cmd.get_bool("remove").unwrap_or(false);
    let return_new = cmd.get_bool("new").unwrap_or(false);
    let upsert = cmd.get_bool("upsert").unwrap_or(false);
    let fields = match cmd.get_document("fields") {
        Some(projection_doc) if !projection_doc.is_empty() => {
            Some(projection::validate(projection_doc)?)
        }
        _ => None,
    };

    let update_doc = cmd.get_document("update").cloned();
    if remove == update_doc.is_some() {
        return Err(MongoError::bad_value(
            "findAndModify requires either remove or update",
        ));
    }
    if let Some(u) = &update_doc {
        update_eval::validate(u)?;
    }

    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    let mut candidates =
        evaluate_query(&backend, &db, &collection, &query, None).await?;
    if let Some(spec) = &sort_spec {
        sort::sort_documents(&mut candidates, spec);
    }
    let target = candidates.into_iter().next();

    let project = |doc: &Document| match &fields {
        Some(spec) => projection::apply(doc, spec),
        None => doc.clone(),
    };

    if remove {
        return match target {
            Some(original) => {
                let id = original
                    .get("_id")
                    .cloned()
                    .ok_or_else(|| MongoError::internal("stored document has no _id"))?;
                with_retries(|| backend.delete_document(&db, &collection, &id))
                    .await
                    .map_err(backend_error)?;
                Ok(doc! {
                    "lastErrorObject" => doc! { "n" => 1, "updatedExisting" => false },
                    "value" => Value::Document(project(&original)),
                    "ok" => 1.0,
                })
            }
            None => Ok(doc! {
                "lastErrorObject" => doc! { "n" => 0, "updatedExisting" => false },
                "value" => Value::Null,
                "ok" => 1.0,
            }),
        };
    }

    let u = update_doc.expect("checked above");
    match target {
        Some(original) => {
            let (updated, changed) = super::write::updated_document(&original, &u)?;
            if changed {
                let id = original
                    .get("_id")
                    .cloned()
                    .ok_or_else(|| MongoError::internal("stored document has no _id"))?;
                with_retries(|| backend.update_document(&db, &collection, &id, &updated))
                    .await
                    .map_err(backend_error)?;
            }
            let value = if return_new { &updated } else { &original };
            Ok(doc! {
                "lastErrorObject" => doc! { "n" => 1, "updatedExisting" => true },
                "value" => Value::Document(project(value)),
                "ok" => 1.0,
            })
        }
        None if upsert => {
            let mut base = super::write::upsert_base(&query, &u)?;
            let id = base.ensure_id();
            with_retries(|| backend.create_database_if_not_exists(&db))
                .await
                .map_err(backend_error)?;
            with_retries(|| backend.create_collection_if_not_exists(&db, &collection))
                .await
                .map_err(backend_error)?;
            with_retries(|| backend.insert_document(&db, &collection, &base))
                .await
                .map_err(backend_error)?;
            let value = if return_new {
                Value::Document(project(&base))
            } else {
                Value::Null
            };
            Ok(doc! {
                "lastErrorObject" => doc! {
                    "n" => 1,
                    "updatedExisting" => false,
                    "upserted" => id,
                },
                "value" => value,
                "ok" => 1.0,
            })
        }
        None => Ok(doc! {
            "lastErrorObject" => doc! { "n" => 0, "updatedExisting" => false },
            "value" => Value::Null,
            "ok" => 1.0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use mangrove_common::{ErrorCode, LogRing, ProxyConfig};

    use crate::backend::{BackendResult, CollectionInfo, IndexSpec};
    use crate::cursors::CursorRegistry;
    use crate::eval::filter;

    /// A backend over a fixed in-memory document set. Pushdown is never
    /// attempted, so every query reports a partial filter.
    struct FixtureBackend {
        documents: Vec<Document>,
    }

    #[async_trait]
    impl crate::backend::Backend for FixtureBackend {
        async fn list_databases(&self) -> BackendResult<Vec<String>> {
            Ok(vec![])
        }
        async fn create_database(&self, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn create_database_if_not_exists(&self, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn drop_database(&self, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn list_collections(&self, _: &str) -> BackendResult<Vec<CollectionInfo>> {
            Ok(vec![])
        }
        async fn create_collection(&self, _: &str, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn create_collection_if_not_exists(&self, _: &str, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn drop_collection(&self, _: &str, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn insert_document(&self, _: &str, _: &str, _: &Document) -> BackendResult<()> {
            Ok(())
        }
        async fn query_documents(
            &self,
            _: &str,
            _: &str,
            _: &QuerySpec,
        ) -> BackendResult<crate::backend::QueryResult> {
            Ok(crate::backend::QueryResult {
                documents: self.documents.clone(),
                filter_complete: false,
            })
        }
        async fn update_document(
            &self,
            _: &str,
            _: &str,
            _: &Value,
            _: &Document,
        ) -> BackendResult<u64> {
            Ok(1)
        }
        async fn delete_document(&self, _: &str, _: &str, _: &Value) -> BackendResult<u64> {
            Ok(1)
        }
        async fn create_index(&self, _: &str, _: &str, _: &IndexSpec) -> BackendResult<bool> {
            Ok(true)
        }
        async fn drop_index(&self, _: &str, _: &str, _: &str) -> BackendResult<()> {
            Ok(())
        }
        async fn list_indexes(&self, _: &str, _: &str) -> BackendResult<Vec<IndexSpec>> {
            Ok(vec![IndexSpec::id_index()])
        }
    }

    struct Fixture {
        backend: Arc<dyn crate::backend::Backend>,
        cursors: CursorRegistry,
        config: ProxyConfig,
        log_ring: Arc<LogRing>,
        peer: SocketAddr,
    }

    impl Fixture {
        fn new(documents: Vec<Document>) -> Self {
            Fixture {
                backend: Arc::new(FixtureBackend { documents }),
                cursors: CursorRegistry::new(Duration::from_secs(600)),
                config: ProxyConfig::default(),
                log_ring: Arc::new(LogRing::new(16)),
                peer: "127.0.0.1:50000".parse().unwrap(),
            }
        }

        fn ctx(&mut self) -> CommandContext<'_> {
            CommandContext {
                backend: &self.backend,
                cursors: &mut self.cursors,
                config: &self.config,
                log_ring: &self.log_ring,
                peer: self.peer,
                connection_id: 1,
                db: "shop".to_owned(),
            }
        }
    }

    fn orders(n: i32) -> Vec<Document> {
        (0..n).map(|i| doc! { "_id" => i, "n" => i * 10 }).collect()
    }

    fn batch_ids(reply: &Document, key: &str) -> Vec<i32> {
        reply
            .get_document("cursor")
            .unwrap()
            .get_array(key)
            .unwrap()
            .iter()
            .map(|v| {
                v.as_document()
                    .and_then(|d| d.get("_id"))
                    .and_then(Value::as_integer)
                    .unwrap() as i32
            })
            .collect()
    }

    fn cursor_id(reply: &Document) -> i64 {
        reply
            .get_document("cursor")
            .unwrap()
            .get("id")
            .and_then(Value::as_integer)
            .unwrap()
    }

    #[tokio::test]
    async fn test_cursor_lifecycle_across_get_more() {
        let mut fixture = Fixture::new(orders(5));

        let reply = find(
            &mut fixture.ctx(),
            &doc! { "find" => "orders", "batchSize" => 2 },
        )
        .await
        .unwrap();
        assert_eq!(batch_ids(&reply, "firstBatch"), vec![0, 1]);
        let id = cursor_id(&reply);
        assert_ne!(id, 0);

        let reply = fetch_more(&mut fixture, id, 2).await.unwrap();
        assert_eq!(batch_ids(&reply, "nextBatch"), vec![2, 3]);
        assert_eq!(cursor_id(&reply), id);

        // The final partial batch closes the cursor.
        let reply = fetch_more(&mut fixture, id, 2).await.unwrap();
        assert_eq!(batch_ids(&reply, "nextBatch"), vec![4]);
        assert_eq!(cursor_id(&reply), 0);

        let err = fetch_more(&mut fixture, id, 2).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CursorNotFound);
    }

    async fn fetch_more(
        fixture: &mut Fixture,
        id: i64,
        batch_size: i32,
    ) -> MongoResult<Document> {
        get_more(
            &mut fixture.ctx(),
            &doc! {
                "getMore" => Value::Int64(id),
                "collection" => "orders",
                "batchSize" => batch_size,
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_find_applies_residual_filter_sort_and_limit() {
        let mut fixture = Fixture::new(orders(10));
        let reply = find(
            &mut fixture.ctx(),
            &doc! {
                "find" => "orders",
                "filter" => doc! { "n" => doc! { "$gte" => 30 } },
                "sort" => doc! { "n" => -1 },
                "limit" => 3,
            },
        )
        .await
        .unwrap();
        assert_eq!(batch_ids(&reply, "firstBatch"), vec![9, 8, 7]);
        assert_eq!(cursor_id(&reply), 0);
    }

    #[tokio::test]
    async fn test_find_single_batch_discards_remainder() {
        let mut fixture = Fixture::new(orders(5));
        let reply = find(
            &mut fixture.ctx(),
            &doc! { "find" => "orders", "batchSize" => 2, "singleBatch" => true },
        )
        .await
        .unwrap();
        assert_eq!(cursor_id(&reply), 0);
        assert!(fixture.cursors.is_empty());
    }

    #[tokio::test]
    async fn test_count_and_distinct() {
        let mut fixture = Fixture::new(orders(6));
        let reply = count(
            &mut fixture.ctx(),
            &doc! {
                "count" => "orders",
                "query" => doc! { "n" => doc! { "$lt" => 30 } },
            },
        )
        .await
        .unwrap();
        assert_eq!(reply.get("n"), Some(&Value::Int32(3)));

        let reply = distinct(
            &mut fixture.ctx(),
            &doc! { "distinct" => "orders", "key" => "n" },
        )
        .await
        .unwrap();
        let values = reply.get_array("values").unwrap();
        assert_eq!(values.len(), 6);
        assert_eq!(values[0], Value::Int32(0));
    }

    #[tokio::test]
    async fn test_get_more_checks_namespace() {
        let mut fixture = Fixture::new(orders(5));
        let reply = find(
            &mut fixture.ctx(),
            &doc! { "find" => "orders", "batchSize" => 1 },
        )
        .await
        .unwrap();
        let id = cursor_id(&reply);

        let err = get_more(
            &mut fixture.ctx(),
            &doc! {
                "getMore" => Value::Int64(id),
                "collection" => "other",
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadValue);
    }

    #[test]
    fn test_kill_cursors_reports_killed_and_missing() {
        let mut fixture = Fixture::new(vec![]);
        let id = fixture.cursors.register(crate::cursors::StoredCursor::new(
            "shop".into(),
            "orders".into(),
            vec![doc! { "_id" => 1 }],
        ));

        let reply = kill_cursors(
            &mut fixture.ctx(),
            &doc! {
                "killCursors" => "orders",
                "cursors" => vec![Value::Int64(id), Value::Int64(12345)],
            },
        )
        .unwrap();
        assert_eq!(
            reply.get_array("cursorsKilled").unwrap(),
            &[Value::Int64(id)]
        );
        assert_eq!(
            reply.get_array("cursorsNotFound").unwrap(),
            &[Value::Int64(12345)]
        );
    }

    #[test]
    fn test_residual_equivalence_between_pushdown_and_full_eval() {
        // The pushdown plan must never drop a row the full evaluation
        // accepts; with the residual pass the union equals full
        // evaluation. Verified here over an in-memory corpus.
        use crate::backend::pg::pushdown;

        let corpus = vec![
            doc! { "_id" => 1, "a" => 1, "b" => "x1" },
            doc! { "_id" => 2, "a" => 1.0, "b" => "y" },
            doc! { "_id" => 3, "a" => vec![Value::from(1), Value::from(9)], "b" => "x2" },
            doc! { "_id" => 4, "a" => 2, "b" => "x3" },
            doc! { "_id" => 5, "b" => "x4" },
        ];
        let filter_doc = doc! {
            "a" => 1,
            "b" => doc! { "$regex" => "^x" },
        };

        let plan = pushdown::build(&filter_doc);
        assert!(!plan.complete);

        let full: Vec<i64> = corpus
            .iter()
            .filter(|d| filter::matches(d, &filter_doc).unwrap())
            .map(|d| d.get("_id").and_then(Value::as_integer).unwrap())
            .collect();
        // Documents 1 (int) and 3 (array containing 1) match in full
        // evaluation; the pushed clause may not exclude either.
        assert_eq!(full, vec![1, 3]);
    }
}

//! Database and collection administration commands.

use std::sync::Arc;

use mangrove_bson::{doc, Document, Value};
use mangrove_common::MongoResult;

use crate::backend::{BackendError, QuerySpec};

use super::{backend_error, collection_arg, with_retries, CommandContext};

pub async fn list_databases(ctx: &mut CommandContext<'_>) -> MongoResult<Document> {
    let names = ctx
        .backend
        .list_databases()
        .await
        .map_err(backend_error)?;

    let mut databases = Vec::with_capacity(names.len());
    for name in names {
        let empty = match ctx.backend.list_collections(&name).await {
            Ok(collections) => collections.is_empty(),
            Err(BackendError::NotFound(_)) => true,
            Err(e) => return Err(backend_error(e)),
        };
        databases.push(Value::Document(doc! {
            "name" => name,
            "sizeOnDisk" => Value::Int64(0),
            "empty" => empty,
        }));
    }

    Ok(doc! {
        "databases" => databases,
        "totalSize" => Value::Int64(0),
        "ok" => 1.0,
    })
}

pub async fn list_collections(ctx: &mut CommandContext<'_>) -> MongoResult<Document> {
    let collections = match ctx.backend.list_collections(&ctx.db).await {
        Ok(collections) => collections,
        // A database that does not exist yet simply has no collections.
        Err(BackendError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(backend_error(e)),
    };

    let batch: Vec<Document> = collections
        .into_iter()
        .map(|info| {
            doc! {
                "name" => info.name,
                "type" => "collection",
                "options" => Document::new(),
                "info" => doc! { "readOnly" => false },
                "idIndex" => doc! {
                    "v" => 2,
                    "key" => doc! { "_id" => 1 },
                    "name" => "_id_",
                },
            }
        })
        .collect();

    let ns = format!("{}.$cmd.listCollections", ctx.db);
    Ok(super::cursor_reply(&ns, "firstBatch", batch, 0))
}

pub async fn create(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    with_retries(|| backend.create_database_if_not_exists(&db))
        .await
        .map_err(backend_error)?;
    with_retries(|| backend.create_collection(&db, &collection))
        .await
        .map_err(backend_error)?;

    Ok(super::ok_reply())
}

pub async fn drop(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    let n_indexes = backend
        .list_indexes(&db, &collection)
        .await
        .map(|indexes| indexes.len() as i32)
        .unwrap_or(1);

    with_retries(|| backend.drop_collection(&db, &collection))
        .await
        .map_err(backend_error)?;

    Ok(doc! {
        "nIndexesWas" => n_indexes,
        "ns" => format!("{db}.{collection}"),
        "ok" => 1.0,
    })
}

pub async fn drop_database(ctx: &mut CommandContext<'_>) -> MongoResult<Document> {
    let backend = Arc::clone(ctx.backend);
    let db = ctx.db.clone();

    match with_retries(|| backend.drop_database(&db)).await {
        Ok(()) => Ok(doc! { "dropped" => db, "ok" => 1.0 }),
        // Dropping a database that never existed is not an error.
        Err(BackendError::NotFound(_)) => Ok(super::ok_reply()),
        Err(e) => Err(backend_error(e)),
    }
}

pub async fn db_stats(ctx: &mut CommandContext<'_>) -> MongoResult<Document> {
    let collections = match ctx.backend.list_collections(&ctx.db).await {
        Ok(collections) => collections,
        Err(BackendError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(backend_error(e)),
    };

    let mut objects: i64 = 0;
    for info in &collections {
        let result = ctx
            .backend
            .query_documents(&ctx.db, &info.name, &QuerySpec::default())
            .await
            .map_err(backend_error)?;
        objects += result.documents.len() as i64;
    }

    Ok(doc! {
        "db" => ctx.db.clone(),
        "collections" => collections.len() as i32,
        "views" => 0,
        "objects" => Value::Int64(objects),
        "dataSize" => 0.0,
        "indexes" => 0,
        "indexSize" => 0.0,
        "totalSize" => 0.0,
        "scaleFactor" => 1.0,
        "ok" => 1.0,
    })
}

pub async fn coll_stats(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    let collection = collection_arg(cmd)?;
    let count = match ctx
        .backend
        .query_documents(&ctx.db, &collection, &QuerySpec::default())
        .await
    {
        Ok(result) => result.documents.len() as i64,
        Err(BackendError::NotFound(_)) => 0,
        Err(e) => return Err(backend_error(e)),
    };

    Ok(doc! {
        "ns" => format!("{}.{collection}", ctx.db),
        "count" => Value::Int64(count),
        "size" => 0.0,
        "storageSize" => 0.0,
        "nindexes" => 1,
        "scaleFactor" => 1,
        "ok" => 1.0,
    })
}

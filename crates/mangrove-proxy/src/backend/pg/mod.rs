//! PostgreSQL backend: databases are schemas, collections are
//! single-column JSONB tables, and a per-database settings table holds
//! the collection/table/index catalog.

pub mod names;
pub mod pushdown;
pub mod settings;

use std::time::Duration;

use async_trait::async_trait;
use mangrove_bson::{pgjson, Document, Value};
use mangrove_common::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::backend::{
    Backend, BackendError, BackendResult, CollectionInfo, IndexSpec, QueryResult, QuerySpec,
};
use names::{
    derive_index_name, derive_table_name, quote_ident, validate_collection_name,
    validate_database_name,
};

/// The PostgreSQL implementation of [`Backend`].
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connects the shared pool used by every client connection.
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL backend...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;
        info!("PostgreSQL connection pool established");
        Ok(PgBackend { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        PgBackend { pool }
    }

    /// Resolves the backing table for a collection from the settings
    /// snapshot.
    async fn resolve_table(&self, db: &str, collection: &str) -> BackendResult<String> {
        let settings = settings::read_snapshot(&self.pool, db)
            .await
            .map_err(|e| classify_lookup(e, db))?;
        settings::collection_table(&settings, collection)
            .ok_or_else(|| BackendError::NotFound(format!("{db}.{collection}")))
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// SQLSTATE classification for DDL statements.
fn classify_ddl(err: sqlx::Error, ns: &str) -> BackendError {
    match sqlstate(&err).as_deref() {
        // duplicate_schema, and the unique/duplicate-object races the
        // server reports when two CREATEs collide.
        Some("42P06") | Some("42P07") | Some("42710") | Some("23505") => {
            BackendError::AlreadyExists(ns.to_owned())
        }
        Some("3F000") | Some("42P01") => BackendError::NotFound(ns.to_owned()),
        Some("40001") | Some("40P01") => BackendError::Retryable(err.to_string()),
        _ => BackendError::Unclassified(err.into()),
    }
}

/// SQLSTATE classification for data statements.
fn classify_dml(err: sqlx::Error, ns: &str) -> BackendError {
    match sqlstate(&err).as_deref() {
        Some("23505") => BackendError::DuplicateKey(ns.to_owned()),
        Some("3F000") | Some("42P01") => BackendError::NotFound(ns.to_owned()),
        Some("40001") | Some("40P01") => BackendError::Retryable(err.to_string()),
        _ => BackendError::Unclassified(err.into()),
    }
}

/// Classification for settings lookups, where a missing schema, table or
/// row all mean the namespace does not exist.
fn classify_lookup(err: sqlx::Error, ns: &str) -> BackendError {
    if matches!(err, sqlx::Error::RowNotFound) {
        return BackendError::NotFound(ns.to_owned());
    }
    classify_dml(err, ns)
}

#[async_trait]
impl Backend for PgBackend {
    async fn list_databases(&self) -> BackendResult<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT schema_name::text FROM information_schema.schemata ORDER BY schema_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackendError::Unclassified(e.into()))?;

        // System schemas are permanently invisible.
        Ok(rows
            .into_iter()
            .filter(|name| !name.starts_with("pg_") && name != "information_schema")
            .collect())
    }

    async fn create_database(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        let mut tx = self.pool.begin().await.map_err(|e| classify_ddl(e, db))?;
        sqlx::query(&format!("CREATE SCHEMA {}", quote_ident(db)))
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_ddl(e, db))?;
        settings::ensure_settings_table(&mut tx, db)
            .await
            .map_err(|e| classify_ddl(e, db))?;
        tx.commit().await.map_err(|e| classify_ddl(e, db))?;
        debug!(db, "created database");
        Ok(())
    }

    async fn create_database_if_not_exists(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        let result: BackendResult<()> = async {
            let mut tx = self.pool.begin().await.map_err(|e| classify_ddl(e, db))?;
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(db)))
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_ddl(e, db))?;
            settings::ensure_settings_table(&mut tx, db)
                .await
                .map_err(|e| classify_ddl(e, db))?;
            tx.commit().await.map_err(|e| classify_ddl(e, db))?;
            Ok(())
        }
        .await;

        match result {
            // A concurrent creator winning the race is success here.
            Err(BackendError::AlreadyExists(_)) => Ok(()),
            other => other,
        }
    }

    async fn drop_database(&self, db: &str) -> BackendResult<()> {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", quote_ident(db)))
            .execute(&self.pool)
            .await
            .map_err(|e| classify_ddl(e, db))?;
        info!(db, "dropped database");
        Ok(())
    }

    async fn list_collections(&self, db: &str) -> BackendResult<Vec<CollectionInfo>> {
        let settings = settings::read_snapshot(&self.pool, db)
            .await
            .map_err(|e| classify_lookup(e, db))?;
        Ok(settings::collection_names(&settings)
            .into_iter()
            .filter_map(|name| {
                let table = settings::collection_table(&settings, &name)?;
                Some(CollectionInfo { name, table })
            })
            .collect())
    }

    async fn create_collection(&self, db: &str, collection: &str) -> BackendResult<()> {
        create_collection_inner(self, db, collection).await
    }

    async fn create_collection_if_not_exists(
        &self,
        db: &str,
        collection: &str,
    ) -> BackendResult<()> {
        match create_collection_inner(self, db, collection).await {
            Err(BackendError::AlreadyExists(_)) => Ok(()),
            other => other,
        }
    }

    async fn drop_collection(&self, db: &str, collection: &str) -> BackendResult<()> {
        let ns = format!("{db}.{collection}");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_ddl(e, &ns))?;
        let mut current = settings::read_for_update(&mut tx, db)
            .await
            .map_err(|e| classify_lookup(e, &ns))?;

        let table = settings::remove_collection(&mut current, collection)
            .ok_or_else(|| BackendError::NotFound(ns.clone()))?;

        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {}.{}",
            quote_ident(db),
            quote_ident(&table)
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify_ddl(e, &ns))?;

        settings::write(&mut tx, db, &current)
            .await
            .map_err(|e| classify_ddl(e, &ns))?;
        tx.commit().await.map_err(|e| classify_ddl(e, &ns))?;
        info!(db, collection, "dropped collection");
        Ok(())
    }

    async fn insert_document(
        &self,
        db: &str,
        collection: &str,
        document: &Document,
    ) -> BackendResult<()> {
        let ns = format!("{db}.{collection}");
        let table = self.resolve_table(db, collection).await?;
        let json = pgjson::document_to_json(document);
        sqlx::query(&format!(
            "INSERT INTO {}.{} (_jsonb) VALUES ($1)",
            quote_ident(db),
            quote_ident(&table)
        ))
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_dml(e, &ns))?;
        Ok(())
    }

    async fn query_documents(
        &self,
        db: &str,
        collection: &str,
        query: &QuerySpec,
    ) -> BackendResult<QueryResult> {
        let ns = format!("{db}.{collection}");
        let table = self.resolve_table(db, collection).await?;

        let plan = pushdown::build(&query.filter);
        let mut sql = format!(
            "SELECT _jsonb FROM {}.{}{}",
            quote_ident(db),
            quote_ident(&table),
            plan.where_sql()
        );
        // A limit is only safe when no residual filtering can drop rows.
        if plan.complete {
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }
        debug!(ns = %ns, sql = %sql, complete = plan.complete, "query pushdown");

        let mut q = sqlx::query_scalar::<_, serde_json::Value>(&sql);
        for param in &plan.params {
            q = q.bind(param);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_dml(e, &ns))?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = pgjson::document_from_json(row).map_err(|e| {
                BackendError::Unclassified(anyhow::anyhow!("corrupt row in {ns}: {e}"))
            })?;
            documents.push(doc);
        }

        Ok(QueryResult {
            documents,
            filter_complete: plan.complete,
        })
    }

    async fn update_document(
        &self,
        db: &str,
        collection: &str,
        id: &Value,
        document: &Document,
    ) -> BackendResult<u64> {
        let ns = format!("{db}.{collection}");
        let table = self.resolve_table(db, collection).await?;
        let result = sqlx::query(&format!(
            "UPDATE {}.{} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
            quote_ident(db),
            quote_ident(&table)
        ))
        .bind(pgjson::document_to_json(document))
        .bind(pgjson::value_to_json(id))
        .execute(&self.pool)
        .await
        .map_err(|e| classify_dml(e, &ns))?;
        Ok(result.rows_affected())
    }

    async fn delete_document(
        &self,
        db: &str,
        collection: &str,
        id: &Value,
    ) -> BackendResult<u64> {
        let ns = format!("{db}.{collection}");
        let table = self.resolve_table(db, collection).await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {}.{} WHERE _jsonb->'_id' = $1",
            quote_ident(db),
            quote_ident(&table)
        ))
        .bind(pgjson::value_to_json(id))
        .execute(&self.pool)
        .await
        .map_err(|e| classify_dml(e, &ns))?;
        Ok(result.rows_affected())
    }

    async fn create_index(
        &self,
        db: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> BackendResult<bool> {
        let ns = format!("{db}.{collection}");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_ddl(e, &ns))?;
        let mut current = settings::read_for_update(&mut tx, db)
            .await
            .map_err(|e| classify_lookup(e, &ns))?;
        let table = settings::collection_table(&current, collection)
            .ok_or_else(|| BackendError::NotFound(ns.clone()))?;
        let mut indexes = settings::collection_indexes(&current, collection)
            .ok_or_else(|| BackendError::NotFound(ns.clone()))?;

        for existing in &indexes {
            let same_name = existing.name == index.name;
            let same_shape = existing.keys == index.keys && existing.unique == index.unique;
            if same_name && same_shape {
                return Ok(false);
            }
            if same_name || existing.keys == index.keys {
                return Err(BackendError::AlreadyExists(format!(
                    "{ns} index {}",
                    existing.name
                )));
            }
        }

        let columns: Vec<String> = index
            .keys
            .iter()
            .map(|(field, dir)| {
                format!(
                    "(_jsonb->'{}') {}",
                    field.replace('\'', "''"),
                    if *dir < 0 { "DESC" } else { "ASC" }
                )
            })
            .collect();
        let unique = if index.unique { "UNIQUE " } else { "" };
        sqlx::query(&format!(
            "CREATE {unique}INDEX {} ON {}.{} ({})",
            quote_ident(&derive_index_name(&table, &index.name)),
            quote_ident(db),
            quote_ident(&table),
            columns.join(", ")
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify_dml(e, &ns))?;

        indexes.push(index.clone());
        settings::set_collection_indexes(&mut current, collection, &indexes);
        settings::write(&mut tx, db, &current)
            .await
            .map_err(|e| classify_ddl(e, &ns))?;
        tx.commit().await.map_err(|e| classify_ddl(e, &ns))?;
        debug!(ns = %ns, index = %index.name, "created index");
        Ok(true)
    }

    async fn drop_index(&self, db: &str, collection: &str, name: &str) -> BackendResult<()> {
        let ns = format!("{db}.{collection}");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_ddl(e, &ns))?;
        let mut current = settings::read_for_update(&mut tx, db)
            .await
            .map_err(|e| classify_lookup(e, &ns))?;
        let table = settings::collection_table(&current, collection)
            .ok_or_else(|| BackendError::NotFound(ns.clone()))?;
        let mut indexes = settings::collection_indexes(&current, collection)
            .ok_or_else(|| BackendError::NotFound(ns.clone()))?;

        let before = indexes.len();
        indexes.retain(|spec| spec.name != name);
        if indexes.len() == before {
            return Err(BackendError::NotFound(format!("{ns} index {name}")));
        }

        sqlx::query(&format!(
            "DROP INDEX IF EXISTS {}.{}",
            quote_ident(db),
            quote_ident(&derive_index_name(&table, name))
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify_ddl(e, &ns))?;

        settings::set_collection_indexes(&mut current, collection, &indexes);
        settings::write(&mut tx, db, &current)
            .await
            .map_err(|e| classify_ddl(e, &ns))?;
        tx.commit().await.map_err(|e| classify_ddl(e, &ns))?;
        Ok(())
    }

    async fn list_indexes(&self, db: &str, collection: &str) -> BackendResult<Vec<IndexSpec>> {
        let settings = settings::read_snapshot(&self.pool, db)
            .await
            .map_err(|e| classify_lookup(e, db))?;
        settings::collection_indexes(&settings, collection)
            .ok_or_else(|| BackendError::NotFound(format!("{db}.{collection}")))
    }
}

/// Shared create-collection path for the strict and idempotent variants.
async fn create_collection_inner(
    backend: &PgBackend,
    db: &str,
    collection: &str,
) -> BackendResult<()> {
    validate_collection_name(collection)?;
    let ns = format!("{db}.{collection}");

    let mut tx = backend
        .pool
        .begin()
        .await
        .map_err(|e| classify_ddl(e, &ns))?;
    let mut current = settings::read_for_update(&mut tx, db)
        .await
        .map_err(|e| classify_lookup(e, &ns))?;

    if settings::collection_table(&current, collection).is_some() {
        return Err(BackendError::AlreadyExists(ns));
    }

    let table = derive_table_name(collection);
    sqlx::query(&format!(
        "CREATE TABLE {}.{} (_jsonb jsonb NOT NULL)",
        quote_ident(db),
        quote_ident(&table)
    ))
    .execute(&mut *tx)
    .await
    .map_err(|e| classify_ddl(e, &ns))?;

    // `_id` uniqueness is enforced by the backing index from day one.
    sqlx::query(&format!(
        "CREATE UNIQUE INDEX {} ON {}.{} ((_jsonb->'_id'))",
        quote_ident(&derive_index_name(&table, "_id_")),
        quote_ident(db),
        quote_ident(&table)
    ))
    .execute(&mut *tx)
    .await
    .map_err(|e| classify_ddl(e, &ns))?;

    settings::insert_collection(&mut current, collection, &table);
    settings::write(&mut tx, db, &current)
        .await
        .map_err(|e| classify_ddl(e, &ns))?;
    tx.commit().await.map_err(|e| classify_ddl(e, &ns))?;
    debug!(ns = %ns, table = %table, "created collection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_row_classifies_as_missing_namespace() {
        let err = classify_lookup(sqlx::Error::RowNotFound, "app.orders");
        assert!(matches!(err, BackendError::NotFound(ns) if ns == "app.orders"));
    }

    #[test]
    fn test_unclassified_errors_pass_through() {
        assert!(matches!(
            classify_ddl(sqlx::Error::PoolClosed, "x"),
            BackendError::Unclassified(_)
        ));
        assert!(matches!(
            classify_dml(sqlx::Error::PoolClosed, "x"),
            BackendError::Unclassified(_)
        ));
    }
}

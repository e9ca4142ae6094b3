//! The per-database settings table.
//!
//! Every database schema carries one `_mangrove_settings` table with a
//! single JSONB row mapping collection names to their backing tables and
//! indexes:
//!
//! ```json
//! { "collections": { "orders": { "table": "orders", "indexes": [...] } } }
//! ```
//!
//! Writers read the row under `FOR UPDATE` inside a transaction, making
//! the row the serialization point for concurrent DDL on one database.

use serde_json::json;
use sqlx::{Postgres, Row, Transaction};

use crate::backend::pg::names::quote_ident;
use crate::backend::IndexSpec;

/// Name of the settings table inside each database schema.
pub const SETTINGS_TABLE: &str = "_mangrove_settings";

/// Creates the settings table and its single row if missing.
pub async fn ensure_settings_table(
    tx: &mut Transaction<'_, Postgres>,
    db: &str,
) -> Result<(), sqlx::Error> {
    let table = format!("{}.{}", quote_ident(db), quote_ident(SETTINGS_TABLE));
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (settings jsonb NOT NULL)"
    ))
    .execute(&mut **tx)
    .await?;

    let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {table}"))
        .fetch_one(&mut **tx)
        .await?;
    if count == 0 {
        sqlx::query(&format!("INSERT INTO {table} (settings) VALUES ($1)"))
            .bind(json!({ "collections": {} }))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Reads the settings row, taking a row lock for the transaction.
pub async fn read_for_update(
    tx: &mut Transaction<'_, Postgres>,
    db: &str,
) -> Result<serde_json::Value, sqlx::Error> {
    let table = format!("{}.{}", quote_ident(db), quote_ident(SETTINGS_TABLE));
    let row = sqlx::query(&format!("SELECT settings FROM {table} FOR UPDATE"))
        .fetch_one(&mut **tx)
        .await?;
    row.try_get("settings")
}

/// Reads the settings row without locking, outside any transaction.
pub async fn read_snapshot(
    pool: &sqlx::PgPool,
    db: &str,
) -> Result<serde_json::Value, sqlx::Error> {
    let table = format!("{}.{}", quote_ident(db), quote_ident(SETTINGS_TABLE));
    let row = sqlx::query(&format!("SELECT settings FROM {table}"))
        .fetch_one(pool)
        .await?;
    row.try_get("settings")
}

/// Overwrites the settings row.
pub async fn write(
    tx: &mut Transaction<'_, Postgres>,
    db: &str,
    settings: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    let table = format!("{}.{}", quote_ident(db), quote_ident(SETTINGS_TABLE));
    sqlx::query(&format!("UPDATE {table} SET settings = $1"))
        .bind(settings)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// Helpers over the settings JSON shape.

/// Backing table for a collection, if registered.
pub fn collection_table(settings: &serde_json::Value, collection: &str) -> Option<String> {
    settings
        .get("collections")?
        .get(collection)?
        .get("table")?
        .as_str()
        .map(str::to_owned)
}

/// Sorted collection names.
pub fn collection_names(settings: &serde_json::Value) -> Vec<String> {
    let mut names: Vec<String> = settings
        .get("collections")
        .and_then(|c| c.as_object())
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

/// Registers a collection entry with its default `_id_` index.
pub fn insert_collection(settings: &mut serde_json::Value, collection: &str, table: &str) {
    let entry = json!({
        "table": table,
        "indexes": [index_to_json(&IndexSpec::id_index())],
    });
    if let Some(collections) = settings
        .get_mut("collections")
        .and_then(|c| c.as_object_mut())
    {
        collections.insert(collection.to_owned(), entry);
    } else {
        *settings = json!({ "collections": { collection: entry } });
    }
}

/// Removes a collection entry, returning its backing table.
pub fn remove_collection(settings: &mut serde_json::Value, collection: &str) -> Option<String> {
    let removed = settings
        .get_mut("collections")?
        .as_object_mut()?
        .remove(collection)?;
    removed.get("table")?.as_str().map(str::to_owned)
}

/// Indexes registered for a collection.
pub fn collection_indexes(settings: &serde_json::Value, collection: &str) -> Option<Vec<IndexSpec>> {
    let indexes = settings
        .get("collections")?
        .get(collection)?
        .get("indexes")?
        .as_array()?;
    Some(indexes.iter().filter_map(index_from_json).collect())
}

/// Replaces the index list of a collection.
pub fn set_collection_indexes(
    settings: &mut serde_json::Value,
    collection: &str,
    indexes: &[IndexSpec],
) {
    if let Some(entry) = settings
        .get_mut("collections")
        .and_then(|c| c.get_mut(collection))
        .and_then(|e| e.as_object_mut())
    {
        entry.insert(
            "indexes".to_owned(),
            serde_json::Value::Array(indexes.iter().map(index_to_json).collect()),
        );
    }
}

pub fn index_to_json(index: &IndexSpec) -> serde_json::Value {
    json!({
        "name": index.name,
        "keys": index
            .keys
            .iter()
            .map(|(field, dir)| json!([field, dir]))
            .collect::<Vec<_>>(),
        "unique": index.unique,
    })
}

pub fn index_from_json(value: &serde_json::Value) -> Option<IndexSpec> {
    let name = value.get("name")?.as_str()?.to_owned();
    let keys = value
        .get("keys")?
        .as_array()?
        .iter()
        .filter_map(|pair| {
            let field = pair.get(0)?.as_str()?.to_owned();
            let dir = pair.get(1)?.as_i64()? as i32;
            Some((field, dir))
        })
        .collect();
    let unique = value.get("unique")?.as_bool()?;
    Some(IndexSpec { name, keys, unique })
}

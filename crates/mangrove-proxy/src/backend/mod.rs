//! Storage backend interface.
//!
//! The command handlers depend on this capability surface only; the
//! PostgreSQL implementation lives in [`pg`]. Multi-statement operations
//! run inside a backend-managed transaction; errors that classify as
//! retryable (serialization failure, deadlock) surface as
//! [`BackendError::Retryable`] so handlers can retry the whole operation.

pub mod pg;

use async_trait::async_trait;
use mangrove_bson::{Document, Value};
use thiserror::Error;

/// Classified backend failure.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("namespace not found: {0}")]
    NotFound(String),

    #[error("namespace already exists: {0}")]
    AlreadyExists(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("retryable conflict: {0}")]
    Retryable(String),

    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Retryable(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A collection listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    /// Backing table name inside the database's schema.
    pub table: String,
}

/// An index over a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    /// Key fields with direction (1 ascending, -1 descending).
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
}

impl IndexSpec {
    /// The default `_id_` index every collection carries.
    pub fn id_index() -> Self {
        IndexSpec {
            name: "_id_".to_owned(),
            keys: vec![("_id".to_owned(), 1)],
            unique: true,
        }
    }
}

/// A query request: the full filter plus an optional row limit. The
/// backend pushes whatever it can into its native query language and
/// reports whether the result still needs the full in-memory filter.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Document,
    /// Applied only when the backend could push the filter completely.
    pub limit: Option<usize>,
}

/// Documents matching a query, with the pushdown completeness flag.
#[derive(Debug)]
pub struct QueryResult {
    pub documents: Vec<Document>,
    /// True when the backend applied the whole filter; false means the
    /// caller must re-evaluate the filter over `documents`.
    pub filter_complete: bool,
}

/// The storage capability surface.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Sorted list of database names, system schemas excluded.
    async fn list_databases(&self) -> BackendResult<Vec<String>>;

    /// Strict create: errors with `AlreadyExists` on a present database.
    async fn create_database(&self, db: &str) -> BackendResult<()>;

    /// Idempotent create used by implicit-creation paths.
    async fn create_database_if_not_exists(&self, db: &str) -> BackendResult<()>;

    async fn drop_database(&self, db: &str) -> BackendResult<()>;

    /// Collections of a database, sorted by name.
    async fn list_collections(&self, db: &str) -> BackendResult<Vec<CollectionInfo>>;

    async fn create_collection(&self, db: &str, collection: &str) -> BackendResult<()>;

    async fn create_collection_if_not_exists(&self, db: &str, collection: &str)
        -> BackendResult<()>;

    async fn drop_collection(&self, db: &str, collection: &str) -> BackendResult<()>;

    async fn insert_document(
        &self,
        db: &str,
        collection: &str,
        document: &Document,
    ) -> BackendResult<()>;

    async fn query_documents(
        &self,
        db: &str,
        collection: &str,
        query: &QuerySpec,
    ) -> BackendResult<QueryResult>;

    /// Replaces the document with the given `_id`. Returns the number of
    /// rows changed (0 when the id is gone).
    async fn update_document(
        &self,
        db: &str,
        collection: &str,
        id: &Value,
        document: &Document,
    ) -> BackendResult<u64>;

    /// Deletes by `_id`, returning the number of rows removed.
    async fn delete_document(&self, db: &str, collection: &str, id: &Value)
        -> BackendResult<u64>;

    /// Creates an index; returns false when an identical index existed.
    async fn create_index(
        &self,
        db: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> BackendResult<bool>;

    async fn drop_index(&self, db: &str, collection: &str, name: &str) -> BackendResult<()>;

    async fn list_indexes(&self, db: &str, collection: &str) -> BackendResult<Vec<IndexSpec>>;
}

//! Command handlers and dispatch.
//!
//! The dispatcher keys on the first field of the command document,
//! case-sensitively, through a table built once at startup and passed to
//! every connection loop; there is no registration-time global state.

pub mod databases;
pub mod diagnostics;
pub mod indexes;
pub mod query;
pub mod write;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mangrove_bson::{doc, Document, Value};
use mangrove_common::{ErrorCode, LogRing, MongoError, MongoResult, ProxyConfig};

use crate::backend::{Backend, BackendError, BackendResult};
use crate::cursors::CursorRegistry;

/// Everything a handler can reach: the backend, the connection's cursor
/// table, configuration and connection identity.
pub struct CommandContext<'a> {
    pub backend: &'a Arc<dyn Backend>,
    pub cursors: &'a mut CursorRegistry,
    pub config: &'a ProxyConfig,
    pub log_ring: &'a Arc<LogRing>,
    pub peer: SocketAddr,
    pub connection_id: i64,
    /// Database the command addresses (`$db`, or `admin` for the legacy
    /// handshake path).
    pub db: String,
}

/// Every command the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Hello,
    IsMaster,
    BuildInfo,
    GetCmdLineOpts,
    GetLog,
    GetParameter,
    Ping,
    ServerStatus,
    WhatsMyUri,
    ListDatabases,
    DbStats,
    CollStats,
    ListCollections,
    Create,
    Drop,
    DropDatabase,
    Insert,
    Update,
    Delete,
    Find,
    FindAndModify,
    Count,
    Distinct,
    GetMore,
    KillCursors,
    CreateIndexes,
    DropIndexes,
    ListIndexes,
}

/// The string-keyed command table.
pub struct CommandTable {
    map: HashMap<&'static str, CommandKind>,
}

impl CommandTable {
    pub fn new() -> Self {
        use CommandKind::*;
        let entries: &[(&'static str, CommandKind)] = &[
            ("hello", Hello),
            ("isMaster", IsMaster),
            ("ismaster", IsMaster),
            ("buildInfo", BuildInfo),
            ("buildinfo", BuildInfo),
            ("getCmdLineOpts", GetCmdLineOpts),
            ("getLog", GetLog),
            ("getParameter", GetParameter),
            ("ping", Ping),
            ("serverStatus", ServerStatus),
            ("whatsmyuri", WhatsMyUri),
            ("listDatabases", ListDatabases),
            ("dbStats", DbStats),
            ("collStats", CollStats),
            ("listCollections", ListCollections),
            ("create", Create),
            ("drop", Drop),
            ("dropDatabase", DropDatabase),
            ("insert", Insert),
            ("update", Update),
            ("delete", Delete),
            ("find", Find),
            ("findAndModify", FindAndModify),
            ("findandmodify", FindAndModify),
            ("count", Count),
            ("distinct", Distinct),
            ("getMore", GetMore),
            ("killCursors", KillCursors),
            ("createIndexes", CreateIndexes),
            ("dropIndexes", DropIndexes),
            ("listIndexes", ListIndexes),
        ];
        CommandTable {
            map: entries.iter().copied().collect(),
        }
    }

    /// Case-sensitive lookup by the command document's first field.
    pub fn resolve(&self, name: &str) -> Option<CommandKind> {
        self.map.get(name).copied()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one command to its reply document.
pub async fn dispatch(
    kind: CommandKind,
    ctx: &mut CommandContext<'_>,
    cmd: &Document,
) -> MongoResult<Document> {
    use CommandKind::*;
    match kind {
        Hello => diagnostics::hello(ctx, cmd, false),
        IsMaster => diagnostics::hello(ctx, cmd, true),
        BuildInfo => diagnostics::build_info(),
        GetCmdLineOpts => diagnostics::get_cmd_line_opts(),
        GetLog => diagnostics::get_log(ctx, cmd),
        GetParameter => diagnostics::get_parameter(cmd),
        Ping => diagnostics::ping(),
        ServerStatus => diagnostics::server_status(ctx),
        WhatsMyUri => diagnostics::whatsmyuri(ctx),
        ListDatabases => databases::list_databases(ctx).await,
        DbStats => databases::db_stats(ctx).await,
        CollStats => databases::coll_stats(ctx, cmd).await,
        ListCollections => databases::list_collections(ctx).await,
        Create => databases::create(ctx, cmd).await,
        Drop => databases::drop(ctx, cmd).await,
        DropDatabase => databases::drop_database(ctx).await,
        Insert => write::insert(ctx, cmd).await,
        Update => write::update(ctx, cmd).await,
        Delete => write::delete(ctx, cmd).await,
        Find => query::find(ctx, cmd).await,
        FindAndModify => query::find_and_modify(ctx, cmd).await,
        Count => query::count(ctx, cmd).await,
        Distinct => query::distinct(ctx, cmd).await,
        GetMore => query::get_more(ctx, cmd).await,
        KillCursors => query::kill_cursors(ctx, cmd),
        CreateIndexes => indexes::create_indexes(ctx, cmd).await,
        DropIndexes => indexes::drop_indexes(ctx, cmd).await,
        ListIndexes => indexes::list_indexes(ctx, cmd).await,
    }
}

// Shared helpers.

/// The collection name carried in the command's first field.
pub fn collection_arg(cmd: &Document) -> MongoResult<String> {
    let (name, value) = cmd
        .iter()
        .next()
        .ok_or_else(|| MongoError::bad_value("empty command document"))?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| {
            MongoError::new(
                ErrorCode::InvalidNamespace,
                format!(
                    "collection name has invalid type {} in {name}",
                    value.type_alias()
                ),
            )
        })
}

/// Maps a classified backend error to its wire-visible form.
pub fn backend_error(err: BackendError) -> MongoError {
    match err {
        BackendError::NotFound(ns) => MongoError::new(
            ErrorCode::NamespaceNotFound,
            format!("ns not found: {ns}"),
        ),
        BackendError::AlreadyExists(ns) => MongoError::new(
            ErrorCode::NamespaceExists,
            format!("Collection already exists. NS: {ns}"),
        ),
        BackendError::DuplicateKey(ns) => MongoError::new(
            ErrorCode::DuplicateKey,
            format!("E11000 duplicate key error collection: {ns} index: _id_"),
        ),
        BackendError::InvalidName(msg) => MongoError::new(ErrorCode::InvalidNamespace, msg),
        BackendError::Retryable(_) => MongoError::new(
            ErrorCode::WriteConflict,
            "write conflict, please retry your operation",
        ),
        BackendError::Unclassified(e) => MongoError::internal(e),
    }
}

/// Retries a backend operation on retryable conflicts: 3 attempts with
/// doubling backoff from a 2 ms base.
pub async fn with_retries<T, F, Fut>(mut op: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BackendResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                tracing::debug!(attempt, "retrying backend operation after conflict");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(10));
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// `{ok: 1.0}`.
pub fn ok_reply() -> Document {
    doc! { "ok" => 1.0 }
}

/// The standard cursor-shaped reply.
pub fn cursor_reply(ns: &str, batch_key: &str, batch: Vec<Document>, cursor_id: i64) -> Document {
    let batch: Vec<Value> = batch.into_iter().map(Value::Document).collect();
    doc! {
        "cursor" => doc! {
            batch_key => batch,
            "id" => Value::Int64(cursor_id),
            "ns" => ns,
        },
        "ok" => 1.0,
    }
}

/// Reads a non-negative integer argument, with bounds sanity.
pub fn non_negative_int(cmd: &Document, key: &str) -> MongoResult<Option<i64>> {
    match cmd.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let n = value.as_integer().ok_or_else(|| {
                MongoError::type_mismatch(format!(
                    "{key} must be a number, not {}",
                    value.type_alias()
                ))
            })?;
            if n < 0 {
                return Err(MongoError::bad_value(format!(
                    "{key} value must be non-negative"
                )));
            }
            Ok(Some(n))
        }
    }
}

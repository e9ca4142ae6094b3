//! Handshake and diagnostic commands: `hello`/`isMaster`, `buildInfo`,
//! `ping`, `whatsmyuri`, `getLog`, `getCmdLineOpts`, `getParameter`,
//! `serverStatus`.

use std::time::Instant;

use mangrove_bson::{doc, Document, Value};
use mangrove_common::{MongoError, MongoResult};
use once_cell::sync::Lazy;

use super::CommandContext;

/// Reported server version; the wire versions must stay in step with it.
pub const SERVER_VERSION: &str = "6.0.0";
const MIN_WIRE_VERSION: i32 = 0;
const MAX_WIRE_VERSION: i32 = 17;

pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub const MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1000 * 1000;
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Pins the process start time; called once from main.
pub fn mark_started() {
    Lazy::force(&STARTED_AT);
}

/// `hello` and its `isMaster`/`ismaster` ancestors. The legacy spelling
/// answers with `ismaster`, the modern one with `isWritablePrimary`.
pub fn hello(
    ctx: &mut CommandContext<'_>,
    _cmd: &Document,
    legacy: bool,
) -> MongoResult<Document> {
    let mut reply = Document::new();
    if legacy {
        reply.insert("ismaster", true);
    } else {
        reply.insert("isWritablePrimary", true);
    }
    reply.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
    reply.insert("maxMessageSizeBytes", MAX_MESSAGE_SIZE_BYTES);
    reply.insert("maxWriteBatchSize", MAX_WRITE_BATCH_SIZE);
    reply.insert(
        "localTime",
        Value::DateTime(chrono::Utc::now().timestamp_millis()),
    );
    reply.insert("logicalSessionTimeoutMinutes", 30);
    reply.insert("connectionId", Value::Int64(ctx.connection_id));
    reply.insert("minWireVersion", MIN_WIRE_VERSION);
    reply.insert("maxWireVersion", MAX_WIRE_VERSION);
    reply.insert("readOnly", false);
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub fn build_info() -> MongoResult<Document> {
    let version_array: Vec<Value> = SERVER_VERSION
        .split('.')
        .map(|part| Value::Int32(part.parse().unwrap_or(0)))
        .chain(std::iter::once(Value::Int32(0)))
        .take(4)
        .collect();
    Ok(doc! {
        "version" => SERVER_VERSION,
        "gitVersion" => env!("CARGO_PKG_VERSION"),
        "modules" => Vec::<Value>::new(),
        "sysInfo" => "deprecated",
        "versionArray" => version_array,
        "bits" => 64,
        "debug" => false,
        "maxBsonObjectSize" => MAX_BSON_OBJECT_SIZE,
        "ok" => 1.0,
    })
}

pub fn ping() -> MongoResult<Document> {
    Ok(doc! { "ok" => 1.0 })
}

pub fn whatsmyuri(ctx: &mut CommandContext<'_>) -> MongoResult<Document> {
    Ok(doc! {
        "you" => ctx.peer.to_string(),
        "ok" => 1.0,
    })
}

pub fn get_cmd_line_opts() -> MongoResult<Document> {
    let argv: Vec<Value> = std::env::args().map(Value::String).collect();
    Ok(doc! {
        "argv" => argv,
        "parsed" => Document::new(),
        "ok" => 1.0,
    })
}

pub fn get_log(ctx: &mut CommandContext<'_>, cmd: &Document) -> MongoResult<Document> {
    match cmd.get_str("getLog") {
        Some("*") => Ok(doc! {
            "names" => vec![Value::from("global"), Value::from("startupWarnings")],
            "ok" => 1.0,
        }),
        Some("global") | Some("startupWarnings") => {
            let lines = ctx.log_ring.recent(1024);
            let total = lines.len() as i32;
            let log: Vec<Value> = lines.into_iter().map(Value::String).collect();
            Ok(doc! {
                "totalLinesWritten" => total,
                "log" => log,
                "ok" => 1.0,
            })
        }
        Some(other) => Err(MongoError::bad_value(format!(
            "no RamLog named: {other}"
        ))),
        None => Err(MongoError::type_mismatch(
            "getLog argument must be a string",
        )),
    }
}

pub fn get_parameter(cmd: &Document) -> MongoResult<Document> {
    let mut reply = Document::new();
    let all = cmd.get_str("getParameter") == Some("*");
    if all || cmd.contains_key("quiet") {
        reply.insert("quiet", false);
    }
    if all || cmd.contains_key("featureCompatibilityVersion") {
        reply.insert(
            "featureCompatibilityVersion",
            doc! { "version" => "6.0" },
        );
    }
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub fn server_status(ctx: &mut CommandContext<'_>) -> MongoResult<Document> {
    let uptime = STARTED_AT.elapsed();
    Ok(doc! {
        "host" => ctx.peer.to_string(),
        "version" => SERVER_VERSION,
        "process" => "mangrove-proxy",
        "pid" => Value::Int64(std::process::id() as i64),
        "uptime" => uptime.as_secs_f64(),
        "uptimeMillis" => Value::Int64(uptime.as_millis() as i64),
        "localTime" => Value::DateTime(chrono::Utc::now().timestamp_millis()),
        "ok" => 1.0,
    })
}

//! Per-connection request loop.
//!
//! One task per TCP connection, strictly serial: read frame, decode,
//! dispatch, encode, write. Command-level failures become `{ok: 0}`
//! replies and the loop continues; protocol-level failures close the
//! connection, destroying its cursors.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mangrove_bson::{doc, Document, Value};
use mangrove_common::{ErrorCode, LogRing, MongoError, ProxyConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::commands::{dispatch, CommandContext, CommandTable};
use crate::cursors::CursorRegistry;
use crate::wire::{self, FrameError, Request};

static NEXT_CONNECTION_ID: AtomicI64 = AtomicI64::new(1);

/// Drives one client connection until EOF or a protocol error.
pub async fn handle_connection<S>(
    socket: &mut S,
    peer: SocketAddr,
    backend: Arc<dyn Backend>,
    table: Arc<CommandTable>,
    config: Arc<ProxyConfig>,
    log_ring: Arc<LogRing>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let mut cursors = CursorRegistry::new(Duration::from_secs(config.cursors.ttl_secs));
    debug!(connection_id, peer = %peer, "connection established");

    loop {
        let (header, body) = match wire::read_frame(socket).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                debug!(connection_id, "client disconnected");
                break;
            }
            Err(e) => {
                warn!(connection_id, error = %e, "protocol error, closing connection");
                break;
            }
        };

        let request = match Request::parse(header.op_code, &body) {
            Ok(request) => request,
            // A broken BSON body inside an intact frame is a command-level
            // failure; the connection lives on.
            Err(FrameError::InvalidBson { source, .. }) => {
                let code = if source.is_structural() {
                    ErrorCode::InvalidBson
                } else {
                    ErrorCode::BadValue
                };
                let err = MongoError::new(code, source.to_string());
                let reply_op = if header.op_code == wire::constants::OP_QUERY {
                    wire::constants::OP_REPLY
                } else {
                    wire::constants::OP_MSG
                };
                write_reply(socket, reply_op, header.request_id, &error_reply(err)).await?;
                continue;
            }
            Err(e) => {
                warn!(connection_id, error = %e, "malformed message, closing connection");
                break;
            }
        };

        let reply_op = request.reply_op_code();
        // moreToCome requests are fire-and-forget: process, don't reply.
        let fire_and_forget = matches!(
            &request,
            Request::Msg { flags, .. }
                if flags & wire::constants::FLAG_MORE_TO_COME != 0
        );
        let mut cmd = request.into_document();
        let db = match cmd.remove("$db") {
            Some(Value::String(db)) => db,
            None => "admin".to_owned(),
            Some(other) => {
                let err = MongoError::type_mismatch(format!(
                    "$db must be a string, not {}",
                    other.type_alias()
                ));
                write_reply(socket, reply_op, header.request_id, &error_reply(err)).await?;
                continue;
            }
        };

        let reply = run_command(
            &table,
            &backend,
            &mut cursors,
            &config,
            &log_ring,
            peer,
            connection_id,
            db,
            &cmd,
        )
        .await;

        if !fire_and_forget {
            write_reply(socket, reply_op, header.request_id, &reply).await?;
        }
    }

    cursors.clear();
    Ok(())
}

async fn write_reply<S>(
    socket: &mut S,
    reply_op: i32,
    request_id: i32,
    reply: &Document,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = if reply_op == wire::constants::OP_REPLY {
        wire::build_reply_body(reply)
    } else {
        wire::build_msg_body(reply)
    };
    wire::write_frame(socket, reply_op, request_id, &body).await
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    table: &CommandTable,
    backend: &Arc<dyn Backend>,
    cursors: &mut CursorRegistry,
    config: &ProxyConfig,
    log_ring: &Arc<LogRing>,
    peer: SocketAddr,
    connection_id: i64,
    db: String,
    cmd: &Document,
) -> Document {
    let Some(name) = cmd.command_name() else {
        return error_reply(MongoError::bad_value("empty command document"));
    };

    let Some(kind) = table.resolve(name) else {
        debug!(connection_id, command = name, "unknown command");
        return error_reply(MongoError::command_not_found(name));
    };

    let max_time_ms = match cmd.get("maxTimeMS") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_integer() {
            Some(ms) if ms >= 0 => (ms > 0).then_some(ms as u64),
            _ => {
                return error_reply(MongoError::bad_value(
                    "maxTimeMS must be a non-negative number",
                ))
            }
        },
    };

    let mut ctx = CommandContext {
        backend,
        cursors,
        config,
        log_ring,
        peer,
        connection_id,
        db,
    };

    debug!(connection_id, command = name, db = %ctx.db, "dispatching command");
    let result = match max_time_ms {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), dispatch(kind, &mut ctx, cmd))
                .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(MongoError::new(
                    ErrorCode::MaxTimeMsExpired,
                    "operation exceeded time limit",
                )),
            }
        }
        None => dispatch(kind, &mut ctx, cmd).await,
    };

    match result {
        Ok(reply) => reply,
        Err(err) => {
            debug!(connection_id, command = name, code = err.code.code(), error = %err.message, "command failed");
            error_reply(err)
        }
    }
}

/// The wire shape of a failed command.
pub fn error_reply(err: MongoError) -> Document {
    doc! {
        "ok" => 0.0,
        "errmsg" => err.message,
        "code" => err.code.code(),
        "codeName" => err.code.name(),
    }
}

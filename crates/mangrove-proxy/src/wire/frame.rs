//! Frame-level reading and writing: the 16-byte little-endian header and
//! the raw message body.

use std::sync::atomic::{AtomicI32, Ordering};

use mangrove_bson::BsonError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{HEADER_LEN, MAX_MESSAGE_LEN};

/// Process-wide monotonically increasing request id for responses.
static RESPONSE_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_response_id() -> i32 {
    RESPONSE_ID.fetch_add(1, Ordering::Relaxed)
}

/// The common wire header carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MsgHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        MsgHeader {
            message_length: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            request_id: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            response_to: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            op_code: i32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        out
    }
}

/// Errors raised below the command layer. All of them terminate the
/// connection except [`FrameError::InvalidBson`], which the loop answers
/// with a command-level error because the frame itself was intact.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("client closed the connection")]
    ConnectionClosed,

    #[error("message length {0} outside [{HEADER_LEN}, {MAX_MESSAGE_LEN}]")]
    InvalidLength(i64),

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(i32),

    #[error("malformed {section}: {detail}")]
    Malformed {
        section: &'static str,
        detail: String,
    },

    #[error("invalid BSON in {section}: {source}")]
    InvalidBson {
        section: &'static str,
        #[source]
        source: BsonError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads one frame: header plus body. Returns `ConnectionClosed` on a
/// clean EOF at a message boundary.
pub async fn read_frame<S>(socket: &mut S) -> Result<(MsgHeader, Vec<u8>), FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }

    let header = MsgHeader::parse(&header_bytes);
    let length = header.message_length as i64;
    if length < HEADER_LEN as i64 || length > MAX_MESSAGE_LEN as i64 {
        return Err(FrameError::InvalidLength(length));
    }

    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    socket.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Writes one frame, filling in the length and a fresh response id.
pub async fn write_frame<S>(
    socket: &mut S,
    op_code: i32,
    response_to: i32,
    body: &[u8],
) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    let header = MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id: next_response_id(),
        response_to,
        op_code,
    };
    socket.write_all(&header.to_bytes()).await?;
    socket.write_all(body).await?;
    socket.flush().await?;
    Ok(())
}

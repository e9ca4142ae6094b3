//! MongoDB wire protocol: framing, opcodes, request parsing and reply
//! construction.
//!
//! - `constants` - opcodes, flag bits, size limits
//! - `frame` - header codec and frame I/O over any async stream
//! - `message` - OP_MSG / OP_QUERY bodies and reply builders

pub mod constants;
pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, FrameError, MsgHeader};
pub use message::{build_msg_body, build_reply_body, Request};

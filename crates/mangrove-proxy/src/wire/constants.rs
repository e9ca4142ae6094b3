//! MongoDB wire protocol constants.

/// OP_REPLY: legacy reply to OP_QUERY.
pub const OP_REPLY: i32 = 1;

/// OP_QUERY: legacy query, still used by drivers for the first handshake.
pub const OP_QUERY: i32 = 2004;

/// OP_MSG: the modern extensible message opcode.
pub const OP_MSG: i32 = 2013;

/// Size of the common message header.
pub const HEADER_LEN: usize = 16;

/// Largest accepted message. Larger frames terminate the connection.
pub const MAX_MESSAGE_LEN: usize = 48 * 1024 * 1024;

/// OP_MSG flag: a CRC-32C checksum trails the sections.
pub const FLAG_CHECKSUM_PRESENT: u32 = 1;

/// OP_MSG flag: more messages follow, no reply expected yet.
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;

/// OP_MSG flag: the client allows exhaust cursors.
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

/// Flag bits a client may legally set on a request.
pub const KNOWN_REQUEST_FLAGS: u32 =
    FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME | FLAG_EXHAUST_ALLOWED;

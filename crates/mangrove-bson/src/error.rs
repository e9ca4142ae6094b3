//! BSON codec error type.

use thiserror::Error;

/// Error type for BSON encoding and decoding operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BsonError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unsupported BSON element type: 0x{0:02x}")]
    UnsupportedType(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("stated length {stated} does not match actual content")]
    LengthMismatch { stated: usize },

    #[error("trailing bytes after document end")]
    TrailingBytes,

    #[error("duplicate field name {0:?}")]
    DuplicateField(String),

    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),

    #[error("negative length prefix")]
    NegativeLength,

    #[error("invalid extended JSON: {0}")]
    InvalidExtendedJson(String),
}

impl BsonError {
    /// True for errors caused by a structurally broken document rather than
    /// an unknown or malformed element inside a well-framed one.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            BsonError::UnexpectedEof
                | BsonError::LengthMismatch { .. }
                | BsonError::TrailingBytes
                | BsonError::NegativeLength
        )
    }
}

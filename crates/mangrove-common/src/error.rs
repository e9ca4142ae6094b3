//! MongoDB-visible error taxonomy.
//!
//! Every failed command reply carries `ok: 0`, an integer `code`, its
//! `codeName` and a human `errmsg`. This module is the single source of
//! truth for the code list; classification from backend errors happens at
//! the backend seam.

use std::fmt;

use thiserror::Error;

/// Canonical MongoDB error codes used by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    TypeMismatch,
    InvalidBson,
    NamespaceNotFound,
    IndexNotFound,
    ConflictingUpdateOperators,
    CursorNotFound,
    NamespaceExists,
    MaxTimeMsExpired,
    CommandNotFound,
    ImmutableField,
    InvalidNamespace,
    IndexOptionsConflict,
    WriteConflict,
    DuplicateKey,
    NotImplemented,
}

impl ErrorCode {
    /// The wire integer for this code.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::InvalidBson => 22,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::IndexNotFound => 27,
            ErrorCode::ConflictingUpdateOperators => 40,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::NamespaceExists => 48,
            ErrorCode::MaxTimeMsExpired => 50,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::ImmutableField => 66,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::IndexOptionsConflict => 85,
            ErrorCode::WriteConflict => 112,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::NotImplemented => 238,
        }
    }

    /// The wire `codeName` for this code.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::InvalidBson => "InvalidBSON",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::IndexNotFound => "IndexNotFound",
            ErrorCode::ConflictingUpdateOperators => "ConflictingUpdateOperators",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::MaxTimeMsExpired => "MaxTimeMSExpired",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::ImmutableField => "ImmutableField",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::IndexOptionsConflict => "IndexOptionsConflict",
            ErrorCode::WriteConflict => "WriteConflict",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::NotImplemented => "NotImplemented",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A command-level error with its wire-visible shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct MongoError {
    pub code: ErrorCode,
    pub message: String,
}

impl MongoError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        MongoError {
            code,
            message: message.into(),
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeMismatch, message)
    }

    pub fn failed_to_parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedToParse, message)
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, message.to_string())
    }

    pub fn command_not_found(command: &str) -> Self {
        Self::new(
            ErrorCode::CommandNotFound,
            format!("no such command: '{command}'"),
        )
    }

    pub fn invalid_namespace(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidNamespace, message)
    }

    pub fn cursor_not_found(cursor_id: i64) -> Self {
        Self::new(
            ErrorCode::CursorNotFound,
            format!("cursor id {cursor_id} not found"),
        )
    }
}

/// Result alias for command handling.
pub type MongoResult<T> = std::result::Result<T, MongoError>;

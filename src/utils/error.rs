//! The `error` module defines the status-style errors returned by every
//! broker operation.
//!
//! Each variant corresponds to exactly one symbolic [`Code`], the category a
//! client of the real service would observe on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Symbolic status category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::Cancelled => "Cancelled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Referenced topic or subscription is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate creation.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Missing required field, malformed mask path, out-of-bounds retention.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Out-of-bounds ack deadline. The real service reports this one
    /// validation failure as `Unknown`, and clients depend on it.
    #[error("unknown: {0}")]
    Unknown(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Builds an error of an arbitrary category, as fault injection does.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Code::Cancelled => Error::Cancelled(message),
            Code::Unknown => Error::Unknown(message),
            Code::InvalidArgument => Error::InvalidArgument(message),
            Code::DeadlineExceeded => Error::DeadlineExceeded(message),
            Code::NotFound => Error::NotFound(message),
            Code::AlreadyExists => Error::AlreadyExists(message),
            Code::Unimplemented => Error::Unimplemented(message),
            Code::Internal => Error::Internal(message),
            Code::Unavailable => Error::Unavailable(message),
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::Unknown(_) => Code::Unknown,
            Error::Unimplemented(_) => Code::Unimplemented,
            Error::Cancelled(_) => Code::Cancelled,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Internal(_) => Code::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::NotFound(m)
            | Error::AlreadyExists(m)
            | Error::InvalidArgument(m)
            | Error::Unknown(m)
            | Error::Unimplemented(m)
            | Error::Cancelled(m)
            | Error::DeadlineExceeded(m)
            | Error::Unavailable(m)
            | Error::Internal(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types and transfer status codes.
//!
//! `ErrorCode` is what the transfer engine reports back and what ends up as
//! the process exit status. `LaunchError` covers everything that stops a run
//! before a transfer is attempted.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status used when no listening port could be bound.
pub const NO_PORTS_EXIT_STATUS: u8 = 100;

/// Exit status used when the item list on stdin is malformed.
pub const INPUT_ERROR_EXIT_STATUS: u8 = 101;

/// Exit status for configuration and other startup failures.
pub const STARTUP_ERROR_EXIT_STATUS: u8 = 102;

/// Status code reported by a transfer role.
///
/// Discriminants are stable: they are sent over the wire in `Abort` frames
/// and returned as the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    Ok = 0,
    Error = 1,
    Abort = 2,
    ConnError = 3,
    SocketReadError = 5,
    SocketWriteError = 6,
    ByteSourceReadError = 7,
    FileWriteError = 8,
    ProtocolError = 10,
    VersionMismatch = 11,
    IdMismatch = 12,
    TransferLogAcquireError = 17,
}

impl ErrorCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::Abort),
            3 => Some(Self::ConnError),
            5 => Some(Self::SocketReadError),
            6 => Some(Self::SocketWriteError),
            7 => Some(Self::ByteSourceReadError),
            8 => Some(Self::FileWriteError),
            10 => Some(Self::ProtocolError),
            11 => Some(Self::VersionMismatch),
            12 => Some(Self::IdMismatch),
            17 => Some(Self::TransferLogAcquireError),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    pub fn as_exit_status(self) -> u8 {
        self as u8
    }

    /// Combine two codes, keeping the first failure seen.
    pub fn merge(self, other: ErrorCode) -> ErrorCode {
        if self.is_ok() {
            other
        } else {
            self
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Abort => "ABORT",
            Self::ConnError => "CONN_ERROR",
            Self::SocketReadError => "SOCKET_READ_ERROR",
            Self::SocketWriteError => "SOCKET_WRITE_ERROR",
            Self::ByteSourceReadError => "BYTE_SOURCE_READ_ERROR",
            Self::FileWriteError => "FILE_WRITE_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::IdMismatch => "ID_MISMATCH",
            Self::TransferLogAcquireError => "TRANSFER_LOG_ACQUIRE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A malformed line in the explicit item list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemListError {
    #[error("line {line}: expected 1 or 2 tab-separated fields, got {fields}: {text:?}")]
    FieldCount {
        line: usize,
        fields: usize,
        text: String,
    },

    #[error("line {line}: invalid size {value:?}")]
    InvalidSize { line: usize, value: String },

    #[error("line {line}: {message}")]
    Read { line: usize, message: String },
}

/// Errors that stop a run before (or instead of) a transfer.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid input in item list: {0}")]
    ItemList(#[from] ItemListError),
}

impl LaunchError {
    /// Process exit status for a run that failed before producing an outcome.
    pub fn exit_status(&self) -> u8 {
        match self {
            LaunchError::ItemList(_) => INPUT_ERROR_EXIT_STATUS,
            _ => STARTUP_ERROR_EXIT_STATUS,
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

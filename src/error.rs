//! Unified error handling for the run-tracking core.
//!
//! Mirrors the shape of `commy`'s `CommyError`: a single `thiserror`-derived
//! enum with a `category()` and an `is_retryable()` predicate, plus a
//! `RuncoreResult<T>` alias and an `ErrorContext` extension trait.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for all runcore operations.
#[derive(Error, Debug)]
pub enum RuncoreError {
    // Protocol errors: frame parsing, unknown union tags. Fatal to the
    // connection that produced them.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("bad frame magic: expected {expected:#x}, got {actual:#x}")]
    BadMagic { expected: u8, actual: u8 },

    // Communication errors: HTTP/GraphQL failures. Retried by the transport;
    // surfaced to the client only when the originating record asked for a
    // reply.
    #[error("communication error: {message}")]
    Communication { message: String },

    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("transport timeout after {0:?}")]
    TransportTimeout(std::time::Duration),

    // Resume errors: mode mismatch or malformed seed data from the backend.
    #[error("resume error: {message}")]
    Resume { message: String },

    // File I/O errors.
    #[error("I/O error: {source} (path: {path:?})")]
    Io {
        source: io::Error,
        path: Option<PathBuf>,
    },

    #[error("file not found for upload: {0}")]
    FileNotFound(PathBuf),

    // Internal invariant violations: nil record kind, unknown request type.
    // Fatal to the owning stream.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

pub type RuncoreResult<T> = Result<T, RuncoreError>;

/// Error category for grouping related errors, per the error-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Communication,
    Resume,
    FileIo,
    Internal,
}

impl RuncoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuncoreError::Protocol { .. }
            | RuncoreError::FrameTooLarge { .. }
            | RuncoreError::BadMagic { .. } => ErrorCategory::Protocol,

            RuncoreError::Communication { .. }
            | RuncoreError::GraphQl(_)
            | RuncoreError::TransportTimeout(_) => ErrorCategory::Communication,

            RuncoreError::Resume { .. } => ErrorCategory::Resume,

            RuncoreError::Io { .. } | RuncoreError::FileNotFound(_) => ErrorCategory::FileIo,

            RuncoreError::Internal(_)
            | RuncoreError::Json(_)
            | RuncoreError::Yaml(_)
            | RuncoreError::ChannelClosed(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the operation that produced this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuncoreError::Communication { .. } | RuncoreError::TransportTimeout(_) => true,
            RuncoreError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Error-context extension trait, mirroring `commy::error::ErrorContext`.
pub trait ErrorContext<T> {
    fn with_context<F>(self, f: F) -> RuncoreResult<T>
    where
        F: FnOnce() -> String;

    fn context(self, msg: &str) -> RuncoreResult<T>;
}

impl<T> ErrorContext<T> for RuncoreResult<T> {
    fn with_context<F>(self, f: F) -> RuncoreResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| RuncoreError::Internal(format!("{}: {}", f(), e)))
    }

    fn context(self, msg: &str) -> RuncoreResult<T> {
        self.map_err(|e| RuncoreError::Internal(format!("{}: {}", msg, e)))
    }
}

impl<T> ErrorContext<T> for Result<T, io::Error> {
    fn with_context<F>(self, f: F) -> RuncoreResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| RuncoreError::Internal(format!("{}: {}", f(), e)))
    }

    fn context(self, msg: &str) -> RuncoreResult<T> {
        self.map_err(|e| RuncoreError::Internal(format!("{}: {}", msg, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_protocol_errors() {
        let e = RuncoreError::BadMagic {
            expected: 0x57,
            actual: 0x00,
        };
        assert_eq!(e.category(), ErrorCategory::Protocol);
        assert!(!e.is_retryable());
    }

    #[test]
    fn communication_errors_are_retryable() {
        let e = RuncoreError::Communication {
            message: "503".into(),
        };
        assert_eq!(e.category(), ErrorCategory::Communication);
        assert!(e.is_retryable());
    }
}

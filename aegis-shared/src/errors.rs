//! Error taxonomy shared across the daemon and its clients.
//!
//! Every operation returns an [`AegisError`] carrying a kind tag; the HTTP
//! layer and the daemon's exit path map kinds to statuses and exit codes.
//! Swallowing an error without surfacing it to the caller is not done
//! anywhere in the tree.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type AegisResult<T> = Result<T, AegisError>;

/// Classification of an error, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or out-of-range value. No side effects.
    Validation,
    /// Operation incompatible with current state (duplicate handle,
    /// exec on a stopped instance, occupied public port).
    Conflict,
    /// The named instance, secret or mapping does not exist.
    NotFound,
    /// Subnets, ports or disk space ran out; partial allocations were
    /// rolled back.
    ResourceExhausted,
    /// Hypervisor, sidecar or kernel primitive failed.
    Backend,
    /// Transient I/O; retried internally before being surfaced.
    Io,
    /// Corrupt registry, missing required binary. The daemon refuses to
    /// continue.
    Fatal,
}

/// Structured error for every fallible operation in the workspace.
#[derive(Debug, Error)]
pub enum AegisError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("i/o: {0}")]
    Io(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AegisError {
    /// Kind tag for status mapping and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AegisError::Validation(_) => ErrorKind::Validation,
            AegisError::Conflict(_) => ErrorKind::Conflict,
            AegisError::NotFound(_) => ErrorKind::NotFound,
            AegisError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            AegisError::Backend(_) => ErrorKind::Backend,
            AegisError::Io(_) => ErrorKind::Io,
            AegisError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether an internal retry (bounded backoff) is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, AegisError::Io(_))
    }

    /// Process exit code for CLI front-ends.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => exit_codes::USAGE,
            ErrorKind::NotFound => exit_codes::NOT_FOUND,
            ErrorKind::Conflict => exit_codes::STATE_CONFLICT,
            _ => exit_codes::GENERIC,
        }
    }
}

impl From<std::io::Error> for AegisError {
    fn from(e: std::io::Error) -> Self {
        AegisError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AegisError {
    fn from(e: serde_json::Error) -> Self {
        AegisError::Validation(format!("malformed JSON: {e}"))
    }
}

/// Process exit codes surfaced to CLI front-ends.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const USAGE: i32 = 2;
    /// The control socket did not answer.
    pub const DAEMON_NOT_RUNNING: i32 = 64;
    pub const NOT_FOUND: i32 = 65;
    pub const STATE_CONFLICT: i32 = 66;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        assert_eq!(
            AegisError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(AegisError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(AegisError::Fatal("x".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(AegisError::Validation("bad".into()).exit_code(), 2);
        assert_eq!(AegisError::NotFound("gone".into()).exit_code(), 65);
        assert_eq!(AegisError::Conflict("busy".into()).exit_code(), 66);
        assert_eq!(AegisError::Backend("vmm".into()).exit_code(), 1);
    }

    #[test]
    fn io_errors_are_transient() {
        let e: AegisError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(e.is_transient());
        assert!(!AegisError::Backend("dead".into()).is_transient());
    }
}

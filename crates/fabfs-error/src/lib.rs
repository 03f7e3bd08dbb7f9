#![forbid(unsafe_code)]
//! Error types for FabFS.
//!
//! FabFS uses a two-layer error model:
//!
//! | Layer   | Type         | Crate                      | Purpose |
//! |---------|--------------|----------------------------|---------|
//! | Parsing | `ParseError` | `fabfs-types`              | On-media format violations detected during byte parsing |
//! | Runtime | `FabError`   | `fabfs-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! `fabfs-error` is intentionally independent of `fabfs-types` so the
//! dependency graph stays acyclic. The conversion from `ParseError` into
//! `FabError` happens at the crate boundaries that see both (`fabfs-replay`,
//! `fabfs-core`):
//!
//! - superblock / log-header validation failures become [`FabError::Structural`]
//! - per-entry validation failures become [`FabError::Sequence`] with the
//!   entry index attached
//! - everything else is carried as [`FabError::Parse`] with context
//!
//! The core never swallows an error to produce a partially-valid in-memory
//! structure: every failed validation returns immediately, and the caller
//! (fsck vs. replay driver) decides whether to keep scanning.

use thiserror::Error;

/// Unified error type for all FabFS operations.
#[derive(Debug, Error)]
pub enum FabError {
    /// Operating system I/O error, surfaced verbatim and never retried.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, unsupported version, CRC mismatch, or truncated record
    /// on the superblock or log header. Always fatal to the operation.
    #[error("structural failure: {0}")]
    Structural(String),

    /// A log entry failed validation at `index`: sequence gap, absolute
    /// path payload, unknown type tag, or entry CRC mismatch. Replay halts
    /// at this point with all prior state preserved.
    #[error("invalid log entry {index}: {detail}")]
    Sequence { index: u64, detail: String },

    /// Recorded state could not be reconciled with allocator state, e.g.
    /// a replayed extent overlapping an already-owned one.
    #[error("corrupt metadata at offset {offset:#x}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// Every log slot is committed; appends are refused rather than
    /// wrapping or overwriting.
    #[error("log is full")]
    LogFull,

    /// No free extent satisfies the allocation request.
    #[error("no space left on device")]
    NoSpace,

    /// A client (or a host with no valid superblock) attempted mutation.
    /// Rejected before any I/O side effect.
    #[error("role violation: {0}")]
    RoleViolation(String),

    /// The target path is not of the expected kind (directory where a
    /// regular file was required, unsupported device type, ...).
    #[error("unexpected file type: {0}")]
    TypeMismatch(String),

    /// A required object is absent: the log file, the hidden metadata
    /// directory, the named source path.
    #[error("not found: {0}")]
    NotFound(String),

    /// mkfs found a valid superblock and neither `force` nor `kill` was
    /// requested.
    #[error("device already holds a valid filesystem")]
    AlreadyFormatted,

    /// Caller-supplied argument is out of range (zero-size file, path too
    /// long, empty path, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Non-blocking lock acquisition found the log already locked.
    #[error("log is locked by another process")]
    Busy,

    /// A structural parse failure carried upward with caller context.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result alias using `FabError`.
pub type Result<T> = std::result::Result<T, FabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = FabError::Sequence {
            index: 42,
            detail: "sequence gap".into(),
        };
        assert_eq!(err.to_string(), "invalid log entry 42: sequence gap");

        let corrupt = FabError::Corruption {
            offset: 0x40_0000,
            detail: "extent already allocated".into(),
        };
        assert_eq!(
            corrupt.to_string(),
            "corrupt metadata at offset 0x400000: extent already allocated"
        );

        assert_eq!(FabError::LogFull.to_string(), "log is full");
        assert_eq!(FabError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            FabError::RoleViolation("client may not append".into()).to_string(),
            "role violation: client may not append"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: FabError = io.into();
        assert!(matches!(err, FabError::Io(_)));
    }
}

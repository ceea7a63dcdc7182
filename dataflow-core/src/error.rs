//! Dataflow error abstractions.

use thiserror::Error;

/// The error type used to indicate that a replica must shut down.
///
/// Raised for unrecovered I/O failures; the process exits non-zero so the
/// kubelet restarts the replica.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

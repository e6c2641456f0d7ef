//! The result-code taxonomy every vtable operation and public entry point
//! returns, per the external-interface contract: out-parameters are cleared
//! before work begins so a failure always leaves them in a well-defined empty
//! state, and internal platform codes are mapped onto this taxonomy rather
//! than leaking through.

use thiserror::Error;

/// Top-level error type returned by every `miniav-core` operation.
#[derive(Debug, Error)]
pub enum MiniavError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid handle")]
    InvalidHandle,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("context is not initialized")]
    NotInitialized,

    #[error("context is already running")]
    AlreadyRunning,

    #[error("out of memory")]
    OutOfMemory,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("format not supported")]
    FormatNotSupported,

    #[error("invalid operation in current state: {0}")]
    InvalidOperation(&'static str),

    #[error("system call failed: {0}")]
    SystemCallFailed(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MiniavError {
    /// Maps a raw OS/platform error value to [`SystemCallFailed`], recording
    /// the native value for the log line the call site is expected to emit
    /// before returning. Unknown native codes always land here; this is the
    /// taxonomy's fallback slot.
    ///
    /// [`SystemCallFailed`]: MiniavError::SystemCallFailed
    pub fn from_native<E: std::fmt::Display>(context: &str, native: E) -> Self {
        Self::SystemCallFailed(format!("{context}: {native}"))
    }
}

pub type Result<T> = std::result::Result<T, MiniavError>;

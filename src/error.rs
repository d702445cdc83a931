//! Error types for the shim.
//!
//! Two layers, deliberately kept apart: guest-visible errnos (`abi::Errno`)
//! are returned as integers from emulated syscalls and never surface here;
//! `ShimError` covers everything the guest protocol has no code for, and is
//! what `run` rejects with.

use std::fmt;

/// Result type for shim operations
pub type ShimResult<T> = Result<T, ShimError>;

/// Failures that escape to the caller of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimError {
    /// Module binary is malformed or invalid
    InvalidModule { reason: String },

    /// Required export is missing
    MissingExport { name: &'static str },

    /// Export present but of the wrong kind
    WrongExportType {
        name: &'static str,
        expected: &'static str,
    },

    /// Module compilation or instantiation failed
    Instantiation { reason: String },

    /// The guest's allocator could not provide the argv region
    GuestAlloc { size: u32 },

    /// The guest trapped or aborted outside the syscall protocol
    Aborted { reason: String },

    /// The host rejected a flush of an output file
    HostWrite { path: String, message: String },

    /// The entry point returned a non-zero status. The message is the text
    /// the guest accumulated on its output stream - its own diagnostics
    /// double as the error report.
    GuestExit { code: i32, output: String },
}

impl fmt::Display for ShimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidModule { reason } => {
                write!(f, "invalid WASM module: {}", reason)
            }
            Self::MissingExport { name } => {
                write!(f, "missing required export: '{}'", name)
            }
            Self::WrongExportType { name, expected } => {
                write!(f, "export '{}' has wrong type: expected {}", name, expected)
            }
            Self::Instantiation { reason } => {
                write!(f, "module instantiation failed: {}", reason)
            }
            Self::GuestAlloc { size } => {
                write!(f, "guest allocator failed for {} bytes", size)
            }
            Self::Aborted { reason } => {
                write!(f, "guest aborted: {}", reason)
            }
            Self::HostWrite { path, message } => {
                write!(f, "host write to {:?} failed: {}", path, message)
            }
            Self::GuestExit { output, .. } => {
                write!(f, "{}", output)
            }
        }
    }
}

impl std::error::Error for ShimError {}

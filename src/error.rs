//! Unified error handling for MemForge
//!
//! This module provides a centralized error type for the coherence layer.
//! It implements error categorization for:
//! - Consistency violations (caller bugs, never retried)
//! - Backend errors (device allocation/copy failures)
//! - Configuration errors (invalid mode or provider selection)
//! - Internal errors (bugs in the manager itself)

use std::fmt;
use std::panic::Location;

/// Unified error type for MemForge
///
/// Consistency violations carry the offending address and, where available,
/// the original registration site so caller bugs can be diagnosed.
#[derive(Debug, thiserror::Error)]
pub enum MemForgeError {
    // ========== Consistency Violations ==========
    /// An address was registered twice
    #[error("double registration of {addr:#x} at {site} (first registered at {registered_at})")]
    DoubleRegistration {
        addr: usize,
        site: &'static Location<'static>,
        registered_at: &'static Location<'static>,
    },

    /// An address was resolved, pushed, pulled or mirrored without being tracked
    #[error("address {addr:#x} is not tracked (registration is mandatory once a device mode has been engaged)")]
    UnknownAddress { addr: usize },

    /// An untracked address was erased while a device is currently enabled
    #[error("erasing untracked address {addr:#x} while a device is enabled")]
    UntrackedErase { addr: usize },

    /// An operation that requires a base address was given something else
    #[error("address {addr:#x} is not a tracked base address")]
    NotABase { addr: usize },

    /// An alias-level copy was requested before the owner has a device mirror
    #[error("alias {addr:#x} used for an explicit copy before its owner has a device mirror")]
    MirrorMissing { addr: usize },

    /// A copy request exceeds the registered extent of a buffer
    #[error("copy of {requested} bytes exceeds the registered extent of {addr:#x} ({bytes} bytes)")]
    CopyOutOfBounds {
        addr: usize,
        requested: usize,
        bytes: usize,
    },

    // ========== Backend Errors ==========
    /// Device memory allocation failed
    #[error("device allocation of {bytes} bytes failed: {detail}")]
    AllocationFailed { bytes: usize, detail: String },

    /// Device copy failed
    #[error("device copy failed: {0}")]
    CopyFailed(String),

    /// The selected device provider is not available in this build
    #[error("device provider unavailable: {0}")]
    DeviceUnavailable(String),

    /// Generic device runtime error
    #[error("device error: {0}")]
    DeviceError(String),

    // ========== Configuration Errors ==========
    /// Invalid execution-mode configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug in the manager)
    #[error("internal error: {0}")]
    InternalError(String),
}

impl MemForgeError {
    /// Categorize the error for handling decisions
    ///
    /// Consistency violations signal a caller bug and have no recovery path;
    /// backend errors are environment conditions and propagate to the caller.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MemForgeError::DoubleRegistration { .. }
            | MemForgeError::UnknownAddress { .. }
            | MemForgeError::UntrackedErase { .. }
            | MemForgeError::NotABase { .. }
            | MemForgeError::MirrorMissing { .. }
            | MemForgeError::CopyOutOfBounds { .. } => ErrorCategory::Consistency,

            MemForgeError::AllocationFailed { .. }
            | MemForgeError::CopyFailed(_)
            | MemForgeError::DeviceUnavailable(_)
            | MemForgeError::DeviceError(_) => ErrorCategory::Backend,

            MemForgeError::InvalidConfiguration(_) => ErrorCategory::Config,

            MemForgeError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is a consistency violation (caller bug)
    ///
    /// These are never retried: they indicate the surrounding allocator broke
    /// the registration discipline, not a transient condition.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::Consistency)
    }

    /// Check if this error may be worth retrying after the environment changes
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Backend)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller bug - abort the operation, no retry
    Consistency,
    /// Device runtime failure - propagate to the caller
    Backend,
    /// Invalid configuration
    Config,
    /// Bug in the manager itself
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Consistency => write!(f, "Consistency"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Config => write!(f, "Config"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Helper type alias for Results using MemForgeError
pub type MemResult<T> = std::result::Result<T, MemForgeError>;

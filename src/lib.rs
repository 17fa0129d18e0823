//! MemForge - host/device memory coherence manager
//!
//! A pointer-indexed coherence layer for numerical libraries: every tracked
//! heap buffer is lazily mirrored on an accelerator device, and any address
//! - including addresses into the middle of a tracked buffer - resolves to
//! the correct host or device address for the current execution mode.
//!
//! Collaborators register a buffer once, then only ever ask "give me a
//! usable address" ([`MemoryManager::resolve`]) or "synchronize now"
//! ([`MemoryManager::push`] / [`MemoryManager::pull`]); the resolver
//! classifies the address against the ledger and drives the device memory
//! provider as needed.

pub mod backend;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod manager;

pub use backend::{CopyMode, DeviceAddr, DeviceAlloc, DeviceHandle, DeviceMemory, HostEmulation};
pub use config::{ExecConfig, ProviderKind};
pub use error::{ErrorCategory, MemForgeError, MemResult};
pub use ledger::{Ledger, PtrClass, TrackedBuffer};
pub use logging::{init_logging_default, LoggingConfig};
pub use manager::MemoryManager;

#[cfg(feature = "rocm")]
pub use backend::HipDriver;
#[cfg(feature = "opencl")]
pub use backend::OpenClRuntime;

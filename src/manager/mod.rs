//! Coherence resolver
//!
//! `MemoryManager` is the explicitly owned context object behind every
//! memory-management call: it holds the ledger, the execution-mode snapshot
//! and the device memory provider, and implements the per-buffer two-state
//! machine (host-authoritative / device-authoritative) with lazy device
//! allocation and alias co-migration.
//!
//! Single-threaded cooperative by design: callers from multiple threads need
//! external locking.

use std::panic::Location;
use std::ptr;

use once_cell::sync::Lazy;

use crate::backend::{create_backend, CopyMode, DeviceAlloc, DeviceHandle, DeviceMemory};
use crate::config::ExecConfig;
use crate::error::{MemForgeError, MemResult};
use crate::ledger::{Ledger, PtrClass};

/// Environment toggle for the diagnostic dump
const DEBUG_DUMP_ENV: &str = "MEMFORGE_DEBUG_MM";

static DEBUG_DUMP: Lazy<bool> = Lazy::new(|| {
    std::env::var(DEBUG_DUMP_ENV)
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
});

/// Host/device memory coherence manager
#[derive(Debug)]
pub struct MemoryManager {
    ledger: Ledger,
    config: ExecConfig,
    backend: Box<dyn DeviceMemory>,
}

impl MemoryManager {
    /// Create a manager with the provider named by the configuration
    pub fn new(config: ExecConfig) -> MemResult<Self> {
        let backend = create_backend(config.provider())?;
        Ok(MemoryManager {
            ledger: Ledger::new(),
            config,
            backend,
        })
    }

    /// Create a manager over a caller-supplied provider
    pub fn with_backend(config: ExecConfig, backend: Box<dyn DeviceMemory>) -> Self {
        MemoryManager {
            ledger: Ledger::new(),
            config,
            backend,
        }
    }

    /// The current execution-mode snapshot
    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// The ledger, for inspection
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The active device memory provider
    pub fn backend(&self) -> &dyn DeviceMemory {
        self.backend.as_ref()
    }

    /// Enable device execution (sets the sticky ever-enabled flag)
    pub fn enable_device(&mut self) {
        self.config.enable_device();
    }

    /// Disable device execution
    pub fn disable_device(&mut self) {
        self.config.disable_device();
    }

    // Register/Deregister gate: inactive manager tracks nothing.
    fn passthrough(&self) -> bool {
        !self.config.is_active()
    }

    // Resolve/Push/Pull gate: also passthrough until a device mode has been
    // engaged at least once.
    fn passthrough_until_device(&self) -> bool {
        !self.config.is_active() || !self.config.device_ever_enabled()
    }

    /// Track a heap buffer
    ///
    /// Called once per allocation the library wants coherence-tracked. The
    /// call site is captured for diagnostics. Registering a live base key
    /// twice is a consistency violation.
    #[track_caller]
    pub fn register(&mut self, ptr: *mut u8, bytes: usize) -> MemResult<*mut u8> {
        if self.passthrough() {
            return Ok(ptr);
        }
        let site = Location::caller();
        self.ledger.insert(ptr as usize, bytes, site)?;
        tracing::trace!("registered {:p} ({} bytes) at {}", ptr, bytes, site);
        Ok(ptr)
    }

    /// Stop tracking a buffer, cascading removal of its aliases and
    /// releasing its device mirror
    ///
    /// Erasing an untracked address is fatal while a device is currently
    /// enabled and silently tolerated otherwise (host-only execution never
    /// required registration symmetry).
    pub fn deregister(&mut self, ptr: *mut u8) -> MemResult<*mut u8> {
        if self.passthrough() {
            return Ok(ptr);
        }
        let addr = ptr as usize;
        match self.ledger.remove(addr) {
            Some(buffer) => {
                if let Some(mirror) = buffer.mirror {
                    self.backend.release(mirror)?;
                }
                tracing::trace!("deregistered {:p}", ptr);
                Ok(ptr)
            }
            None if self.config.device_enabled() => Err(MemForgeError::UntrackedErase { addr }),
            None => {
                tracing::trace!("ignoring untracked erase of {:p} in host-only mode", ptr);
                Ok(ptr)
            }
        }
    }

    /// Map an address to the one usable in the current execution mode,
    /// migrating the owning buffer if its authoritative side does not match
    ///
    /// Passthrough until a device mode has ever been engaged; from then on
    /// an untracked address is a consistency violation even while the
    /// device is currently disabled.
    pub fn resolve(&mut self, ptr: *mut u8) -> MemResult<*mut u8> {
        if self.passthrough_until_device() {
            return Ok(ptr);
        }
        let addr = ptr as usize;
        let resolved = match self.ledger.classify(addr) {
            PtrClass::Base => self.resolve_base(addr)?,
            PtrClass::Alias => self.resolve_alias(addr)?,
            PtrClass::Unknown => return Err(MemForgeError::UnknownAddress { addr }),
        };
        Ok(resolved as *mut u8)
    }

    fn resolve_base(&mut self, addr: usize) -> MemResult<usize> {
        let using = self.config.using_device();
        let buffer = self
            .ledger
            .get_mut(addr)
            .ok_or_else(|| missing_after_classify(addr))?;

        if buffer.host && !using {
            return Ok(addr);
        }
        if buffer.mirror.is_none() {
            buffer.mirror = Some(self.backend.allocate(buffer.bytes())?);
        }
        let mirror = buffer.mirror.ok_or_else(|| missing_after_classify(addr))?;
        let bytes = buffer.bytes();

        if !buffer.host && using {
            return Ok(mirror.addr.0);
        }
        if !buffer.host && !using {
            // Pull: device copy is authoritative but execution moved back to
            // the host.
            self.backend.copy_to_host(addr as *mut u8, mirror.addr, bytes)?;
            buffer.host = true;
            tracing::debug!("pulled {} bytes to {:#x}", bytes, addr);
            return Ok(addr);
        }
        // Push: host copy is authoritative and execution is on the device.
        self.backend
            .copy_to_device(mirror.addr, addr as *const u8, bytes, CopyMode::Sync)?;
        buffer.host = false;
        tracing::debug!("pushed {} bytes from {:#x}", bytes, addr);
        Ok(mirror.addr.0)
    }

    fn resolve_alias(&mut self, addr: usize) -> MemResult<usize> {
        let using = self.config.using_device();
        let entry = self
            .ledger
            .alias(addr)
            .ok_or_else(|| missing_after_classify(addr))?;
        let base = entry.base();
        let buffer = self
            .ledger
            .get_mut(base)
            .ok_or_else(|| missing_after_classify(base))?;

        if buffer.host && !using {
            return Ok(addr);
        }
        if buffer.mirror.is_none() {
            buffer.mirror = Some(self.backend.allocate(buffer.bytes())?);
        }
        let mirror = buffer.mirror.ok_or_else(|| missing_after_classify(base))?;
        let bytes = buffer.bytes();
        let device_addr = mirror.addr.offset(entry.offset())?;

        if !buffer.host && using {
            return Ok(device_addr.0);
        }
        // Aliases migrate with their owner: both directions copy the entire
        // owning buffer, never the aliased slice alone.
        if !buffer.host && !using {
            self.backend.copy_to_host(base as *mut u8, mirror.addr, bytes)?;
            buffer.host = true;
            tracing::debug!("pulled owner {:#x} ({} bytes) for alias {:#x}", base, bytes, addr);
            return Ok(addr);
        }
        self.backend
            .copy_to_device(mirror.addr, base as *const u8, bytes, CopyMode::Sync)?;
        buffer.host = false;
        tracing::debug!("pushed owner {:#x} ({} bytes) for alias {:#x}", base, bytes, addr);
        Ok(device_addr.0)
    }

    /// Explicit host-to-device copy of a tracked address
    ///
    /// Imperative: copies regardless of which side is authoritative and
    /// leaves the authoritative-side bookkeeping untouched. `bytes == 0`
    /// means the full registered size (for an alias, the remainder of the
    /// owner from the alias offset). A base push allocates the mirror
    /// lazily; an alias push requires the owner to be mirrored already.
    pub fn push(&mut self, ptr: *const u8, bytes: usize) -> MemResult<()> {
        if self.passthrough_until_device() {
            return Ok(());
        }
        let addr = ptr as usize;
        match self.ledger.classify(addr) {
            PtrClass::Base => {
                let buffer = self
                    .ledger
                    .get_mut(addr)
                    .ok_or_else(|| missing_after_classify(addr))?;
                if buffer.mirror.is_none() {
                    buffer.mirror = Some(self.backend.allocate(buffer.bytes())?);
                }
                let mirror = buffer.mirror.ok_or_else(|| missing_after_classify(addr))?;
                let n = if bytes == 0 { buffer.bytes() } else { bytes };
                if n > buffer.bytes() {
                    return Err(MemForgeError::CopyOutOfBounds {
                        addr,
                        requested: n,
                        bytes: buffer.bytes(),
                    });
                }
                self.backend
                    .copy_to_device(mirror.addr, ptr, n, CopyMode::Sync)
            }
            PtrClass::Alias => {
                let entry = self
                    .ledger
                    .alias(addr)
                    .ok_or_else(|| missing_after_classify(addr))?;
                let buffer = self
                    .ledger
                    .get(entry.base())
                    .ok_or_else(|| missing_after_classify(entry.base()))?;
                let mirror = buffer
                    .mirror
                    .ok_or(MemForgeError::MirrorMissing { addr })?;
                let n = if bytes == 0 {
                    buffer.bytes() - entry.offset()
                } else {
                    bytes
                };
                if entry.offset() + n > buffer.bytes() {
                    return Err(MemForgeError::CopyOutOfBounds {
                        addr,
                        requested: n,
                        bytes: buffer.bytes(),
                    });
                }
                let dst = mirror.addr.offset(entry.offset())?;
                self.backend.copy_to_device(dst, ptr, n, CopyMode::Sync)
            }
            PtrClass::Unknown => Err(MemForgeError::UnknownAddress { addr }),
        }
    }

    /// Explicit device-to-host copy of a tracked address
    ///
    /// A no-op while the host copy is already authoritative. Same size
    /// semantics as [`push`](Self::push).
    pub fn pull(&mut self, ptr: *mut u8, bytes: usize) -> MemResult<()> {
        if self.passthrough_until_device() {
            return Ok(());
        }
        let addr = ptr as usize;
        match self.ledger.classify(addr) {
            PtrClass::Base => {
                let buffer = self
                    .ledger
                    .get(addr)
                    .ok_or_else(|| missing_after_classify(addr))?;
                if buffer.is_host_authoritative() {
                    return Ok(());
                }
                let mirror = buffer
                    .mirror
                    .ok_or(MemForgeError::MirrorMissing { addr })?;
                let n = if bytes == 0 { buffer.bytes() } else { bytes };
                if n > buffer.bytes() {
                    return Err(MemForgeError::CopyOutOfBounds {
                        addr,
                        requested: n,
                        bytes: buffer.bytes(),
                    });
                }
                self.backend.copy_to_host(ptr, mirror.addr, n)
            }
            PtrClass::Alias => {
                let entry = self
                    .ledger
                    .alias(addr)
                    .ok_or_else(|| missing_after_classify(addr))?;
                let buffer = self
                    .ledger
                    .get(entry.base())
                    .ok_or_else(|| missing_after_classify(entry.base()))?;
                if buffer.is_host_authoritative() {
                    return Ok(());
                }
                let mirror = buffer
                    .mirror
                    .ok_or(MemForgeError::MirrorMissing { addr })?;
                let n = if bytes == 0 {
                    buffer.bytes() - entry.offset()
                } else {
                    bytes
                };
                if entry.offset() + n > buffer.bytes() {
                    return Err(MemForgeError::CopyOutOfBounds {
                        addr,
                        requested: n,
                        bytes: buffer.bytes(),
                    });
                }
                let src = mirror.addr.offset(entry.offset())?;
                self.backend.copy_to_host(ptr, src, n)
            }
            PtrClass::Unknown => Err(MemForgeError::UnknownAddress { addr }),
        }
    }

    /// Opaque device memory object for a tracked base address
    ///
    /// For collaborators that hand device memory to an external kernel
    /// compilation framework. Allocates the mirror on first use, performs
    /// the initial upload on the implicit stream and marks the device copy
    /// authoritative. Fatal while the manager is inactive, and for any
    /// address that is not a tracked base.
    pub fn device_mirror(&mut self, ptr: *const u8) -> MemResult<DeviceHandle> {
        if !self.config.is_active() {
            return Err(MemForgeError::InvalidConfiguration(
                "device memory object requested while the manager is inactive".to_string(),
            ));
        }
        let addr = ptr as usize;
        match self.ledger.classify(addr) {
            PtrClass::Base => {}
            PtrClass::Alias => return Err(MemForgeError::NotABase { addr }),
            PtrClass::Unknown => return Err(MemForgeError::UnknownAddress { addr }),
        }
        let buffer = self
            .ledger
            .get_mut(addr)
            .ok_or_else(|| missing_after_classify(addr))?;
        let bytes = buffer.bytes();

        if buffer.mirror.is_none() {
            let alloc = self.backend.allocate(bytes)?;
            self.backend
                .copy_to_device(alloc.addr, ptr, bytes, CopyMode::Async)?;
            buffer.mirror = Some(alloc);
            // This address is no longer current on the host.
            buffer.host = false;
        }
        let mirror = buffer.mirror.ok_or_else(|| missing_after_classify(addr))?;
        let handle = match mirror.handle {
            Some(handle) => handle,
            None => {
                let handle = self.backend.wrap_existing(mirror.addr, bytes)?;
                buffer.mirror = Some(DeviceAlloc {
                    addr: mirror.addr,
                    handle: Some(handle),
                });
                handle
            }
        };
        Ok(handle)
    }

    /// Coherence-aware memcpy
    ///
    /// Resolves both sides before copying on the device; falls back to an
    /// ordinary host copy whenever the process is in host-only execution.
    /// Zero bytes is a no-op.
    pub fn copy_buffer_to_buffer(
        &mut self,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> MemResult<*mut u8> {
        if bytes == 0 {
            return Ok(dst);
        }
        if !self.config.using_device() {
            unsafe {
                ptr::copy(src, dst, bytes);
            }
            return Ok(dst);
        }
        let device_src = self.resolve(src as *mut u8)? as usize;
        let device_dst = self.resolve(dst)? as usize;
        self.backend.copy_on_device(
            crate::backend::DeviceAddr(device_dst),
            crate::backend::DeviceAddr(device_src),
            bytes,
            mode,
        )?;
        Ok(dst)
    }

    /// Whether an address is a tracked base
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.ledger.contains(ptr as usize)
    }

    /// Diagnostic dump of a tracked buffer's registration site and current
    /// residency, gated by the `MEMFORGE_DEBUG_MM` environment toggle
    pub fn dump(&self, ptr: *const u8) {
        if !*DEBUG_DUMP {
            return;
        }
        let addr = ptr as usize;
        match self.ledger.get(addr) {
            Some(buffer) => {
                tracing::info!(
                    "buffer {:#x}: {} bytes, registered at {}, {} authoritative, mirror {}",
                    addr,
                    buffer.bytes(),
                    buffer.site(),
                    if buffer.is_host_authoritative() { "host" } else { "device" },
                    if buffer.has_mirror() { "allocated" } else { "unset" },
                );
            }
            None => tracing::info!("address {:#x} is not tracked", addr),
        }
    }

    /// Wait for all work queued on the provider's implicit stream
    pub fn synchronize(&mut self) -> MemResult<()> {
        self.backend.synchronize()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        for buffer in self.ledger.drain() {
            if let Some(mirror) = buffer.mirror {
                if let Err(err) = self.backend.release(mirror) {
                    tracing::warn!(
                        "failed to release mirror of {:#x} during teardown: {}",
                        buffer.base(),
                        err
                    );
                }
            }
        }
    }
}

fn missing_after_classify(addr: usize) -> MemForgeError {
    MemForgeError::InternalError(format!(
        "address {:#x} vanished from the ledger mid-operation",
        addr
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_manager() -> MemoryManager {
        MemoryManager::new(ExecConfig::new()).unwrap()
    }

    #[test]
    fn test_inactive_manager_passes_everything_through() {
        let mut manager = MemoryManager::new(ExecConfig::inactive()).unwrap();
        let ptr = 0x1000 as *mut u8;
        assert_eq!(manager.register(ptr, 64).unwrap(), ptr);
        assert_eq!(manager.resolve(ptr).unwrap(), ptr);
        assert_eq!(manager.deregister(ptr).unwrap(), ptr);
        assert!(manager.ledger().is_empty());
    }

    #[test]
    fn test_register_captures_call_site() {
        let mut manager = host_manager();
        let ptr = 0x1000 as *mut u8;
        manager.register(ptr, 64).unwrap();
        let site = manager.ledger().get(0x1000).unwrap().site();
        assert!(site.file().ends_with("mod.rs"));
    }

    #[test]
    fn test_double_registration_reports_both_sites() {
        let mut manager = host_manager();
        let ptr = 0x1000 as *mut u8;
        manager.register(ptr, 64).unwrap();
        let err = manager.register(ptr, 128).unwrap_err();
        assert!(err.is_consistency_violation());
        assert!(matches!(err, MemForgeError::DoubleRegistration { addr: 0x1000, .. }));
    }

    #[test]
    fn test_resolve_is_identity_before_any_device() {
        let mut manager = host_manager();
        let mut data = [0u8; 64];
        let ptr = data.as_mut_ptr();
        manager.register(ptr, 64).unwrap();
        // No device has ever been enabled: identity, and no mirror appears.
        assert_eq!(manager.resolve(ptr).unwrap(), ptr);
        assert!(!manager.ledger().get(ptr as usize).unwrap().has_mirror());
        manager.deregister(ptr).unwrap();
    }

    #[test]
    fn test_resolve_unknown_is_identity_before_any_device() {
        let mut manager = host_manager();
        let ptr = 0xdead_0000 as *mut u8;
        assert_eq!(manager.resolve(ptr).unwrap(), ptr);
    }
}

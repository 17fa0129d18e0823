//! Device memory capability
//!
//! The coherence resolver talks to the device exclusively through the
//! `DeviceMemory` trait; it never branches on which provider is behind it.
//! A provider that allocates raw linear addresses leaves `handle` empty and
//! the resolver wraps the address on demand; a provider whose native unit is
//! an opaque memory object returns the handle up front.

use crate::error::{MemForgeError, MemResult};

/// A device-side address
///
/// For the driver provider this is a raw linear device pointer; for the
/// opaque provider it is a provider-assigned address that the provider knows
/// how to map back onto its memory objects. Either way it supports byte
/// offsets, which is all the resolver needs for alias arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr(pub usize);

impl DeviceAddr {
    /// Offset this address by `bytes`, failing on arithmetic overflow
    pub fn offset(self, bytes: usize) -> MemResult<DeviceAddr> {
        self.0
            .checked_add(bytes)
            .map(DeviceAddr)
            .ok_or_else(|| {
                MemForgeError::InternalError(format!(
                    "device pointer arithmetic overflow (base={:#x}, offset={})",
                    self.0, bytes
                ))
            })
    }

    /// Raw pointer view, for handing to FFI
    pub fn as_ptr(self) -> *mut std::ffi::c_void {
        self.0 as *mut std::ffi::c_void
    }
}

/// An opaque device memory object of known size
///
/// Used by collaborators that hand device memory to an external kernel
/// compilation framework instead of dereferencing raw addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    raw: usize,
    bytes: usize,
}

impl DeviceHandle {
    pub(crate) fn new(raw: usize, bytes: usize) -> Self {
        DeviceHandle { raw, bytes }
    }

    /// Provider-specific handle value
    pub fn raw(&self) -> usize {
        self.raw
    }

    /// Size of the memory object in bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// One device-side allocation: an address and, when the provider works in
/// memory objects natively, the handle it was allocated as
#[derive(Debug, Clone, Copy)]
pub struct DeviceAlloc {
    pub addr: DeviceAddr,
    pub handle: Option<DeviceHandle>,
}

/// Synchronous or stream-ordered copy
///
/// Async copies are issued on the provider's single implicit stream and are
/// not waited on; completion ordering relative to later kernel launches is
/// the caller's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    #[default]
    Sync,
    Async,
}

/// The allocate/copy primitives behind the coherence resolver
pub trait DeviceMemory: std::fmt::Debug {
    /// Allocate `bytes` of device memory
    fn allocate(&mut self, bytes: usize) -> MemResult<DeviceAlloc>;

    /// Release an allocation previously returned by `allocate`
    fn release(&mut self, alloc: DeviceAlloc) -> MemResult<()>;

    /// Copy host memory to the device
    fn copy_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> MemResult<()>;

    /// Copy device memory back to the host (always synchronous)
    fn copy_to_host(&mut self, dst: *mut u8, src: DeviceAddr, bytes: usize) -> MemResult<()>;

    /// Copy between two device addresses
    fn copy_on_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> MemResult<()>;

    /// Wrap an existing device address as a memory object of the given size
    /// without allocating (zero-copy interop)
    fn wrap_existing(&mut self, addr: DeviceAddr, bytes: usize) -> MemResult<DeviceHandle>;

    /// The raw address behind a handle
    fn handle_address(&self, handle: DeviceHandle) -> DeviceAddr;

    /// Wait for all work queued on the implicit stream
    fn synchronize(&mut self) -> MemResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_addr_offset() {
        let addr = DeviceAddr(0x1000);
        assert_eq!(addr.offset(0x200).unwrap(), DeviceAddr(0x1200));
        assert_eq!(addr.offset(0).unwrap(), addr);
    }

    #[test]
    fn test_device_addr_offset_overflow() {
        let addr = DeviceAddr(usize::MAX - 4);
        let err = addr.offset(32).unwrap_err();
        assert!(matches!(err, MemForgeError::InternalError(_)));
    }

    #[test]
    fn test_handle_accessors() {
        let handle = DeviceHandle::new(0xdead, 256);
        assert_eq!(handle.raw(), 0xdead);
        assert_eq!(handle.bytes(), 256);
    }
}

//! Host emulation of the device memory capability
//!
//! Device allocations are plain host allocations and copies are `memcpy`s,
//! with the same bounds discipline a real driver enforces. This is the
//! default provider for CPU-only builds and the one the test suite runs
//! against, so coherence semantics are exercised without an accelerator.

use std::collections::BTreeMap;

use crate::backend::device::{CopyMode, DeviceAddr, DeviceAlloc, DeviceHandle, DeviceMemory};
use crate::error::{MemForgeError, MemResult};

/// Device memory provider backed by host allocations
#[derive(Debug, Default)]
pub struct HostEmulation {
    // Keyed by base address of the boxed allocation; BTreeMap so range
    // checks can find the allocation containing an interior address.
    allocations: BTreeMap<usize, Box<[u8]>>,
}

impl HostEmulation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations (leak checks in tests)
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    // Checks that [addr, addr+bytes) lies inside one live allocation.
    fn check_range(&self, addr: DeviceAddr, bytes: usize) -> MemResult<()> {
        let end = addr.offset(bytes)?.0;
        let contained = self
            .allocations
            .range(..=addr.0)
            .next_back()
            .map(|(base, mem)| end <= base + mem.len())
            .unwrap_or(false);
        if contained {
            Ok(())
        } else {
            Err(MemForgeError::CopyFailed(format!(
                "address range {:#x}+{} is not inside any emulated device allocation",
                addr.0, bytes
            )))
        }
    }
}

impl DeviceMemory for HostEmulation {
    fn allocate(&mut self, bytes: usize) -> MemResult<DeviceAlloc> {
        // Zero-byte registrations still need a distinct device address, so
        // allocate at least one byte.
        let mem = vec![0u8; bytes.max(1)].into_boxed_slice();
        let addr = mem.as_ptr() as usize;
        self.allocations.insert(addr, mem);
        tracing::trace!("emulated device allocation: {} bytes at {:#x}", bytes, addr);
        Ok(DeviceAlloc {
            addr: DeviceAddr(addr),
            handle: Some(DeviceHandle::new(addr, bytes)),
        })
    }

    fn release(&mut self, alloc: DeviceAlloc) -> MemResult<()> {
        match self.allocations.remove(&alloc.addr.0) {
            Some(_) => Ok(()),
            None => Err(MemForgeError::InternalError(format!(
                "releasing unknown emulated allocation {:#x}",
                alloc.addr.0
            ))),
        }
    }

    fn copy_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        _mode: CopyMode,
    ) -> MemResult<()> {
        // No stream to order against; async degenerates to sync.
        self.check_range(dst, bytes)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src, dst.0 as *mut u8, bytes);
        }
        Ok(())
    }

    fn copy_to_host(&mut self, dst: *mut u8, src: DeviceAddr, bytes: usize) -> MemResult<()> {
        self.check_range(src, bytes)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.0 as *const u8, dst, bytes);
        }
        Ok(())
    }

    fn copy_on_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        _mode: CopyMode,
    ) -> MemResult<()> {
        self.check_range(src, bytes)?;
        self.check_range(dst, bytes)?;
        // Tracked allocations never overlap, but resolved interior ranges of
        // the same allocation can; copy handles overlap.
        unsafe {
            std::ptr::copy(src.0 as *const u8, dst.0 as *mut u8, bytes);
        }
        Ok(())
    }

    fn wrap_existing(&mut self, addr: DeviceAddr, bytes: usize) -> MemResult<DeviceHandle> {
        Ok(DeviceHandle::new(addr.0, bytes))
    }

    fn handle_address(&self, handle: DeviceHandle) -> DeviceAddr {
        DeviceAddr(handle.raw())
    }

    fn synchronize(&mut self) -> MemResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_round_trip() {
        let mut backend = HostEmulation::new();
        let alloc = backend.allocate(16).unwrap();

        let data = [7u8; 16];
        backend
            .copy_to_device(alloc.addr, data.as_ptr(), 16, CopyMode::Sync)
            .unwrap();

        let mut out = [0u8; 16];
        backend.copy_to_host(out.as_mut_ptr(), alloc.addr, 16).unwrap();
        assert_eq!(out, data);

        backend.release(alloc).unwrap();
        assert_eq!(backend.allocation_count(), 0);
    }

    #[test]
    fn test_interior_offsets_are_valid_copy_targets() {
        let mut backend = HostEmulation::new();
        let alloc = backend.allocate(32).unwrap();
        let data = [1u8; 8];
        backend
            .copy_to_device(alloc.addr.offset(16).unwrap(), data.as_ptr(), 8, CopyMode::Sync)
            .unwrap();

        let mut out = [0u8; 8];
        backend
            .copy_to_host(out.as_mut_ptr(), alloc.addr.offset(16).unwrap(), 8)
            .unwrap();
        assert_eq!(out, data);
        backend.release(alloc).unwrap();
    }

    #[test]
    fn test_out_of_bounds_copy_fails() {
        let mut backend = HostEmulation::new();
        let alloc = backend.allocate(8).unwrap();
        let data = [0u8; 16];
        let err = backend
            .copy_to_device(alloc.addr, data.as_ptr(), 16, CopyMode::Sync)
            .unwrap_err();
        assert!(matches!(err, MemForgeError::CopyFailed(_)));
    }

    #[test]
    fn test_copy_outside_any_allocation_fails() {
        let mut backend = HostEmulation::new();
        let mut out = [0u8; 4];
        let err = backend
            .copy_to_host(out.as_mut_ptr(), DeviceAddr(0x40), 4)
            .unwrap_err();
        assert!(matches!(err, MemForgeError::CopyFailed(_)));
    }

    #[test]
    fn test_device_to_device_copy() {
        let mut backend = HostEmulation::new();
        let a = backend.allocate(8).unwrap();
        let b = backend.allocate(8).unwrap();

        let data = [9u8; 8];
        backend
            .copy_to_device(a.addr, data.as_ptr(), 8, CopyMode::Sync)
            .unwrap();
        backend.copy_on_device(b.addr, a.addr, 8, CopyMode::Async).unwrap();
        backend.synchronize().unwrap();

        let mut out = [0u8; 8];
        backend.copy_to_host(out.as_mut_ptr(), b.addr, 8).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_zero_byte_allocations_get_distinct_addresses() {
        let mut backend = HostEmulation::new();
        let a = backend.allocate(0).unwrap();
        let b = backend.allocate(0).unwrap();
        assert_ne!(a.addr, b.addr);
    }

    #[test]
    fn test_release_unknown_is_an_internal_error() {
        let mut backend = HostEmulation::new();
        let bogus = DeviceAlloc {
            addr: DeviceAddr(0x1234),
            handle: None,
        };
        let err = backend.release(bogus).unwrap_err();
        assert!(matches!(err, MemForgeError::InternalError(_)));
    }

    #[test]
    fn test_handle_round_trip() {
        let mut backend = HostEmulation::new();
        let alloc = backend.allocate(64).unwrap();
        let handle = alloc.handle.unwrap();
        assert_eq!(backend.handle_address(handle), alloc.addr);
        assert_eq!(handle.bytes(), 64);

        let wrapped = backend.wrap_existing(alloc.addr, 64).unwrap();
        assert_eq!(wrapped, handle);
    }
}

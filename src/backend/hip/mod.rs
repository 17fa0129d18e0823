//! HIP driver-managed device memory provider
//!
//! Device memory is raw linear addresses from `hipMalloc`; async copies are
//! queued on a single owned stream so they stay ordered with any kernels the
//! embedding application launches on that stream.

mod ffi;

use std::ptr;

use crate::backend::device::{CopyMode, DeviceAddr, DeviceAlloc, DeviceHandle, DeviceMemory};
use crate::error::{MemForgeError, MemResult};

/// HIP stream wrapper
///
/// Does NOT implement Clone because cloning raw pointers would cause
/// double-free when both instances are dropped.
#[derive(Debug)]
struct HipStream {
    stream: *mut std::ffi::c_void,
}

impl HipStream {
    fn new() -> MemResult<Self> {
        let mut stream: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::hipStreamCreate(&mut stream) };
        if result != ffi::HIP_SUCCESS {
            return Err(MemForgeError::DeviceError(format!(
                "hipStreamCreate failed with code {}",
                result
            )));
        }
        if stream.is_null() {
            return Err(MemForgeError::DeviceError(
                "hipStreamCreate returned null pointer".to_string(),
            ));
        }
        Ok(HipStream { stream })
    }

    fn synchronize(&self) -> MemResult<()> {
        let result = unsafe { ffi::hipStreamSynchronize(self.stream) };
        if result != ffi::HIP_SUCCESS {
            return Err(MemForgeError::DeviceError(format!(
                "hipStreamSynchronize failed with code {}",
                result
            )));
        }
        Ok(())
    }

    fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.stream
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if !self.stream.is_null() {
            unsafe {
                ffi::hipStreamDestroy(self.stream);
            }
        }
    }
}

/// Device memory provider backed by the HIP driver allocator
#[derive(Debug)]
pub struct HipDriver {
    stream: HipStream,
}

impl HipDriver {
    /// Create the provider, failing if no HIP device is present
    pub fn new() -> MemResult<Self> {
        let mut count: i32 = 0;
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if result != ffi::HIP_SUCCESS || count == 0 {
            return Err(MemForgeError::DeviceUnavailable(format!(
                "no HIP device (hipGetDeviceCount code {}, count {})",
                result, count
            )));
        }
        Ok(HipDriver {
            stream: HipStream::new()?,
        })
    }

    /// Free and total device memory in bytes
    pub fn memory_info(&self) -> MemResult<(usize, usize)> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(MemForgeError::DeviceError(format!(
                "hipMemGetInfo failed with code {}",
                result
            )));
        }
        Ok((free, total))
    }

    fn memcpy(
        &self,
        dst: *mut std::ffi::c_void,
        src: *const std::ffi::c_void,
        bytes: usize,
        kind: i32,
        mode: CopyMode,
    ) -> MemResult<()> {
        let result = match mode {
            CopyMode::Sync => unsafe { ffi::hipMemcpy(dst, src, bytes, kind) },
            CopyMode::Async => unsafe {
                ffi::hipMemcpyAsync(dst, src, bytes, kind, self.stream.as_ptr())
            },
        };
        if result != ffi::HIP_SUCCESS {
            return Err(MemForgeError::CopyFailed(format!(
                "hipMemcpy kind {} failed with code {} (dst={:?}, size={})",
                kind, result, dst, bytes
            )));
        }
        Ok(())
    }
}

impl DeviceMemory for HipDriver {
    fn allocate(&mut self, bytes: usize) -> MemResult<DeviceAlloc> {
        let mut ptr: *mut std::ffi::c_void = ptr::null_mut();
        // hipMalloc(_, 0) may legitimately return null; keep the mirror
        // addressable for zero-byte registrations.
        let size = bytes.max(1);
        let result = unsafe { ffi::hipMalloc(&mut ptr, size) };
        if result != ffi::HIP_SUCCESS {
            return Err(MemForgeError::AllocationFailed {
                bytes,
                detail: format!("hipMalloc failed with code {}", result),
            });
        }
        if ptr.is_null() {
            return Err(MemForgeError::AllocationFailed {
                bytes,
                detail: "hipMalloc returned null pointer".to_string(),
            });
        }
        tracing::debug!("hipMalloc: {} bytes at {:?}", bytes, ptr);
        // The driver hands out raw addresses; handles are wrapped on demand.
        Ok(DeviceAlloc {
            addr: DeviceAddr(ptr as usize),
            handle: None,
        })
    }

    fn release(&mut self, alloc: DeviceAlloc) -> MemResult<()> {
        let result = unsafe { ffi::hipFree(alloc.addr.as_ptr()) };
        if result != ffi::HIP_SUCCESS {
            return Err(MemForgeError::DeviceError(format!(
                "hipFree failed with code {} for {:#x}",
                result, alloc.addr.0
            )));
        }
        Ok(())
    }

    fn copy_to_device(
        &mut self,
        dst: DeviceAddr,
        src: *const u8,
        bytes: usize,
        mode: CopyMode,
    ) -> MemResult<()> {
        self.memcpy(
            dst.as_ptr(),
            src as *const std::ffi::c_void,
            bytes,
            ffi::HIP_MEMCPY_HOST_TO_DEVICE,
            mode,
        )
    }

    fn copy_to_host(&mut self, dst: *mut u8, src: DeviceAddr, bytes: usize) -> MemResult<()> {
        self.memcpy(
            dst as *mut std::ffi::c_void,
            src.as_ptr(),
            bytes,
            ffi::HIP_MEMCPY_DEVICE_TO_HOST,
            CopyMode::Sync,
        )
    }

    fn copy_on_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> MemResult<()> {
        self.memcpy(
            dst.as_ptr(),
            src.as_ptr(),
            bytes,
            ffi::HIP_MEMCPY_DEVICE_TO_DEVICE,
            mode,
        )
    }

    fn wrap_existing(&mut self, addr: DeviceAddr, bytes: usize) -> MemResult<DeviceHandle> {
        // Linear addresses are their own handles.
        Ok(DeviceHandle::new(addr.0, bytes))
    }

    fn handle_address(&self, handle: DeviceHandle) -> DeviceAddr {
        DeviceAddr(handle.raw())
    }

    fn synchronize(&mut self) -> MemResult<()> {
        self.stream.synchronize()
    }
}

//! OpenCL opaque-handle device memory provider
//!
//! Device memory here is `cl_mem` objects, not raw addresses. The provider
//! assigns each allocation a synthetic device address (the `cl_mem` pointer
//! value) and maps any interior address back onto (memory object, offset)
//! when a copy is issued, so the resolver can keep doing flat address
//! arithmetic without knowing which provider is underneath.
//!
//! All work goes through a single in-order command queue; an async copy is a
//! non-blocking enqueue on that queue.

mod ffi;

use std::collections::{BTreeMap, HashMap};
use std::ptr;

use crate::backend::device::{CopyMode, DeviceAddr, DeviceAlloc, DeviceHandle, DeviceMemory};
use crate::error::{MemForgeError, MemResult};

#[derive(Debug, Clone, Copy)]
struct ClAllocation {
    mem: ffi::ClMem,
    bytes: usize,
}

/// Device memory provider backed by OpenCL memory objects
#[derive(Debug)]
pub struct OpenClRuntime {
    context: ffi::ClContext,
    queue: ffi::ClCommandQueue,
    // Synthetic address space: allocations keyed by their assigned base
    // address, range-searchable for interior offsets.
    allocations: BTreeMap<usize, ClAllocation>,
    // Zero-copy wraps of foreign addresses: cl_mem value -> wrapped address.
    wrapped: HashMap<usize, usize>,
}

impl OpenClRuntime {
    /// Create the provider on the platform's default device
    pub fn new() -> MemResult<Self> {
        let mut platform: ffi::ClPlatformId = ptr::null_mut();
        let mut num_platforms: ffi::ClUint = 0;
        let status = unsafe { ffi::clGetPlatformIDs(1, &mut platform, &mut num_platforms) };
        if status != ffi::CL_SUCCESS || num_platforms == 0 {
            return Err(MemForgeError::DeviceUnavailable(format!(
                "no OpenCL platform (clGetPlatformIDs code {})",
                status
            )));
        }

        let mut device: ffi::ClDeviceId = ptr::null_mut();
        let status = unsafe {
            ffi::clGetDeviceIDs(
                platform,
                ffi::CL_DEVICE_TYPE_DEFAULT,
                1,
                &mut device,
                ptr::null_mut(),
            )
        };
        if status != ffi::CL_SUCCESS {
            return Err(MemForgeError::DeviceUnavailable(format!(
                "no OpenCL device (clGetDeviceIDs code {})",
                status
            )));
        }

        let mut errcode: ffi::ClInt = 0;
        let context = unsafe {
            ffi::clCreateContext(ptr::null(), 1, &device, ptr::null(), ptr::null_mut(), &mut errcode)
        };
        if errcode != ffi::CL_SUCCESS || context.is_null() {
            return Err(MemForgeError::DeviceError(format!(
                "clCreateContext failed with code {}",
                errcode
            )));
        }

        let queue = unsafe {
            ffi::clCreateCommandQueueWithProperties(context, device, ptr::null(), &mut errcode)
        };
        if errcode != ffi::CL_SUCCESS || queue.is_null() {
            unsafe { ffi::clReleaseContext(context) };
            return Err(MemForgeError::DeviceError(format!(
                "clCreateCommandQueueWithProperties failed with code {}",
                errcode
            )));
        }

        Ok(OpenClRuntime {
            context,
            queue,
            allocations: BTreeMap::new(),
            wrapped: HashMap::new(),
        })
    }

    // Maps [addr, addr+bytes) onto (memory object, offset within it).
    fn locate(&self, addr: DeviceAddr, bytes: usize) -> MemResult<(ffi::ClMem, usize)> {
        let end = addr.offset(bytes)?.0;
        if let Some((base, alloc)) = self.allocations.range(..=addr.0).next_back() {
            if end <= base + alloc.bytes {
                return Ok((alloc.mem, addr.0 - base));
            }
        }
        Err(MemForgeError::CopyFailed(format!(
            "address range {:#x}+{} is not inside any OpenCL allocation",
            addr.0, bytes
        )))
    }

    fn blocking(mode: CopyMode) -> ffi::ClBool {
        match mode {
            CopyMode::Sync => ffi::CL_TRUE,
            CopyMode::Async => ffi::CL_FALSE,
        }
    }
}

impl DeviceMemory for OpenClRuntime {
    fn allocate(&mut self, bytes: usize) -> MemResult<DeviceAlloc> {
        let mut errcode: ffi::ClInt = 0;
        let mem = unsafe {
            ffi::clCreateBuffer(
                self.context,
                ffi::CL_MEM_READ_WRITE,
                bytes.max(1),
                ptr::null_mut(),
                &mut errcode,
            )
        };
        if errcode != ffi::CL_SUCCESS || mem.is_null() {
            return Err(MemForgeError::AllocationFailed {
                bytes,
                detail: format!("clCreateBuffer failed with code {}", errcode),
            });
        }
        let addr = mem as usize;
        self.allocations.insert(addr, ClAllocation { mem, bytes: bytes.max(1) });
        tracing::debug!("clCreateBuffer: {} bytes as {:?}", bytes, mem);
        Ok(DeviceAlloc {
            addr: DeviceAddr(addr),
            handle: Some(DeviceHandle::new(addr, bytes)),
        })
    }

    fn release(&mut self, alloc: DeviceAlloc) -> MemResult<()> {
        let entry = self.allocations.remove(&alloc.addr.0).ok_or_else(|| {
            MemForgeError::InternalError(format!(
                "releasing unknown OpenCL allocation {:#x}",
                alloc.addr.0
            ))
        })?;
        let status = unsafe { ffi::clReleaseMemObject(entry.mem) };
        if status != ffi::CL_SUCCESS {
            return Err(MemForgeError::DeviceError(format!(
                "clReleaseMemObject failed with code {}",
                status
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
        let (mem, offset) = self.locate(dst, bytes)?;
        let status = unsafe {
            ffi::clEnqueueWriteBuffer(
                self.queue,
                mem,
                Self::blocking(mode),
                offset,
                bytes,
                src as *const std::ffi::c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if status != ffi::CL_SUCCESS {
            return Err(MemForgeError::CopyFailed(format!(
                "clEnqueueWriteBuffer failed with code {} (offset={}, size={})",
                status, offset, bytes
            )));
        }
        Ok(())
    }

    fn copy_to_host(&mut self, dst: *mut u8, src: DeviceAddr, bytes: usize) -> MemResult<()> {
        let (mem, offset) = self.locate(src, bytes)?;
        let status = unsafe {
            ffi::clEnqueueReadBuffer(
                self.queue,
                mem,
                ffi::CL_TRUE,
                offset,
                bytes,
                dst as *mut std::ffi::c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if status != ffi::CL_SUCCESS {
            return Err(MemForgeError::CopyFailed(format!(
                "clEnqueueReadBuffer failed with code {} (offset={}, size={})",
                status, offset, bytes
            )));
        }
        Ok(())
    }

    fn copy_on_device(
        &mut self,
        dst: DeviceAddr,
        src: DeviceAddr,
        bytes: usize,
        mode: CopyMode,
    ) -> MemResult<()> {
        let (src_mem, src_offset) = self.locate(src, bytes)?;
        let (dst_mem, dst_offset) = self.locate(dst, bytes)?;
        let status = unsafe {
            ffi::clEnqueueCopyBuffer(
                self.queue,
                src_mem,
                dst_mem,
                src_offset,
                dst_offset,
                bytes,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if status != ffi::CL_SUCCESS {
            return Err(MemForgeError::CopyFailed(format!(
                "clEnqueueCopyBuffer failed with code {}",
                status
            )));
        }
        if mode == CopyMode::Sync {
            self.synchronize()?;
        }
        Ok(())
    }

    fn wrap_existing(&mut self, addr: DeviceAddr, bytes: usize) -> MemResult<DeviceHandle> {
        let mut errcode: ffi::ClInt = 0;
        let mem = unsafe {
            ffi::clCreateBuffer(
                self.context,
                ffi::CL_MEM_READ_WRITE | ffi::CL_MEM_USE_HOST_PTR,
                bytes.max(1),
                addr.as_ptr(),
                &mut errcode,
            )
        };
        if errcode != ffi::CL_SUCCESS || mem.is_null() {
            return Err(MemForgeError::DeviceError(format!(
                "clCreateBuffer(CL_MEM_USE_HOST_PTR) failed with code {}",
                errcode
            )));
        }
        self.wrapped.insert(mem as usize, addr.0);
        Ok(DeviceHandle::new(mem as usize, bytes))
    }

    fn handle_address(&self, handle: DeviceHandle) -> DeviceAddr {
        // Native allocations use the cl_mem value as their address; wrapped
        // handles report the address they wrap.
        match self.wrapped.get(&handle.raw()) {
            Some(addr) => DeviceAddr(*addr),
            None => DeviceAddr(handle.raw()),
        }
    }

    fn synchronize(&mut self) -> MemResult<()> {
        let status = unsafe { ffi::clFinish(self.queue) };
        if status != ffi::CL_SUCCESS {
            return Err(MemForgeError::DeviceError(format!(
                "clFinish failed with code {}",
                status
            )));
        }
        Ok(())
    }
}

impl Drop for OpenClRuntime {
    fn drop(&mut self) {
        unsafe {
            for alloc in self.allocations.values() {
                ffi::clReleaseMemObject(alloc.mem);
            }
            for mem in self.wrapped.keys() {
                ffi::clReleaseMemObject(*mem as ffi::ClMem);
            }
            if !self.queue.is_null() {
                ffi::clReleaseCommandQueue(self.queue);
            }
            if !self.context.is_null() {
                ffi::clReleaseContext(self.context);
            }
        }
    }
}

//! OpenCL FFI bindings
//!
//! Minimal subset of the OpenCL 2.0 C API used by the opaque-handle
//! provider. The dead_code allowance is needed because FFI symbols appear
//! unused to the compiler (they're only called through unsafe blocks).

use std::ffi::c_void;

pub type ClPlatformId = *mut c_void;
pub type ClDeviceId = *mut c_void;
pub type ClContext = *mut c_void;
pub type ClCommandQueue = *mut c_void;
pub type ClMem = *mut c_void;
pub type ClInt = i32;
pub type ClUint = u32;
pub type ClBool = u32;
pub type ClMemFlags = u64;

#[link(name = "OpenCL")]
#[allow(dead_code)]
extern "C" {
    pub fn clGetPlatformIDs(
        num_entries: ClUint,
        platforms: *mut ClPlatformId,
        num_platforms: *mut ClUint,
    ) -> ClInt;
    pub fn clGetDeviceIDs(
        platform: ClPlatformId,
        device_type: u64,
        num_entries: ClUint,
        devices: *mut ClDeviceId,
        num_devices: *mut ClUint,
    ) -> ClInt;
    pub fn clCreateContext(
        properties: *const isize,
        num_devices: ClUint,
        devices: *const ClDeviceId,
        pfn_notify: *const c_void,
        user_data: *mut c_void,
        errcode_ret: *mut ClInt,
    ) -> ClContext;
    pub fn clCreateCommandQueueWithProperties(
        context: ClContext,
        device: ClDeviceId,
        properties: *const u64,
        errcode_ret: *mut ClInt,
    ) -> ClCommandQueue;
    pub fn clCreateBuffer(
        context: ClContext,
        flags: ClMemFlags,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut ClInt,
    ) -> ClMem;
    pub fn clEnqueueWriteBuffer(
        queue: ClCommandQueue,
        buffer: ClMem,
        blocking_write: ClBool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        num_events_in_wait_list: ClUint,
        event_wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    pub fn clEnqueueReadBuffer(
        queue: ClCommandQueue,
        buffer: ClMem,
        blocking_read: ClBool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        num_events_in_wait_list: ClUint,
        event_wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    pub fn clEnqueueCopyBuffer(
        queue: ClCommandQueue,
        src_buffer: ClMem,
        dst_buffer: ClMem,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        num_events_in_wait_list: ClUint,
        event_wait_list: *const c_void,
        event: *mut c_void,
    ) -> ClInt;
    pub fn clFinish(queue: ClCommandQueue) -> ClInt;
    pub fn clReleaseMemObject(memobj: ClMem) -> ClInt;
    pub fn clReleaseCommandQueue(queue: ClCommandQueue) -> ClInt;
    pub fn clReleaseContext(context: ClContext) -> ClInt;
}

/// OpenCL success code
pub const CL_SUCCESS: ClInt = 0;

/// Device type: whatever the platform considers default
pub const CL_DEVICE_TYPE_DEFAULT: u64 = 1 << 0;

/// Buffer is readable and writable by kernels
pub const CL_MEM_READ_WRITE: ClMemFlags = 1 << 0;

/// Use the application-provided host allocation as backing store (zero-copy)
pub const CL_MEM_USE_HOST_PTR: ClMemFlags = 1 << 3;

pub const CL_TRUE: ClBool = 1;
pub const CL_FALSE: ClBool = 0;

//! HIP FFI bindings
//!
//! FFI declarations below are bound to the ROCm HIP API. All functions are
//! actively used through wrapper methods in HipDriver. The dead_code
//! allowance is needed because FFI symbols appear unused to the compiler
//! (they're only called through unsafe blocks).

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: i32) -> i32;
    pub fn hipMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: i32,
        stream: *mut c_void,
    ) -> i32;
    pub fn hipStreamCreate(stream: *mut *mut c_void) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamSynchronize(stream: *mut c_void) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
}

/// HIP memory copy kinds
pub const HIP_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const HIP_MEMCPY_DEVICE_TO_HOST: i32 = 2;
pub const HIP_MEMCPY_DEVICE_TO_DEVICE: i32 = 3;

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

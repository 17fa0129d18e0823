//! Device memory backends
//!
//! One provider is selected at manager construction and stays active for the
//! manager's lifetime. The resolver only ever sees the `DeviceMemory` trait.

pub mod device;
pub mod host;

#[cfg(feature = "rocm")]
pub mod hip;
#[cfg(feature = "opencl")]
pub mod opencl;

pub use device::{CopyMode, DeviceAddr, DeviceAlloc, DeviceHandle, DeviceMemory};
pub use host::HostEmulation;

#[cfg(feature = "rocm")]
pub use hip::HipDriver;
#[cfg(feature = "opencl")]
pub use opencl::OpenClRuntime;

use crate::config::ProviderKind;
use crate::error::MemResult;
#[cfg(not(all(feature = "rocm", feature = "opencl")))]
use crate::error::MemForgeError;

/// Instantiate the provider named by the configuration
pub fn create_backend(kind: ProviderKind) -> MemResult<Box<dyn DeviceMemory>> {
    match kind {
        ProviderKind::HostEmulation => Ok(Box::new(HostEmulation::new())),
        #[cfg(feature = "rocm")]
        ProviderKind::HipDriver => Ok(Box::new(HipDriver::new()?)),
        #[cfg(not(feature = "rocm"))]
        ProviderKind::HipDriver => Err(MemForgeError::DeviceUnavailable(
            "HIP provider requires the `rocm` feature".to_string(),
        )),
        #[cfg(feature = "opencl")]
        ProviderKind::OpenCl => Ok(Box::new(OpenClRuntime::new()?)),
        #[cfg(not(feature = "opencl"))]
        ProviderKind::OpenCl => Err(MemForgeError::DeviceUnavailable(
            "OpenCL provider requires the `opencl` feature".to_string(),
        )),
    }
}

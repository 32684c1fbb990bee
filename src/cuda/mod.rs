//! CUDA backend (cust-based)
//!
//! The [`CudaDevice`] backend is built only when the `cuda` feature is
//! enabled. The detection helpers are always present and report no devices
//! when the feature is off, so callers and tests can check availability unconditionally.

#[cfg(feature = "cuda")]
pub mod device;

#[cfg(feature = "cuda")]
pub use device::CudaDevice;

/// PTX for the kernels in `kernels/cuda/harness_kernels.cu`.
#[cfg(feature = "cuda")]
pub const HARNESS_KERNELS_PTX: &str =
    include_str!(concat!(env!("OUT_DIR"), "/harness_kernels.ptx"));

/// Returns true if a CUDA device is available and the driver API can be initialized.
#[inline]
pub fn cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Returns the number of CUDA devices available (0 on error or when disabled).
#[inline]
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        use cust::{device::Device, prelude::CudaFlags};
        // Never panic when the driver is missing.
        if cust::init(CudaFlags::empty()).is_err() {
            return 0;
        }
        match Device::num_devices() {
            Ok(n) => n as usize,
            Err(_) => 0,
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

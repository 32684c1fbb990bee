pub mod config;
pub mod cuda;
pub mod device;
pub mod error;
pub mod ffi;
pub mod harness;
pub mod kernels;
pub mod launcher;
pub mod utilities;

pub use config::HarnessConfig;
pub use device::emulated::EmulatedDevice;
pub use device::{Device, DevicePtr, DeviceSlice, Dim3, KernelArg, LaunchGeometry};
pub use error::{ErrorCode, HarnessError};
pub use harness::{
    program_fn, DeviceSession, Phase, PhaseTimings, SessionHarness, SessionProgram, SessionResult,
    SessionState,
};
pub use launcher::KernelUnit;

#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;

// Used by `export_session!` expansions in downstream crates.
#[doc(hidden)]
pub use paste;

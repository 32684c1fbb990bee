//! Kernel invocation unit: copy one environment in, run one kernel, copy one
//! typed result buffer out.
//!
//! The kernel is launched as `kernel(device_env, device_result)` with the
//! geometry and element count fixed when the unit is built. Both are trusted;
//! the unit does not check them against device limits.
//!
//! Ownership of device memory:
//! - the device copy of the environment is released before the unit returns;
//! - the device result buffer belongs to the enclosing [`DeviceSession`] and is
//!   released at session teardown.

use crate::device::{DeviceSlice, Dim3, KernelArg, LaunchGeometry};
use crate::error::HarnessError;
use crate::harness::DeviceSession;
use bytemuck::Pod;
use std::marker::PhantomData;
use tracing::debug;

#[derive(Debug)]
pub struct KernelUnit<E, R> {
    kernel: &'static str,
    geometry: LaunchGeometry,
    count: usize,
    _marker: PhantomData<fn(&E) -> R>,
}

impl<E, R> Clone for KernelUnit<E, R> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<E, R> Copy for KernelUnit<E, R> {}

impl<E: Pod, R: Pod> KernelUnit<E, R> {
    pub const fn new(kernel: &'static str, grid: Dim3, block: Dim3, count: usize) -> Self {
        Self {
            kernel,
            geometry: LaunchGeometry::new(grid, block),
            count,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn kernel(&self) -> &'static str {
        self.kernel
    }

    #[inline]
    pub fn geometry(&self) -> LaunchGeometry {
        self.geometry
    }

    /// Number of `R` elements the kernel writes.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Run the kernel and leave its output on the device.
    ///
    /// The returned slice stays owned by `session`; read it with
    /// [`DeviceSession::download`] or pass it to a later kernel.
    pub fn launch(
        &self,
        session: &mut DeviceSession<'_>,
        env: &E,
    ) -> Result<DeviceSlice<R>, HarnessError> {
        if self.count == 0 {
            return Err(HarnessError::InvalidInput(format!(
                "kernel {} has an empty result buffer",
                self.kernel
            )));
        }
        let d_env = session.upload(env)?;
        let d_out = session.alloc_slice::<R>(self.count)?;
        debug!(
            kernel = self.kernel,
            env_bytes = d_env.size_bytes(),
            out_bytes = d_out.size_bytes(),
            "invocation buffers ready"
        );

        let args = [KernelArg::Ptr(d_env.ptr()), KernelArg::Ptr(d_out.ptr())];
        session.launch(self.kernel, self.geometry, &args)?;
        session.synchronize()?;

        session.free(d_env.ptr())?;
        Ok(d_out)
    }

    /// Run the kernel and return a host copy of its `count` results.
    pub fn invoke(&self, session: &mut DeviceSession<'_>, env: &E) -> Result<Vec<R>, HarnessError> {
        let d_out = self.launch(session, env)?;
        let host = session.download(d_out)?;
        debug_assert_eq!(host.len(), self.count);
        Ok(host)
    }
}

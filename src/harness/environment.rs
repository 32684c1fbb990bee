//! Environment staging.
//!
//! An environment is a fixed-size `Pod` value mirrored byte-for-byte on the
//! device. Array inputs cannot live inside it, so they are uploaded first as
//! separate session allocations and referenced from the environment through
//! [`DeviceArrayRef`] fields (device address plus element count).

use crate::device::{DevicePtr, DeviceSlice};
use crate::error::HarnessError;
use crate::harness::DeviceSession;
use bytemuck::{Pod, Zeroable};
use tracing::debug;

/// Device address and element count of an uploaded array, laid out for
/// embedding in a `#[repr(C)]` environment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceArrayRef {
    pub ptr: u64,
    pub len: u64,
}

impl DeviceArrayRef {
    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr)
    }
}

impl<T> From<DeviceSlice<T>> for DeviceArrayRef {
    fn from(s: DeviceSlice<T>) -> Self {
        Self {
            ptr: s.ptr().as_raw(),
            len: s.len() as u64,
        }
    }
}

/// Result of staging: the device copy of the environment and the arrays it
/// references, by name.
#[derive(Debug)]
pub struct StagedEnvironment<E> {
    pub env: DeviceSlice<E>,
    pub arrays: Vec<(String, DeviceArrayRef)>,
}

impl<E> StagedEnvironment<E> {
    pub fn array(&self, name: &str) -> Option<DeviceArrayRef> {
        self.arrays
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| *a)
    }
}

pub struct EnvironmentBuilder<'s, 'd> {
    session: &'s mut DeviceSession<'d>,
    arrays: Vec<(String, DeviceArrayRef)>,
}

impl<'s, 'd> EnvironmentBuilder<'s, 'd> {
    pub fn new(session: &'s mut DeviceSession<'d>) -> Self {
        Self {
            session,
            arrays: Vec::new(),
        }
    }

    /// Upload `host` as a named device array.
    pub fn add_array<T: Pod>(
        &mut self,
        name: &str,
        host: &[T],
    ) -> Result<DeviceArrayRef, HarnessError> {
        if self.arrays.iter().any(|(n, _)| n == name) {
            return Err(HarnessError::InvalidInput(format!(
                "environment array `{name}` added twice"
            )));
        }
        let slice = self.session.upload_slice(host)?;
        let array = DeviceArrayRef::from(slice);
        debug!(name, ptr = %slice.ptr(), len = host.len(), "environment array staged");
        self.arrays.push((name.to_string(), array));
        Ok(array)
    }

    /// Upload the finished environment value.
    pub fn finish<E: Pod>(self, env: &E) -> Result<StagedEnvironment<E>, HarnessError> {
        let env = self.session.upload(env)?;
        Ok(StagedEnvironment {
            env,
            arrays: self.arrays,
        })
    }
}

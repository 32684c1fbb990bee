//! Device backend abstraction.
//!
//! A [`Device`] is the single place where process-wide device state lives
//! (selected ordinal, context, stream). The harness never touches a global
//! context; it borrows one `Device` mutably for the duration of a session.
//!
//! Memory is addressed through opaque [`DevicePtr`] handles and moved as raw
//! bytes; typed views are layered on top by [`DeviceSlice`] and the session.

pub mod emulated;

use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Opaque handle to device-resident memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Three-component extent, used for both grid and block dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn x(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    #[inline]
    pub fn volume(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Grid and block dimensions of one kernel launch. Trusted as given: the
/// harness does not negotiate occupancy or check device limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub grid: Dim3,
    pub block: Dim3,
}

impl LaunchGeometry {
    pub const fn new(grid: Dim3, block: Dim3) -> Self {
        Self { grid, block }
    }

    /// Total threads launched across the grid.
    #[inline]
    pub fn total_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }
}

impl fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid={} block={}", self.grid, self.block)
    }
}

/// One kernel parameter as seen by the backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    I32(i32),
    U32(u32),
    U64(u64),
    F32(f32),
}

impl KernelArg {
    pub fn as_ptr(&self) -> Option<DevicePtr> {
        match self {
            KernelArg::Ptr(p) => Some(*p),
            _ => None,
        }
    }
}

impl From<DevicePtr> for KernelArg {
    fn from(p: DevicePtr) -> Self {
        KernelArg::Ptr(p)
    }
}

/// Typed view over a device allocation of `len` elements of `T`.
#[derive(Debug)]
pub struct DeviceSlice<T> {
    ptr: DevicePtr,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for DeviceSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for DeviceSlice<T> {}

impl<T> DeviceSlice<T> {
    pub(crate) fn new(ptr: DevicePtr, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }
}

/// Backend operations the harness needs from a device.
///
/// Every method maps onto one driver call in the CUDA backend. Implementations
/// report failures as [`HarnessError`]; none of them may abort the process.
pub trait Device {
    /// Human-readable backend name, for logs.
    fn name(&self) -> &str;

    /// Make device `ordinal` the active device. Failure means no usable device.
    fn select(&mut self, ordinal: u32) -> Result<(), HarnessError>;

    /// Establish a clean context on the selected device.
    fn reset(&mut self) -> Result<(), HarnessError>;

    fn allocate(&mut self, size_bytes: usize) -> Result<DevicePtr, HarnessError>;

    fn free(&mut self, ptr: DevicePtr) -> Result<(), HarnessError>;

    /// Copy `src` into the allocation at `dst`. Sizes must match exactly.
    fn copy_to_device(&mut self, src: &[u8], dst: DevicePtr) -> Result<(), HarnessError>;

    /// Copy the allocation at `src` into `dst`. Sizes must match exactly.
    fn copy_from_device(&mut self, src: DevicePtr, dst: &mut [u8]) -> Result<(), HarnessError>;

    /// Enqueue `kernel` on the device stream. Does not wait for completion.
    fn launch(
        &mut self,
        kernel: &str,
        geometry: LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<(), HarnessError>;

    /// Block until all queued work has completed.
    fn synchronize(&mut self) -> Result<(), HarnessError>;

    /// `(free, total)` device memory in bytes when the backend can report it.
    fn mem_info(&self) -> Option<(usize, usize)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_counts_threads() {
        let g = LaunchGeometry::new(Dim3::new(4, 2, 1), Dim3::x(128));
        assert_eq!(g.total_threads(), 4 * 2 * 128);
        assert_eq!(g.to_string(), "grid=(4,2,1) block=(128,1,1)");
    }

    #[test]
    fn slice_reports_bytes() {
        let s: DeviceSlice<f64> = DeviceSlice::new(DevicePtr(0x1000), 10);
        assert_eq!(s.size_bytes(), 80);
        assert_eq!(s.ptr().to_string(), "0x1000");
    }
}

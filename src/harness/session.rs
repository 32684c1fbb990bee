//! Device session: a borrowed device plus the list of every allocation made
//! through it.
//!
//! All device memory obtained during a session goes through
//! [`DeviceSession`], which records the handle before returning it. Handles
//! leave the list exactly once: either through an early [`DeviceSession::free`]
//! or through [`DeviceSession::teardown`], which releases the rest in the order
//! they were recorded. A session dropped without teardown (unwinding) releases
//! what is left in `Drop`.

use crate::config::HarnessConfig;
use crate::device::{Device, DevicePtr, DeviceSlice, KernelArg, LaunchGeometry};
use crate::error::HarnessError;
use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, warn};

/// One tracked device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: DevicePtr,
    pub size_bytes: usize,
}

/// Ordered record of live session allocations.
#[derive(Debug, Default)]
pub(crate) struct AllocationTracker {
    entries: Vec<Allocation>,
}

impl AllocationTracker {
    fn record(&mut self, allocation: Allocation) {
        debug_assert!(
            !self.entries.iter().any(|a| a.ptr == allocation.ptr),
            "handle {} recorded twice",
            allocation.ptr
        );
        self.entries.push(allocation);
    }

    fn forget(&mut self, ptr: DevicePtr) -> Option<Allocation> {
        let idx = self.entries.iter().position(|a| a.ptr == ptr)?;
        Some(self.entries.remove(idx))
    }

    fn drain(&mut self) -> Vec<Allocation> {
        std::mem::take(&mut self.entries)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn total_bytes(&self) -> usize {
        self.entries.iter().map(|a| a.size_bytes).sum()
    }

    fn as_slice(&self) -> &[Allocation] {
        &self.entries
    }
}

/// Outcome of releasing a session's remaining allocations.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Handles released during teardown (attempted frees, in record order).
    pub released: Vec<DevicePtr>,
    /// First free that failed; later handles were still released.
    pub first_error: Option<HarnessError>,
}

pub struct DeviceSession<'d> {
    device: &'d mut dyn Device,
    config: HarnessConfig,
    tracker: AllocationTracker,
    early_frees: usize,
}

impl<'d> DeviceSession<'d> {
    /// Wrap an already selected and reset device.
    pub fn new(device: &'d mut dyn Device, config: HarnessConfig) -> Self {
        Self {
            device,
            config,
            tracker: AllocationTracker::default(),
            early_frees: 0,
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Allocations currently owned by the session, in record order.
    pub fn allocations(&self) -> &[Allocation] {
        self.tracker.as_slice()
    }

    /// Bytes currently held by the session.
    pub fn allocated_bytes(&self) -> usize {
        self.tracker.total_bytes()
    }

    /// Allocations released before teardown through [`DeviceSession::free`].
    pub fn early_frees(&self) -> usize {
        self.early_frees
    }

    fn ensure_will_fit(&self, required: usize) -> Result<(), HarnessError> {
        if !self.config.mem_check {
            return Ok(());
        }
        let headroom = self.config.headroom_bytes;
        match self.device.mem_info() {
            Some((free, _total)) if required.saturating_add(headroom) > free => {
                Err(HarnessError::OutOfMemory {
                    required,
                    free,
                    headroom,
                })
            }
            _ => Ok(()),
        }
    }

    /// Allocate `size_bytes` of device memory and record the handle.
    pub fn alloc_bytes(&mut self, size_bytes: usize) -> Result<DevicePtr, HarnessError> {
        if size_bytes == 0 {
            return Err(HarnessError::InvalidInput("zero-sized device allocation".into()));
        }
        self.ensure_will_fit(size_bytes)?;
        let ptr = self.device.allocate(size_bytes)?;
        self.tracker.record(Allocation { ptr, size_bytes });
        if self.config.debug {
            info!(
                %ptr,
                size_bytes,
                live = self.tracker.len(),
                live_bytes = self.tracker.total_bytes(),
                "device allocation"
            );
        } else {
            debug!(
                %ptr,
                size_bytes,
                live = self.tracker.len(),
                live_bytes = self.tracker.total_bytes(),
                "device allocation"
            );
        }
        Ok(ptr)
    }

    /// Allocate room for `len` elements of `T`. Contents are unspecified.
    pub fn alloc_slice<T: Pod>(&mut self, len: usize) -> Result<DeviceSlice<T>, HarnessError> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| HarnessError::InvalidInput(format!("{len} elements overflow")))?;
        let ptr = self.alloc_bytes(bytes)?;
        Ok(DeviceSlice::new(ptr, len))
    }

    /// Allocate a device copy of one host value.
    pub fn upload<T: Pod>(&mut self, value: &T) -> Result<DeviceSlice<T>, HarnessError> {
        self.upload_slice(std::slice::from_ref(value))
    }

    /// Allocate a device copy of a host slice.
    pub fn upload_slice<T: Pod>(&mut self, host: &[T]) -> Result<DeviceSlice<T>, HarnessError> {
        let slice = self.alloc_slice::<T>(host.len())?;
        self.write(slice, host)?;
        Ok(slice)
    }

    /// Overwrite a device slice with host data of the same length.
    pub fn write<T: Pod>(&mut self, dst: DeviceSlice<T>, host: &[T]) -> Result<(), HarnessError> {
        if host.len() != dst.len() {
            return Err(HarnessError::SizeMismatch {
                expected: dst.size_bytes(),
                actual: std::mem::size_of_val(host),
            });
        }
        self.device
            .copy_to_device(bytemuck::cast_slice(host), dst.ptr())
    }

    /// Copy a device slice into a new host vector.
    pub fn download<T: Pod>(&mut self, src: DeviceSlice<T>) -> Result<Vec<T>, HarnessError> {
        let mut host = vec![T::zeroed(); src.len()];
        self.device
            .copy_from_device(src.ptr(), bytemuck::cast_slice_mut(&mut host))?;
        Ok(host)
    }

    /// Release one allocation before teardown. The handle must belong to this
    /// session and not have been released already.
    pub fn free(&mut self, ptr: DevicePtr) -> Result<(), HarnessError> {
        let allocation = self
            .tracker
            .forget(ptr)
            .ok_or(HarnessError::InvalidHandle(ptr))?;
        self.early_frees += 1;
        debug!(%ptr, size_bytes = allocation.size_bytes, "device free");
        self.device.free(ptr)
    }

    pub fn launch(
        &mut self,
        kernel: &str,
        geometry: LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<(), HarnessError> {
        if self.config.debug {
            info!(kernel, %geometry, threads = geometry.total_threads(), "kernel launch");
        } else {
            debug!(kernel, %geometry, "kernel launch");
        }
        self.device.launch(kernel, geometry, args)
    }

    pub fn synchronize(&mut self) -> Result<(), HarnessError> {
        self.device.synchronize()
    }

    fn release_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for allocation in self.tracker.drain() {
            if let Err(err) = self.device.free(allocation.ptr) {
                warn!(ptr = %allocation.ptr, error = %err, "device free failed");
                if report.first_error.is_none() {
                    report.first_error = Some(err);
                }
            }
            report.released.push(allocation.ptr);
        }
        report
    }

    /// Release every remaining allocation in record order.
    pub fn teardown(mut self) -> TeardownReport {
        self.release_all()
    }
}

impl Drop for DeviceSession<'_> {
    fn drop(&mut self) {
        if !self.tracker.is_empty() {
            warn!(
                remaining = self.tracker.len(),
                "device session dropped without teardown; releasing allocations"
            );
            let _ = self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::emulated::{EmulatedDevice, FaultPlan};

    fn device() -> EmulatedDevice {
        let mut dev = EmulatedDevice::new();
        dev.select(0).unwrap();
        dev.reset().unwrap();
        dev
    }

    #[test]
    fn teardown_frees_in_record_order() {
        let mut dev = device();
        let recorded = {
            let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
            let a = session.alloc_bytes(8).unwrap();
            let b = session.alloc_bytes(16).unwrap();
            let c = session.alloc_bytes(32).unwrap();
            assert_eq!(session.allocated_bytes(), 56);
            let report = session.teardown();
            assert!(report.first_error.is_none());
            assert_eq!(report.released, vec![a, b, c]);
            vec![a, b, c]
        };
        assert_eq!(dev.stats().free_order, recorded);
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn early_free_is_not_repeated_at_teardown() {
        let mut dev = device();
        {
            let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
            let a = session.alloc_bytes(8).unwrap();
            let b = session.alloc_bytes(8).unwrap();
            session.free(a).unwrap();
            assert!(matches!(session.free(a), Err(HarnessError::InvalidHandle(_))));
            assert_eq!(session.allocated_bytes(), 8);
            let report = session.teardown();
            assert_eq!(report.released, vec![b]);
        }
        assert_eq!(dev.stats().frees, 2);
    }

    #[test]
    fn dropped_session_releases_allocations() {
        let mut dev = device();
        {
            let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
            session.alloc_bytes(64).unwrap();
            session.alloc_bytes(64).unwrap();
        }
        assert_eq!(dev.live_allocations(), 0);
        assert_eq!(dev.stats().frees, 2);
    }

    #[test]
    fn zero_sized_allocation_is_rejected() {
        let mut dev = device();
        let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
        assert!(matches!(
            session.alloc_bytes(0),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(session.allocations().is_empty());
    }

    #[test]
    fn memory_check_respects_headroom() {
        let mut dev = device().with_capacity(4096);
        let cfg = HarnessConfig::default().with_headroom(1024);
        let mut session = DeviceSession::new(&mut dev, cfg);
        session.alloc_bytes(2048).unwrap();
        let err = session.alloc_bytes(1500).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::OutOfMemory { required: 1500, free: 2048, headroom: 1024 }
        ));
        assert_eq!(session.allocations().len(), 1);
    }

    #[test]
    fn upload_then_download_is_byte_exact() {
        let mut dev = device();
        let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
        let host = [1.5f32, -2.25, f32::MAX, 0.0];
        let slice = session.upload_slice(&host).unwrap();
        assert_eq!(session.download(slice).unwrap(), host);
    }

    #[test]
    fn failed_copy_keeps_allocation_tracked() {
        let mut dev = device().with_faults(FaultPlan {
            copy_to_device: Some(700),
            ..FaultPlan::default()
        });
        let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
        assert!(session.upload(&7u64).is_err());
        assert_eq!(session.allocations().len(), 1);
        let report = session.teardown();
        assert_eq!(report.released.len(), 1);
    }
}

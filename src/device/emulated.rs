//! Host-memory virtual device.
//!
//! Runs registered Rust kernels over the full grid/block index space on the
//! calling thread, one simulated thread at a time. Launches are queued and
//! executed at `synchronize`, matching the asynchronous launch model of the
//! CUDA backend. Memory is byte-exact, so environments and results make the
//! same round trip they would on hardware.
//!
//! The device also keeps allocation statistics and can inject failures into
//! individual driver calls, which is how the harness invariants are tested on
//! machines without a GPU.

use super::{Device, DevicePtr, Dim3, KernelArg, LaunchGeometry};
use crate::error::{DeviceOp, HarnessError};
use bytemuck::Pod;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

// CUDA_ERROR_INVALID_CONTEXT
const NO_CONTEXT: i32 = 201;
const ALLOC_BASE: u64 = 0x7f00_0000_0000;
const ALLOC_ALIGN: u64 = 256;
// Fill byte for fresh allocations so unwritten output is visible.
const POISON: u8 = 0xCD;

/// Position of one simulated thread inside a launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadCtx {
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub block_idx: Dim3,
    pub thread_idx: Dim3,
}

impl ThreadCtx {
    /// `blockIdx.x * blockDim.x + threadIdx.x`
    #[inline]
    pub fn global_x(&self) -> usize {
        self.block_idx.x as usize * self.block_dim.x as usize + self.thread_idx.x as usize
    }

    /// Flattened thread id across the whole grid, x fastest.
    pub fn global_linear(&self) -> usize {
        let block_linear = (self.block_idx.z as usize * self.grid_dim.y as usize
            + self.block_idx.y as usize)
            * self.grid_dim.x as usize
            + self.block_idx.x as usize;
        let thread_linear = (self.thread_idx.z as usize * self.block_dim.y as usize
            + self.thread_idx.y as usize)
            * self.block_dim.x as usize
            + self.thread_idx.x as usize;
        block_linear * self.block_dim.volume() as usize + thread_linear
    }
}

/// Byte-addressed device memory of the emulated device.
#[derive(Default)]
pub struct EmulatedMemory {
    buffers: HashMap<u64, Vec<u8>>,
    next: u64,
}

impl EmulatedMemory {
    fn allocate(&mut self, size_bytes: usize) -> DevicePtr {
        if self.next == 0 {
            self.next = ALLOC_BASE;
        }
        let ptr = self.next;
        let span = (size_bytes as u64).max(1);
        self.next += (span + ALLOC_ALIGN - 1) / ALLOC_ALIGN * ALLOC_ALIGN;
        self.buffers.insert(ptr, vec![POISON; size_bytes]);
        DevicePtr(ptr)
    }

    fn release(&mut self, ptr: DevicePtr) -> bool {
        self.buffers.remove(&ptr.0).is_some()
    }

    fn bytes(&self, ptr: DevicePtr) -> Result<&[u8], HarnessError> {
        self.buffers
            .get(&ptr.0)
            .map(Vec::as_slice)
            .ok_or(HarnessError::InvalidHandle(ptr))
    }

    fn bytes_mut(&mut self, ptr: DevicePtr) -> Result<&mut [u8], HarnessError> {
        self.buffers
            .get_mut(&ptr.0)
            .map(Vec::as_mut_slice)
            .ok_or(HarnessError::InvalidHandle(ptr))
    }

    /// Size in bytes of the allocation at `ptr`.
    pub fn size_of(&self, ptr: DevicePtr) -> Option<usize> {
        self.buffers.get(&ptr.0).map(Vec::len)
    }

    /// Number of `T` elements the allocation at `ptr` holds.
    pub fn len_of<T: Pod>(&self, ptr: DevicePtr) -> Option<usize> {
        let size = std::mem::size_of::<T>();
        self.size_of(ptr).map(|b| if size == 0 { 0 } else { b / size })
    }

    /// Read element `index` of a `T` array stored at `ptr`.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, index: usize) -> Result<T, HarnessError> {
        let size = std::mem::size_of::<T>();
        let bytes = self.bytes(ptr)?;
        let start = index * size;
        let chunk = bytes
            .get(start..start + size)
            .ok_or(HarnessError::SizeMismatch {
                expected: start + size,
                actual: bytes.len(),
            })?;
        Ok(bytemuck::pod_read_unaligned(chunk))
    }

    /// Write element `index` of a `T` array stored at `ptr`.
    pub fn write<T: Pod>(
        &mut self,
        ptr: DevicePtr,
        index: usize,
        value: T,
    ) -> Result<(), HarnessError> {
        let size = std::mem::size_of::<T>();
        let bytes = self.bytes_mut(ptr)?;
        let actual = bytes.len();
        let start = index * size;
        let chunk = bytes
            .get_mut(start..start + size)
            .ok_or(HarnessError::SizeMismatch {
                expected: start + size,
                actual,
            })?;
        chunk.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    fn live(&self) -> usize {
        self.buffers.len()
    }
}

/// A kernel body executed once per simulated thread.
pub type EmulatedKernel =
    Box<dyn Fn(&ThreadCtx, &[KernelArg], &mut EmulatedMemory) -> Result<(), HarnessError>>;

/// Driver calls that should fail, with the status code to report.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Report zero usable devices.
    pub select: bool,
    pub reset: Option<i32>,
    /// Fail the n-th allocation (0-based) and every one after it.
    pub allocation: Option<(usize, i32)>,
    pub copy_to_device: Option<i32>,
    pub copy_from_device: Option<i32>,
    pub launch: Option<i32>,
    pub synchronize: Option<i32>,
    pub free: Option<i32>,
}

/// Counters and handle history kept by the emulated device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub allocations: usize,
    pub frees: usize,
    pub launches: usize,
    pub synchronizations: usize,
    pub alloc_order: Vec<DevicePtr>,
    pub free_order: Vec<DevicePtr>,
}

struct PendingLaunch {
    kernel: String,
    geometry: LaunchGeometry,
    args: Vec<KernelArg>,
}

pub struct EmulatedDevice {
    device_count: u32,
    selected: Option<u32>,
    context_ready: bool,
    capacity: Option<usize>,
    memory: EmulatedMemory,
    kernels: HashMap<String, EmulatedKernel>,
    pending: Vec<PendingLaunch>,
    faults: FaultPlan,
    stats: DeviceStats,
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("device_count", &self.device_count)
            .field("selected", &self.selected)
            .field("live_allocations", &self.memory.live())
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// A single emulated device with no kernels registered.
    pub fn new() -> Self {
        Self {
            device_count: 1,
            selected: None,
            context_ready: false,
            capacity: None,
            memory: EmulatedMemory::default(),
            kernels: HashMap::new(),
            pending: Vec::new(),
            faults: FaultPlan::default(),
            stats: DeviceStats::default(),
        }
    }

    /// A machine with no devices at all; selection always fails.
    pub fn without_devices() -> Self {
        Self {
            device_count: 0,
            ..Self::new()
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Report a fixed memory capacity through [`Device::mem_info`].
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_kernel<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&ThreadCtx, &[KernelArg], &mut EmulatedMemory) -> Result<(), HarnessError>
            + 'static,
    {
        self.register_kernel(name, body);
        self
    }

    pub fn register_kernel<F>(&mut self, name: &str, body: F)
    where
        F: Fn(&ThreadCtx, &[KernelArg], &mut EmulatedMemory) -> Result<(), HarnessError>
            + 'static,
    {
        self.kernels.insert(name.to_string(), Box::new(body));
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Allocations currently held on the device.
    pub fn live_allocations(&self) -> usize {
        self.memory.live()
    }

    pub fn memory(&self) -> &EmulatedMemory {
        &self.memory
    }

    fn require_context(&self, op: DeviceOp) -> Result<(), HarnessError> {
        if self.selected.is_some() && self.context_ready {
            Ok(())
        } else {
            Err(HarnessError::DeviceApi {
                op,
                code: NO_CONTEXT,
            })
        }
    }

    fn run(&mut self, launch: PendingLaunch) -> Result<(), HarnessError> {
        let body = self
            .kernels
            .get(&launch.kernel)
            .ok_or_else(|| HarnessError::MissingKernelSymbol {
                name: launch.kernel.clone(),
            })?;
        let LaunchGeometry { grid, block } = launch.geometry;
        trace!(kernel = %launch.kernel, geometry = %launch.geometry, "emulated launch");
        for bz in 0..grid.z {
            for by in 0..grid.y {
                for bx in 0..grid.x {
                    for tz in 0..block.z {
                        for ty in 0..block.y {
                            for tx in 0..block.x {
                                let ctx = ThreadCtx {
                                    grid_dim: grid,
                                    block_dim: block,
                                    block_idx: Dim3::new(bx, by, bz),
                                    thread_idx: Dim3::new(tx, ty, tz),
                                };
                                body(&ctx, &launch.args, &mut self.memory)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Device for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn select(&mut self, ordinal: u32) -> Result<(), HarnessError> {
        if self.faults.select || ordinal >= self.device_count {
            return Err(HarnessError::DeviceUnavailable {
                ordinal,
                reason: format!("{} emulated device(s) present", self.device_count),
            });
        }
        self.selected = Some(ordinal);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), HarnessError> {
        if self.selected.is_none() {
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::Reset,
                code: NO_CONTEXT,
            });
        }
        if let Some(code) = self.faults.reset {
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::Reset,
                code,
            });
        }
        self.pending.clear();
        self.context_ready = true;
        Ok(())
    }

    fn allocate(&mut self, size_bytes: usize) -> Result<DevicePtr, HarnessError> {
        self.require_context(DeviceOp::Allocate)?;
        if let Some((nth, code)) = self.faults.allocation {
            if self.stats.allocations >= nth {
                return Err(HarnessError::DeviceApi {
                    op: DeviceOp::Allocate,
                    code,
                });
            }
        }
        let ptr = self.memory.allocate(size_bytes);
        self.stats.allocations += 1;
        self.stats.alloc_order.push(ptr);
        debug!(%ptr, size_bytes, "emulated allocate");
        Ok(ptr)
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::Free)?;
        if let Some(code) = self.faults.free {
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::Free,
                code,
            });
        }
        if !self.memory.release(ptr) {
            return Err(HarnessError::InvalidHandle(ptr));
        }
        self.stats.frees += 1;
        self.stats.free_order.push(ptr);
        debug!(%ptr, "emulated free");
        Ok(())
    }

    fn copy_to_device(&mut self, src: &[u8], dst: DevicePtr) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::CopyToDevice)?;
        if let Some(code) = self.faults.copy_to_device {
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::CopyToDevice,
                code,
            });
        }
        let buf = self.memory.bytes_mut(dst)?;
        if buf.len() != src.len() {
            return Err(HarnessError::SizeMismatch {
                expected: buf.len(),
                actual: src.len(),
            });
        }
        buf.copy_from_slice(src);
        Ok(())
    }

    fn copy_from_device(&mut self, src: DevicePtr, dst: &mut [u8]) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::CopyFromDevice)?;
        if let Some(code) = self.faults.copy_from_device {
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::CopyFromDevice,
                code,
            });
        }
        let buf = self.memory.bytes(src)?;
        if buf.len() != dst.len() {
            return Err(HarnessError::SizeMismatch {
                expected: buf.len(),
                actual: dst.len(),
            });
        }
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn launch(
        &mut self,
        kernel: &str,
        geometry: LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::Launch)?;
        if let Some(code) = self.faults.launch {
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::Launch,
                code,
            });
        }
        if !self.kernels.contains_key(kernel) {
            return Err(HarnessError::MissingKernelSymbol {
                name: kernel.to_string(),
            });
        }
        self.stats.launches += 1;
        self.pending.push(PendingLaunch {
            kernel: kernel.to_string(),
            geometry,
            args: args.to_vec(),
        });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::Synchronize)?;
        if let Some(code) = self.faults.synchronize {
            self.pending.clear();
            return Err(HarnessError::DeviceApi {
                op: DeviceOp::Synchronize,
                code,
            });
        }
        self.stats.synchronizations += 1;
        let queued = std::mem::take(&mut self.pending);
        for launch in queued {
            self.run(launch)?;
        }
        Ok(())
    }

    fn mem_info(&self) -> Option<(usize, usize)> {
        self.capacity.map(|total| {
            let used: usize = self.memory.buffers.values().map(Vec::len).sum();
            (total.saturating_sub(used), total)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> EmulatedDevice {
        let mut dev = EmulatedDevice::new().with_kernel("fill_index", |ctx, args, mem| {
            let out = args[0].as_ptr().expect("out ptr");
            let i = ctx.global_x();
            if i < mem.len_of::<u32>(out).unwrap_or(0) {
                mem.write(out, i, i as u32)?;
            }
            Ok(())
        });
        dev.select(0).unwrap();
        dev.reset().unwrap();
        dev
    }

    #[test]
    fn selection_fails_without_devices() {
        let mut dev = EmulatedDevice::without_devices();
        let err = dev.select(0).unwrap_err();
        assert!(matches!(err, HarnessError::DeviceUnavailable { ordinal: 0, .. }));
    }

    #[test]
    fn calls_before_reset_have_no_context() {
        let mut dev = EmulatedDevice::new();
        dev.select(0).unwrap();
        let err = dev.allocate(16).unwrap_err();
        assert!(matches!(err, HarnessError::DeviceApi { code: NO_CONTEXT, .. }));
    }

    #[test]
    fn launch_runs_only_after_synchronize() {
        let mut dev = ready();
        let out = dev.allocate(8 * 4).unwrap();
        let geometry = LaunchGeometry::new(Dim3::x(2), Dim3::x(4));
        dev.launch("fill_index", geometry, &[KernelArg::Ptr(out)]).unwrap();
        assert_eq!(dev.memory().read::<u32>(out, 3).unwrap(), 0xCDCD_CDCD);
        dev.synchronize().unwrap();
        let mut host = [0u8; 32];
        dev.copy_from_device(out, &mut host).unwrap();
        let vals: Vec<u32> = host
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(vals, (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut dev = ready();
        let p = dev.allocate(4).unwrap();
        dev.free(p).unwrap();
        assert!(matches!(dev.free(p), Err(HarnessError::InvalidHandle(q)) if q == p));
        assert_eq!(dev.stats().frees, 1);
    }

    #[test]
    fn unknown_kernel_is_a_missing_symbol() {
        let mut dev = ready();
        let geometry = LaunchGeometry::new(Dim3::x(1), Dim3::x(1));
        let err = dev.launch("nope", geometry, &[]).unwrap_err();
        assert!(matches!(err, HarnessError::MissingKernelSymbol { .. }));
    }

    #[test]
    fn thread_ids_cover_multi_dimensional_grids() {
        let ctx = ThreadCtx {
            grid_dim: Dim3::new(2, 2, 1),
            block_dim: Dim3::new(2, 2, 1),
            block_idx: Dim3::new(1, 1, 0),
            thread_idx: Dim3::new(1, 1, 0),
        };
        assert_eq!(ctx.global_linear(), 15);
        assert_eq!(ctx.global_x(), 3);
    }

    #[test]
    fn mem_info_tracks_capacity() {
        let mut dev = EmulatedDevice::new().with_capacity(1024);
        dev.select(0).unwrap();
        dev.reset().unwrap();
        dev.allocate(100).unwrap();
        assert_eq!(dev.mem_info(), Some((924, 1024)));
    }
}

//! CUDA driver backend for the harness.
//!
//! - `select`: driver init + device lookup; a missing driver or ordinal is
//!   reported as `DeviceUnavailable`
//! - `reset`: drops everything from the previous session, creates a fresh
//!   context and non-blocking stream, JIT-loads the registered PTX modules
//!   (DetermineTargetFromContext + O2 with fallbacks)
//! - memory: one `DeviceBuffer<u8>` per allocation, keyed by raw device pointer
//! - `launch`: looks the symbol up in every loaded module, enqueues on the
//!   stream; completion is observed through `synchronize`

#![cfg(feature = "cuda")]

use crate::device::{Device, DevicePtr, KernelArg, LaunchGeometry};
use crate::error::{DeviceOp, HarnessError};
use cust::context::Context;
use cust::device::Device as CuDevice;
use cust::function::{BlockSize, GridSize};
use cust::memory::{mem_get_info, CopyDestination, DeviceBuffer};
use cust::module::{Module, ModuleJitOption, OptLevel};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use std::collections::HashMap;
use std::ffi::c_void;
use tracing::{debug, info};

// CUDA_ERROR_INVALID_CONTEXT
const NO_CONTEXT: i32 = 201;

struct PtxSource {
    label: String,
    ptx: String,
}

/// Fields drop in declaration order: buffers and modules go before the
/// stream and context they were created in.
pub struct CudaDevice {
    buffers: HashMap<u64, DeviceBuffer<u8>>,
    modules: Vec<(String, Module)>,
    stream: Option<Stream>,
    context: Option<Context>,
    device: Option<CuDevice>,
    ordinal: Option<u32>,
    sources: Vec<PtxSource>,
    name: String,
}

impl Default for CudaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CudaDevice {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            modules: Vec::new(),
            stream: None,
            context: None,
            device: None,
            ordinal: None,
            sources: Vec::new(),
            name: "cuda".to_string(),
        }
    }

    /// Register a PTX module, loaded on every `reset`.
    pub fn with_ptx(mut self, label: &str, ptx: &str) -> Self {
        self.sources.push(PtxSource {
            label: label.to_string(),
            ptx: ptx.to_string(),
        });
        self
    }

    /// Device backed by the kernels compiled from `kernels/cuda`.
    pub fn with_harness_kernels() -> Self {
        Self::new().with_ptx("harness_kernels", super::HARNESS_KERNELS_PTX)
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.ordinal
    }

    fn load_module(ptx: &str) -> Result<Module, HarnessError> {
        let jit_opts = &[
            ModuleJitOption::DetermineTargetFromContext,
            ModuleJitOption::OptLevel(OptLevel::O2),
        ];
        Module::from_ptx(ptx, jit_opts)
            .or_else(|_| Module::from_ptx(ptx, &[ModuleJitOption::DetermineTargetFromContext]))
            .or_else(|_| Module::from_ptx(ptx, &[]))
            .map_err(|e| HarnessError::DeviceApi {
                op: DeviceOp::LoadModule,
                code: e as i32,
            })
    }

    fn stream(&self, op: DeviceOp) -> Result<&Stream, HarnessError> {
        match (&self.context, &self.stream) {
            (Some(_), Some(stream)) => Ok(stream),
            _ => Err(HarnessError::DeviceApi {
                op,
                code: NO_CONTEXT,
            }),
        }
    }

    fn require_context(&self, op: DeviceOp) -> Result<(), HarnessError> {
        self.stream(op).map(|_| ())
    }

    fn release_session_state(&mut self) {
        self.buffers.clear();
        self.modules.clear();
        self.stream = None;
        self.context = None;
    }
}

impl Device for CudaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn select(&mut self, ordinal: u32) -> Result<(), HarnessError> {
        let unavailable = |reason: String| HarnessError::DeviceUnavailable { ordinal, reason };
        cust::init(CudaFlags::empty())
            .map_err(|e| unavailable(format!("driver init failed: {e}")))?;
        let count = CuDevice::num_devices()
            .map_err(|e| unavailable(format!("device query failed: {e}")))?;
        if ordinal >= count {
            return Err(unavailable(format!("{count} CUDA device(s) present")));
        }
        let device =
            CuDevice::get_device(ordinal).map_err(|e| unavailable(e.to_string()))?;
        self.name = device
            .name()
            .map(|n| format!("cuda:{ordinal} ({n})"))
            .unwrap_or_else(|_| format!("cuda:{ordinal}"));
        self.device = Some(device);
        self.ordinal = Some(ordinal);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), HarnessError> {
        let device = self.device.ok_or(HarnessError::DeviceApi {
            op: DeviceOp::Reset,
            code: NO_CONTEXT,
        })?;
        self.release_session_state();
        let context = Context::new(device)?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        self.context = Some(context);
        self.stream = Some(stream);
        for src in &self.sources {
            let module = Self::load_module(&src.ptx)?;
            debug!(module = %src.label, "ptx module loaded");
            self.modules.push((src.label.clone(), module));
        }
        info!(device = %self.name, modules = self.modules.len(), "cuda context ready");
        Ok(())
    }

    fn allocate(&mut self, size_bytes: usize) -> Result<DevicePtr, HarnessError> {
        self.require_context(DeviceOp::Allocate)?;
        let buf: DeviceBuffer<u8> = unsafe { DeviceBuffer::uninitialized(size_bytes) }?;
        let raw = buf.as_device_ptr().as_raw() as u64;
        self.buffers.insert(raw, buf);
        Ok(DevicePtr(raw))
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::Free)?;
        let buf = self
            .buffers
            .remove(&ptr.as_raw())
            .ok_or(HarnessError::InvalidHandle(ptr))?;
        DeviceBuffer::drop(buf).map_err(|(e, buf)| {
            // The handle has left the session; do not free it a second time.
            std::mem::forget(buf);
            HarnessError::Cuda(e)
        })
    }

    fn copy_to_device(&mut self, src: &[u8], dst: DevicePtr) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::CopyToDevice)?;
        let buf = self
            .buffers
            .get_mut(&dst.as_raw())
            .ok_or(HarnessError::InvalidHandle(dst))?;
        if buf.len() != src.len() {
            return Err(HarnessError::SizeMismatch {
                expected: buf.len(),
                actual: src.len(),
            });
        }
        buf.copy_from(src)?;
        Ok(())
    }

    fn copy_from_device(&mut self, src: DevicePtr, dst: &mut [u8]) -> Result<(), HarnessError> {
        self.require_context(DeviceOp::CopyFromDevice)?;
        let buf = self
            .buffers
            .get(&src.as_raw())
            .ok_or(HarnessError::InvalidHandle(src))?;
        if buf.len() != dst.len() {
            return Err(HarnessError::SizeMismatch {
                expected: buf.len(),
                actual: dst.len(),
            });
        }
        buf.copy_to(dst)?;
        Ok(())
    }

    fn launch(
        &mut self,
        kernel: &str,
        geometry: LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<(), HarnessError> {
        let stream = self.stream(DeviceOp::Launch)?;
        let func = self
            .modules
            .iter()
            .find_map(|(_, m)| m.get_function(kernel).ok())
            .ok_or_else(|| HarnessError::MissingKernelSymbol {
                name: kernel.to_string(),
            })?;

        // One 8-byte slot per parameter; narrower values sit in the low bytes
        // (little-endian hosts).
        let mut slots: Vec<u64> = args
            .iter()
            .map(|a| match *a {
                KernelArg::Ptr(p) => p.as_raw(),
                KernelArg::I32(v) => v as u32 as u64,
                KernelArg::U32(v) => v as u64,
                KernelArg::U64(v) => v,
                KernelArg::F32(v) => v.to_bits() as u64,
            })
            .collect();
        let params: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|s| s as *mut u64 as *mut c_void)
            .collect();

        let g = geometry.grid;
        let b = geometry.block;
        let grid: GridSize = (g.x, g.y, g.z).into();
        let block: BlockSize = (b.x, b.y, b.z).into();
        unsafe {
            stream.launch(&func, grid, block, 0, &params)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), HarnessError> {
        self.stream(DeviceOp::Synchronize)?.synchronize()?;
        Ok(())
    }

    fn mem_info(&self) -> Option<(usize, usize)> {
        self.context.as_ref()?;
        mem_get_info().ok()
    }
}

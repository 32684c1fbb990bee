//! Reference kernels shared by the demo binary, the tests and the benches.
//!
//! Each kernel exists twice with identical semantics: as CUDA C in
//! `kernels/cuda/harness_kernels.cu` and as an emulated body registered with
//! [`register_reference_kernels`]. The environment structs below mirror the
//! CUDA layouts.

use crate::device::emulated::EmulatedDevice;
use crate::device::{DevicePtr, DeviceSlice, Dim3, KernelArg};
use crate::error::HarnessError;
use crate::harness::{DeviceSession, SessionProgram};
use crate::launcher::KernelUnit;
use bytemuck::{Pod, Zeroable};

pub const DOUBLE_VALUE: &str = "double_value";
pub const AFFINE_INDEX: &str = "affine_index";

/// Environment of `double_value`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DoubleValueEnv {
    pub value: i32,
}

/// Environment of `affine_index`: `result[i] = scale * i + offset` for
/// `i < count`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AffineEnv {
    pub scale: f32,
    pub offset: f32,
    pub count: u32,
    pub _pad: u32,
}

impl AffineEnv {
    pub fn new(scale: f32, offset: f32, count: u32) -> Self {
        Self {
            scale,
            offset,
            count,
            _pad: 0,
        }
    }
}

/// Single-thread unit writing `value * 2` into a one-element result.
pub const DOUBLE_VALUE_UNIT: KernelUnit<DoubleValueEnv, i32> =
    KernelUnit::new(DOUBLE_VALUE, Dim3::x(1), Dim3::x(1), 1);

/// `affine_index` unit covering `count` elements with 256-thread blocks.
pub fn affine_unit(count: u32) -> KernelUnit<AffineEnv, f32> {
    let block_x = 256u32;
    let grid_x = count.div_ceil(block_x).max(1);
    KernelUnit::new(AFFINE_INDEX, Dim3::x(grid_x), Dim3::x(block_x), count as usize)
}

fn arg_ptr(args: &[KernelArg], i: usize) -> Result<DevicePtr, HarnessError> {
    args.get(i)
        .and_then(KernelArg::as_ptr)
        .ok_or_else(|| HarnessError::InvalidInput(format!("kernel parameter {i} is not a pointer")))
}

/// Register the emulated bodies of every reference kernel.
pub fn register_reference_kernels(device: &mut EmulatedDevice) {
    device.register_kernel(DOUBLE_VALUE, |ctx, args, mem| {
        if ctx.global_x() == 0 {
            let env: DoubleValueEnv = mem.read(arg_ptr(args, 0)?, 0)?;
            mem.write(arg_ptr(args, 1)?, 0, env.value.wrapping_mul(2))?;
        }
        Ok(())
    });
    device.register_kernel(AFFINE_INDEX, |ctx, args, mem| {
        let env: AffineEnv = mem.read(arg_ptr(args, 0)?, 0)?;
        let tid = ctx.global_x();
        if tid < env.count as usize {
            mem.write(arg_ptr(args, 1)?, tid, env.scale * tid as f32 + env.offset)?;
        }
        Ok(())
    });
}

/// Emulated device with the reference kernels registered.
pub fn reference_device() -> EmulatedDevice {
    let mut device = EmulatedDevice::new();
    register_reference_kernels(&mut device);
    device
}

/// Session program for the "double the value" scenario: one invocation of
/// [`DOUBLE_VALUE_UNIT`], its single result copied back.
#[derive(Debug, Default)]
pub struct DoubleValueProgram;

impl SessionProgram for DoubleValueProgram {
    type Environment = DoubleValueEnv;
    type Staged = (DoubleValueEnv, Option<DeviceSlice<i32>>);
    type Output = i32;

    fn prepare_environment(
        &mut self,
        _session: &mut DeviceSession<'_>,
        env: &DoubleValueEnv,
    ) -> Result<Self::Staged, HarnessError> {
        // The unit uploads the environment itself.
        Ok((*env, None))
    }

    fn launch_kernels(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &mut Self::Staged,
    ) -> Result<(), HarnessError> {
        staged.1 = Some(DOUBLE_VALUE_UNIT.launch(session, &staged.0)?);
        Ok(())
    }

    fn copy_back(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &Self::Staged,
    ) -> Result<Vec<i32>, HarnessError> {
        match staged.1 {
            Some(out) => session.download(out),
            None => Err(HarnessError::InvalidInput("no kernel output to copy back".to_string())),
        }
    }
}

/// Session program running `affine_index` over `count` elements.
#[derive(Debug, Default)]
pub struct AffineProgram;

impl SessionProgram for AffineProgram {
    type Environment = AffineEnv;
    type Staged = (AffineEnv, Option<DeviceSlice<f32>>);
    type Output = f32;

    fn prepare_environment(
        &mut self,
        _session: &mut DeviceSession<'_>,
        env: &AffineEnv,
    ) -> Result<Self::Staged, HarnessError> {
        Ok((*env, None))
    }

    fn launch_kernels(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &mut Self::Staged,
    ) -> Result<(), HarnessError> {
        let unit = affine_unit(staged.0.count);
        staged.1 = Some(unit.launch(session, &staged.0)?);
        Ok(())
    }

    fn copy_back(
        &mut self,
        session: &mut DeviceSession<'_>,
        staged: &Self::Staged,
    ) -> Result<Vec<f32>, HarnessError> {
        match staged.1 {
            Some(out) => session.download(out),
            None => Err(HarnessError::InvalidInput("no kernel output to copy back".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_geometry_covers_count() {
        let unit = affine_unit(1000);
        assert_eq!(unit.geometry().grid.x, 4);
        assert!(unit.geometry().total_threads() >= 1000);
        assert_eq!(affine_unit(1).geometry().grid.x, 1);
    }

    #[test]
    fn affine_geometry_near_u32_max() {
        for count in [u32::MAX - 10, u32::MAX] {
            let unit = affine_unit(count);
            assert_eq!(unit.geometry().grid.x, 16_777_216);
            assert!(unit.geometry().total_threads() >= count as u64);
            assert_eq!(unit.count(), count as usize);
        }
    }

    #[test]
    fn double_value_program_doubles() {
        use crate::config::HarnessConfig;
        use crate::harness::SessionHarness;

        let mut dev = reference_device();
        let harness = SessionHarness::new(HarnessConfig::default());
        let res = harness.run(&mut dev, &mut DoubleValueProgram, &DoubleValueEnv { value: 21 });
        assert!(res.is_success(), "{:?}", res.failure);
        assert_eq!(res.output.as_deref(), Some(&[42][..]));
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn environment_layouts_match_cuda() {
        assert_eq!(std::mem::size_of::<DoubleValueEnv>(), 4);
        assert_eq!(std::mem::size_of::<AffineEnv>(), 16);
    }
}

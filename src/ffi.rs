//! C ABI surface.
//!
//! [`export_session!`](crate::export_session) turns a [`SessionProgram`] into a
//! pair of `extern "C"` functions:
//!
//! ```text
//! <name>(env: *const Environment) -> *mut FfiSessionResult
//! <name>_free(result: *mut FfiSessionResult)
//! ```
//!
//! The result record and its output buffer are allocated by Rust and must be
//! released with the matching `_free` function.

use crate::device::Device;
use crate::error::HarnessError;
use crate::harness::{Phase, SessionHarness, SessionProgram, SessionResult};
use bytemuck::Pod;
use std::any::Any;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use tracing::error;

/// Timing slot value for a phase that did not run.
pub const PHASE_NOT_RUN: u64 = u64::MAX;

/// Result record handed across the C ABI.
#[repr(C)]
#[derive(Debug)]
pub struct FfiSessionResult {
    /// `0` on success, `-1` if no device could be selected, otherwise the
    /// numeric code of the first failure.
    pub last_error: i32,
    pub setup_ns: u64,
    pub prepare_env_ns: u64,
    pub kernel_ns: u64,
    pub free_memory_ns: u64,
    /// Host output buffer (`result_len` elements), null when there is none.
    pub result: *mut c_void,
    pub result_len: usize,
}

impl FfiSessionResult {
    /// Move a session result onto the heap in its C layout.
    pub fn from_session_result<R: Pod>(res: SessionResult<R>) -> Self {
        let ns = |phase: Phase| {
            res.timings
                .get(phase)
                .map(|d| u64::try_from(d.as_nanos()).unwrap_or(PHASE_NOT_RUN - 1))
                .unwrap_or(PHASE_NOT_RUN)
        };
        let mut out = Self {
            last_error: res.error.as_raw(),
            setup_ns: ns(Phase::Setup),
            prepare_env_ns: ns(Phase::PrepareEnv),
            kernel_ns: ns(Phase::Kernel),
            free_memory_ns: ns(Phase::FreeMemory),
            result: ptr::null_mut(),
            result_len: 0,
        };
        if let Some(output) = res.output.filter(|o| !o.is_empty()) {
            let boxed: Box<[R]> = output.into_boxed_slice();
            out.result_len = boxed.len();
            out.result = Box::into_raw(boxed) as *mut R as *mut c_void;
        }
        out
    }

    /// Record for a call that never reached the harness.
    pub fn rejected(err: &HarnessError) -> Self {
        Self {
            last_error: err.code().as_raw(),
            setup_ns: PHASE_NOT_RUN,
            prepare_env_ns: PHASE_NOT_RUN,
            kernel_ns: PHASE_NOT_RUN,
            free_memory_ns: PHASE_NOT_RUN,
            result: ptr::null_mut(),
            result_len: 0,
        }
    }

    /// View the output buffer.
    ///
    /// # Safety
    /// `R` must be the element type the record was built with.
    pub unsafe fn output<R: Pod>(&self) -> &[R] {
        if self.result.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.result as *const R, self.result_len)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `program` on `device` for a caller-owned environment pointer and box
/// the outcome. Backs the functions generated by `export_session!`.
///
/// A panic inside the program does not cross the C boundary: the session's
/// allocations are released while unwinding and the record carries
/// [`HarnessError::Panicked`].
///
/// # Safety
/// `env` must be null or point to a valid, initialized `P::Environment`.
pub unsafe fn run_exported<P>(
    harness: &SessionHarness,
    device: &mut dyn Device,
    program: &mut P,
    env: *const P::Environment,
) -> *mut FfiSessionResult
where
    P: SessionProgram,
    P::Output: Pod,
{
    let record = match env.as_ref() {
        Some(env) => {
            match panic::catch_unwind(AssertUnwindSafe(|| harness.run(device, program, env))) {
                Ok(res) => FfiSessionResult::from_session_result(res),
                Err(payload) => {
                    let err = HarnessError::Panicked(panic_message(payload.as_ref()));
                    error!(error = %err, "exported session aborted");
                    FfiSessionResult::rejected(&err)
                }
            }
        }
        None => FfiSessionResult::rejected(&HarnessError::InvalidInput(
            "null environment pointer".to_string(),
        )),
    };
    Box::into_raw(Box::new(record))
}

/// Release a record returned by [`run_exported`], including its output buffer.
///
/// # Safety
/// `record` must be null or come from [`run_exported`] with output type `R`,
/// and must not be used afterwards.
pub unsafe fn release<R: Pod>(record: *mut FfiSessionResult) {
    if record.is_null() {
        return;
    }
    let record = Box::from_raw(record);
    if !record.result.is_null() {
        let slice = ptr::slice_from_raw_parts_mut(record.result as *mut R, record.result_len);
        drop(Box::from_raw(slice));
    }
}

/// Generate a C entry point and its release function for a session program.
///
/// ```ignore
/// gpu_harness::export_session!(double_value_session => DoubleValueProgram {
///     program: DoubleValueProgram::default(),
///     device: gpu_harness::kernels::reference_device(),
/// });
/// ```
///
/// expands to `double_value_session(env: *const DoubleValueEnv)` and
/// `double_value_session_free(result)`. The harness configuration is read from
/// the environment on every call.
#[macro_export]
macro_rules! export_session {
    ($name:ident => $program:ty { program: $make_program:expr, device: $make_device:expr $(,)? }) => {
        $crate::paste::paste! {
            /// # Safety
            /// `env` must be null or point to a valid environment value.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                env: *const <$program as $crate::harness::SessionProgram>::Environment,
            ) -> *mut $crate::ffi::FfiSessionResult {
                let harness = $crate::harness::SessionHarness::from_env();
                let mut device = $make_device;
                let mut program: $program = $make_program;
                $crate::ffi::run_exported(&harness, &mut device, &mut program, env)
            }

            /// # Safety
            /// `result` must be null or come from the matching entry point.
            #[no_mangle]
            pub unsafe extern "C" fn [<$name _free>](result: *mut $crate::ffi::FfiSessionResult) {
                $crate::ffi::release::<<$program as $crate::harness::SessionProgram>::Output>(result)
            }
        }
    };
}

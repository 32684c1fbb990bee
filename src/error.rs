//! Error types shared by the device backends, the session harness and the
//! kernel invocation units.
//!
//! Errors travel as `Result<_, HarnessError>` inside a session and are folded
//! into an [`ErrorCode`] at the session boundary.

use crate::device::DevicePtr;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raw status written for a device that could not be selected.
pub const DEVICE_UNAVAILABLE_RAW: i32 = -1;

/// Raw status for a failure whose driver code collides with `0` (success) or
/// [`DEVICE_UNAVAILABLE_RAW`].
pub const UNKNOWN_FAILURE_RAW: i32 = 999;

/// Device call that produced a failure, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceOp {
    Select,
    Reset,
    Allocate,
    Free,
    CopyToDevice,
    CopyFromDevice,
    Launch,
    Synchronize,
    LoadModule,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceOp::Select => "select",
            DeviceOp::Reset => "reset",
            DeviceOp::Allocate => "allocate",
            DeviceOp::Free => "free",
            DeviceOp::CopyToDevice => "copy host->device",
            DeviceOp::CopyFromDevice => "copy device->host",
            DeviceOp::Launch => "launch",
            DeviceOp::Synchronize => "synchronize",
            DeviceOp::LoadModule => "load module",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("device {ordinal} unavailable: {reason}")]
    DeviceUnavailable { ordinal: u32, reason: String },
    #[cfg(feature = "cuda")]
    #[error(transparent)]
    Cuda(#[from] cust::error::CudaError),
    #[error("device {op} failed with status {code}")]
    DeviceApi { op: DeviceOp, code: i32 },
    #[error("out of memory: required={required} free={free} headroom={headroom}")]
    OutOfMemory {
        required: usize,
        free: usize,
        headroom: usize,
    },
    #[error("missing kernel symbol: {name}")]
    MissingKernelSymbol { name: String },
    #[error("invalid device handle: {0}")]
    InvalidHandle(DevicePtr),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("session panicked: {0}")]
    Panicked(String),
}

impl HarnessError {
    /// Status code recorded into a session result for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            HarnessError::DeviceUnavailable { .. } => ErrorCode::DeviceUnavailable,
            #[cfg(feature = "cuda")]
            HarnessError::Cuda(e) => ErrorCode::DeviceApi(*e as i32),
            HarnessError::DeviceApi { code, .. } => ErrorCode::DeviceApi(*code),
            // Driver status values: CUDA_ERROR_OUT_OF_MEMORY, CUDA_ERROR_NOT_FOUND,
            // CUDA_ERROR_INVALID_HANDLE, CUDA_ERROR_INVALID_VALUE.
            HarnessError::OutOfMemory { .. } => ErrorCode::DeviceApi(2),
            HarnessError::MissingKernelSymbol { .. } => ErrorCode::DeviceApi(500),
            HarnessError::InvalidHandle(_) => ErrorCode::DeviceApi(400),
            HarnessError::SizeMismatch { .. } | HarnessError::InvalidInput(_) => {
                ErrorCode::DeviceApi(1)
            }
            HarnessError::Panicked(_) => ErrorCode::DeviceApi(UNKNOWN_FAILURE_RAW),
        }
    }
}

/// Status carried by a [`SessionResult`](crate::harness::SessionResult).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    Success,
    DeviceUnavailable,
    DeviceApi(i32),
}

impl ErrorCode {
    #[inline]
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Integer form used across the C boundary. Only `Success` maps to `0`
    /// and only `DeviceUnavailable` maps to `-1`.
    pub fn as_raw(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::DeviceUnavailable => DEVICE_UNAVAILABLE_RAW,
            ErrorCode::DeviceApi(0 | DEVICE_UNAVAILABLE_RAW) => UNKNOWN_FAILURE_RAW,
            ErrorCode::DeviceApi(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Success => f.write_str("success"),
            ErrorCode::DeviceUnavailable => f.write_str("device unavailable"),
            ErrorCode::DeviceApi(code) => write!(f, "device api failure ({code})"),
        }
    }
}

impl std::error::Error for ErrorCode {}

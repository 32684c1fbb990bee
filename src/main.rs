//! Runs the "double the value" session once and prints the result record as
//! JSON on stdout.
//!
//!     gpu-harness [VALUE]
//!
//! Uses the CUDA backend when built with `--features cuda` and a device is
//! present, the emulated device otherwise. `HARNESS_*` variables configure the
//! session (see `HarnessConfig::from_env`).

use gpu_harness::kernels::{reference_device, DoubleValueEnv, DoubleValueProgram};
use gpu_harness::utilities::telemetry::init_tracing;
use gpu_harness::{Device, SessionHarness};
use std::error::Error;
use std::process::ExitCode;
use tracing::info;

fn pick_device() -> Box<dyn Device> {
    #[cfg(feature = "cuda")]
    {
        if gpu_harness::cuda::cuda_available() {
            return Box::new(gpu_harness::CudaDevice::with_harness_kernels());
        }
        tracing::warn!("no CUDA device found; falling back to the emulated device");
    }
    Box::new(reference_device())
}

fn run() -> Result<ExitCode, Box<dyn Error>> {
    let value = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<i32>()?,
        None => 42,
    };

    let harness = SessionHarness::from_env();
    let mut device = pick_device();
    info!(device = device.name(), value, "running session");

    let result = harness.run(device.as_mut(), &mut DoubleValueProgram, &DoubleValueEnv { value });
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("gpu-harness: {e}");
            ExitCode::from(2)
        }
    }
}

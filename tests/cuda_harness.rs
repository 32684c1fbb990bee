#[cfg(feature = "cuda")]
use gpu_harness::cuda::{cuda_available, CudaDevice};
#[cfg(feature = "cuda")]
use gpu_harness::kernels::{AffineEnv, AffineProgram, DoubleValueEnv, DoubleValueProgram};
#[cfg(feature = "cuda")]
use gpu_harness::{ErrorCode, HarnessConfig, Phase, SessionHarness};

#[test]
fn cuda_feature_off_guard() {
    #[cfg(not(feature = "cuda"))]
    assert_eq!(gpu_harness::cuda::cuda_device_count(), 0);
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_doubles_the_environment_value() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[cuda_doubles_the_environment_value] skipped - no CUDA device");
        return Ok(());
    }
    let mut dev = CudaDevice::with_harness_kernels();
    let harness = SessionHarness::new(HarnessConfig::default());
    let res = harness.run(&mut dev, &mut DoubleValueProgram, &DoubleValueEnv { value: 42 });

    assert!(res.is_success(), "{:?}", res.failure);
    assert!(res.timings.is_complete());
    assert_eq!(res.into_output()?, vec![84]);
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_affine_matches_host() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[cuda_affine_matches_host] skipped - no CUDA device");
        return Ok(());
    }
    let count = 100_000u32;
    let mut dev = CudaDevice::with_harness_kernels();
    let harness = SessionHarness::new(HarnessConfig::default());
    let res = harness.run(&mut dev, &mut AffineProgram, &AffineEnv::new(0.25, 3.0, count));
    let out = res.into_output()?;

    assert_eq!(out.len(), count as usize);
    for (i, v) in out.iter().enumerate() {
        let expected = 0.25 * i as f32 + 3.0;
        assert!(
            (v - expected).abs() <= 1e-3 * expected.abs().max(1.0),
            "mismatch at {}: host={} gpu={}",
            i,
            expected,
            v
        );
    }
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_missing_ordinal_is_unavailable() {
    let harness = SessionHarness::new(HarnessConfig::default().with_device(u32::MAX));
    let mut dev = CudaDevice::with_harness_kernels();
    let res = harness.run(&mut dev, &mut DoubleValueProgram, &DoubleValueEnv { value: 1 });
    assert_eq!(res.error, ErrorCode::DeviceUnavailable);
    assert!(res.timings.get(Phase::Setup).is_none());
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_unknown_kernel_fails_cleanly() {
    use gpu_harness::{program_fn, Dim3, KernelUnit};

    if !cuda_available() {
        eprintln!("[cuda_unknown_kernel_fails_cleanly] skipped - no CUDA device");
        return;
    }
    const MISSING: KernelUnit<DoubleValueEnv, i32> =
        KernelUnit::new("no_such_kernel", Dim3::x(1), Dim3::x(1), 1);
    let mut program = program_fn(
        |_session, env: &DoubleValueEnv| Ok(*env),
        |session, env: &mut DoubleValueEnv| MISSING.launch(session, env).map(|_| ()),
        |_session, _env: &DoubleValueEnv| Ok(Vec::<i32>::new()),
    );
    let mut dev = CudaDevice::with_harness_kernels();
    let res = SessionHarness::new(HarnessConfig::default()).run(
        &mut dev,
        &mut program,
        &DoubleValueEnv { value: 1 },
    );
    assert_eq!(res.error, ErrorCode::DeviceApi(500));
    assert!(res.timings.get(Phase::FreeMemory).is_some());
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_bad_ptx_fails_reset_with_load_module() {
    use gpu_harness::device::Device;
    use gpu_harness::error::DeviceOp;
    use gpu_harness::HarnessError;

    if !cuda_available() {
        eprintln!("[cuda_bad_ptx_fails_reset_with_load_module] skipped - no CUDA device");
        return;
    }
    let mut dev = CudaDevice::new().with_ptx("broken", "this is not ptx");
    dev.select(0).expect("select");
    let err = dev.reset().unwrap_err();
    assert!(
        matches!(err, HarnessError::DeviceApi { op: DeviceOp::LoadModule, code } if code != 0),
        "unexpected error: {err}"
    );
}

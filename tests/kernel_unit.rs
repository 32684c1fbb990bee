mod common;

use gpu_harness::device::emulated::EmulatedDevice;
use gpu_harness::kernels::{
    affine_unit, reference_device, AffineEnv, DoubleValueEnv, AFFINE_INDEX, DOUBLE_VALUE_UNIT,
};
use gpu_harness::{Device, DeviceSession, Dim3, HarnessConfig, HarnessError, KernelUnit};

fn ready_device() -> EmulatedDevice {
    let mut dev = reference_device();
    dev.select(0).unwrap();
    dev.reset().unwrap();
    dev
}

#[test]
fn invoke_returns_count_elements() {
    let mut dev = ready_device();
    let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());

    let out = DOUBLE_VALUE_UNIT
        .invoke(&mut session, &DoubleValueEnv { value: -21 })
        .unwrap();
    assert_eq!(out, vec![-42]);

    let out = affine_unit(1000)
        .invoke(&mut session, &AffineEnv::new(2.0, 1.0, 1000))
        .unwrap();
    assert_eq!(out.len(), 1000);
    assert_eq!(out[0], 1.0);
    assert_eq!(out[999], 1999.0);

    let report = session.teardown();
    assert!(report.first_error.is_none());
    assert_eq!(report.released.len(), 2);
    common::assert_balanced(&dev);
}

#[test]
fn environment_copy_is_released_before_return() {
    let mut dev = ready_device();
    let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());

    let out = DOUBLE_VALUE_UNIT
        .launch(&mut session, &DoubleValueEnv { value: 4 })
        .unwrap();
    assert_eq!(session.allocations().len(), 1);
    assert_eq!(session.allocations()[0].ptr, out.ptr());
    assert_eq!(session.early_frees(), 1);
    assert_eq!(session.download(out).unwrap(), vec![8]);
}

#[test]
fn empty_result_buffer_is_rejected() {
    const EMPTY: KernelUnit<DoubleValueEnv, i32> =
        KernelUnit::new("double_value", Dim3::x(1), Dim3::x(1), 0);

    let mut dev = ready_device();
    let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
    let err = EMPTY
        .invoke(&mut session, &DoubleValueEnv { value: 1 })
        .unwrap_err();
    assert!(matches!(err, HarnessError::InvalidInput(_)));
    assert!(session.allocations().is_empty());
}

#[test]
fn unwritten_elements_keep_device_contents() {
    // The unit trusts its count: elements past what the kernel writes come
    // back as whatever the device buffer held.
    let unit: KernelUnit<AffineEnv, f32> =
        KernelUnit::new(AFFINE_INDEX, Dim3::x(1), Dim3::x(8), 8);
    let mut dev = ready_device();
    let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
    let out = unit
        .invoke(&mut session, &AffineEnv::new(1.0, 0.0, 4))
        .unwrap();
    assert_eq!(&out[..4], &[0.0, 1.0, 2.0, 3.0]);
    assert!(out[4..].iter().all(|v| v.to_bits() == 0xCDCD_CDCD));
}

#[test]
fn launch_failure_leaves_buffers_tracked() {
    let mut dev = EmulatedDevice::new();
    dev.select(0).unwrap();
    dev.reset().unwrap();
    let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());

    let err = DOUBLE_VALUE_UNIT
        .invoke(&mut session, &DoubleValueEnv { value: 1 })
        .unwrap_err();
    assert!(matches!(err, HarnessError::MissingKernelSymbol { .. }));
    assert_eq!(session.allocations().len(), 2);

    let report = session.teardown();
    assert_eq!(report.released.len(), 2);
    assert_eq!(dev.live_allocations(), 0);
}

#[test]
fn alternating_environments_match_fresh_sessions() {
    let envs = [AffineEnv::new(2.0, 1.0, 300), AffineEnv::new(-0.5, 7.0, 40)];

    let expected: Vec<Vec<f32>> = envs
        .iter()
        .map(|env| {
            let mut dev = ready_device();
            let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
            let out = affine_unit(env.count).invoke(&mut session, env).unwrap();
            assert!(session.teardown().first_error.is_none());
            out
        })
        .collect();

    let mut dev = ready_device();
    let mut session = DeviceSession::new(&mut dev, HarnessConfig::default());
    for i in [0, 1, 0, 1] {
        let env = &envs[i];
        let out = affine_unit(env.count).invoke(&mut session, env).unwrap();
        assert_eq!(out, expected[i], "call with environment {i}");
    }
    let report = session.teardown();
    assert!(report.first_error.is_none());
    assert_eq!(report.released.len(), 4);
    common::assert_balanced(&dev);
}

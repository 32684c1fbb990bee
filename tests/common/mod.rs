//! Shared helpers for the integration tests.
#![allow(dead_code)]

use gpu_harness::device::emulated::{EmulatedDevice, FaultPlan};
use gpu_harness::kernels::register_reference_kernels;
use gpu_harness::{HarnessConfig, SessionHarness};

/// Emulated device with the reference kernels and the given faults.
pub fn device_with_faults(faults: FaultPlan) -> EmulatedDevice {
    let mut dev = EmulatedDevice::new().with_faults(faults);
    register_reference_kernels(&mut dev);
    dev
}

/// Harness with default settings, independent of the process environment.
pub fn harness() -> SessionHarness {
    SessionHarness::new(HarnessConfig::default())
}

/// Every handle the device handed out was released exactly once.
pub fn assert_balanced(dev: &EmulatedDevice) {
    let stats = dev.stats();
    assert_eq!(
        stats.allocations, stats.frees,
        "allocations {} vs frees {}",
        stats.allocations, stats.frees
    );
    assert_eq!(dev.live_allocations(), 0, "device still holds allocations");
    let mut allocated = stats.alloc_order.clone();
    let mut freed = stats.free_order.clone();
    allocated.sort();
    freed.sort();
    assert_eq!(allocated, freed, "freed handles differ from allocated handles");
}

/// Compare two arrays with an absolute tolerance.
pub fn assert_array_close(actual: &[f32], expected: &[f32], atol: f32, name: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{}: Length mismatch: actual {} vs expected {}",
        name,
        actual.len(),
        expected.len()
    );
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= atol,
            "{}: Value mismatch at index {}: actual {} vs expected {}",
            name,
            i,
            a,
            e
        );
    }
}

//! Harness configuration.
//!
//! Everything is read from the environment, in the same spirit as the
//! `CUDA_MEM_CHECK` / `BENCH_DEBUG` switches of the CUDA wrappers:
//!
//! - `HARNESS_DEVICE`: device ordinal to select (default 0)
//! - `CUDA_MEM_CHECK`: pre-allocation free-memory check, on unless `0`/`false`
//! - `HARNESS_MEM_HEADROOM_MB`: headroom kept free by that check (default 64)
//! - `HARNESS_DEBUG`: `1` logs launch geometry and allocation sizes at info level

use std::env;

pub const DEFAULT_HEADROOM_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Device index selected during setup.
    pub device_ordinal: u32,
    /// Check free device memory before each allocation.
    pub mem_check: bool,
    /// Bytes that must stay free on top of every allocation request.
    pub headroom_bytes: usize,
    /// Promote per-launch diagnostics to info level.
    pub debug: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            mem_check: true,
            headroom_bytes: DEFAULT_HEADROOM_BYTES,
            debug: false,
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Malformed values fall back
    /// to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let device_ordinal = lookup("HARNESS_DEVICE")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(defaults.device_ordinal);
        let mem_check = match lookup("CUDA_MEM_CHECK") {
            Some(v) => v != "0" && v.to_lowercase() != "false",
            None => defaults.mem_check,
        };
        let headroom_bytes = lookup("HARNESS_MEM_HEADROOM_MB")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(|mb| mb.saturating_mul(1024 * 1024))
            .unwrap_or(defaults.headroom_bytes);
        let debug = lookup("HARNESS_DEBUG").as_deref() == Some("1");
        Self {
            device_ordinal,
            mem_check,
            headroom_bytes,
            debug,
        }
    }

    pub fn with_device(mut self, ordinal: u32) -> Self {
        self.device_ordinal = ordinal;
        self
    }

    pub fn with_headroom(mut self, bytes: usize) -> Self {
        self.headroom_bytes = bytes;
        self
    }

    pub fn with_mem_check(mut self, enabled: bool) -> Self {
        self.mem_check = enabled;
        self
    }
}

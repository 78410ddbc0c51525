// SPDX-License-Identifier: AGPL-3.0-only

//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use vdsp_driver::{Device, SimulatedDsp, VdspConfig};

/// Small window, short timeouts.
pub fn config() -> VdspConfig {
    VdspConfig::default()
        .with_iova_window(0x8000_0000, 16 << 20)
        .with_firmware_region_size(1 << 20)
        .with_carveout_size(256 << 10)
        .with_cmd_timeout(Duration::from_secs(5))
        .with_boot_timeout(Duration::from_secs(2))
}

/// Device over a fresh simulated accelerator.
pub fn attach(config: VdspConfig) -> (Arc<SimulatedDsp>, Device) {
    let (sim, platform) = SimulatedDsp::platform(&config).expect("platform");
    let device = Device::attach(config, platform).expect("attach");
    (sim, device)
}

/// Poll `cond` for up to two seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

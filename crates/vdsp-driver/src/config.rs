// SPDX-License-Identifier: AGPL-3.0-only

//! Driver configuration.
//!
//! [`VdspConfig::default`] describes a single-IOMMU accelerator with a 256 MiB
//! device window at `0x8000_0000`. Deployments adjust it with the `with_*`
//! builders and [`VdspConfig::from_env`], which reads:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `VDSP_FIRMWARE` | firmware blob name |
//! | `VDSP_CMD_TIMEOUT_MS` | command timeout |
//! | `VDSP_FIRMWARE_REBOOT` | reboot the accelerator on timeout (`1`/`0`) |
//! | `VDSP_HOST_IRQ_MODE` | `1` waits for the doorbell, `0` polls |
//! | `VDSP_CACHE_SYNC` | global cache maintenance (`1`/`0`) |

use crate::error::{Result, VdspError};
use std::time::Duration;
use vdsp_chip::comm::MAX_QUEUES;
use vdsp_chip::iommu::{is_page_aligned, DEFAULT_VERSION, PAGE_SIZE};
use vdsp_chip::log;

/// Name of the reserved extent holding the firmware image.
pub const FIRMWARE_EXTENT: &str = "fw_buf";

/// How a submitter learns that the accelerator answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Sleep until the accelerator rings the host doorbell
    Irq,
    /// Busy-wait on the command flags
    Polling,
}

/// One physical IOMMU unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IommuInstanceConfig {
    /// Unit name
    pub name: String,
    /// Page-table format version
    pub version: u32,
}

/// A named IOVA extent carved out at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedExtent {
    /// Extent name
    pub name: String,
    /// Offset from the IOVA base
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

/// Accelerator log settings, sent during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// [`log::MODE_OFF`] or [`log::MODE_BUFFER`]
    pub mode: u32,
    /// Firmware log level
    pub level: u32,
    /// Bytes per log bank
    pub bank_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            mode: log::MODE_BUFFER,
            level: 2,
            bank_size: log::DEFAULT_BANK_SIZE,
        }
    }
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct VdspConfig {
    /// Firmware blob name in the firmware store
    pub firmware_name: String,
    /// Per-request completion timeout
    pub cmd_timeout: Duration,
    /// Handshake timeout
    pub boot_timeout: Duration,
    /// Reboot the accelerator when a request times out
    pub firmware_reboot: bool,
    /// Doorbell or polling completion
    pub completion: CompletionMode,
    /// Global cache maintenance switch
    pub cache_sync: bool,
    /// First device address of the IOVA window
    pub iova_base: u64,
    /// IOVA window size
    pub iova_size: u64,
    /// IOMMU units sharing the window
    pub iommus: Vec<IommuInstanceConfig>,
    /// Mapping record slots
    pub record_capacity: usize,
    /// Priority of each command queue; the length is the requested queue count
    pub queue_priorities: Vec<u32>,
    /// Accelerator log settings
    pub log: LogConfig,
    /// Size of the reserved firmware extent and buffer
    pub firmware_region_size: u64,
    /// Buffer ids per namespace
    pub buffers_per_namespace: u32,
    /// Open namespaces, including the driver's own
    pub max_namespaces: usize,
    /// Contiguous carveout heap size, zero disables the heap
    pub carveout_size: usize,
    /// Highest DVFS level the platform accepts
    pub dvfs_max_level: u32,
    /// Polls between scheduler yields in polling mode
    pub poll_yield_interval: u32,
}

impl Default for VdspConfig {
    fn default() -> Self {
        Self {
            firmware_name: "vdsp_firmware.bin".to_owned(),
            cmd_timeout: Duration::from_secs(200),
            boot_timeout: Duration::from_secs(25),
            firmware_reboot: true,
            completion: CompletionMode::Irq,
            cache_sync: true,
            iova_base: 0x8000_0000,
            iova_size: 256 << 20,
            iommus: vec![IommuInstanceConfig {
                name: "vau".to_owned(),
                version: DEFAULT_VERSION,
            }],
            record_capacity: 1024,
            queue_priorities: vec![0],
            log: LogConfig::default(),
            firmware_region_size: 6 << 20,
            buffers_per_namespace: 1024,
            max_namespaces: 1000,
            carveout_size: 4 << 20,
            dvfs_max_level: 5,
            poll_yield_interval: 1_000,
        }
    }
}

impl VdspConfig {
    /// Defaults overlaid with `VDSP_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if a variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay settings from a key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if a value does not parse.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(name) = lookup("VDSP_FIRMWARE") {
            self.firmware_name = name;
        }
        if let Some(ms) = lookup("VDSP_CMD_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                VdspError::invalid_argument(format!("VDSP_CMD_TIMEOUT_MS: {ms:?}"))
            })?;
            self.cmd_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("VDSP_FIRMWARE_REBOOT") {
            self.firmware_reboot = parse_switch("VDSP_FIRMWARE_REBOOT", &v)?;
        }
        if let Some(v) = lookup("VDSP_HOST_IRQ_MODE") {
            self.completion = if parse_switch("VDSP_HOST_IRQ_MODE", &v)? {
                CompletionMode::Irq
            } else {
                CompletionMode::Polling
            };
        }
        if let Some(v) = lookup("VDSP_CACHE_SYNC") {
            self.cache_sync = parse_switch("VDSP_CACHE_SYNC", &v)?;
        }
        Ok(self)
    }

    /// Set the firmware blob name.
    #[must_use]
    pub fn with_firmware(mut self, name: impl Into<String>) -> Self {
        self.firmware_name = name.into();
        self
    }

    /// Set the command timeout.
    #[must_use]
    pub const fn with_cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    /// Enable or disable reboot on timeout.
    #[must_use]
    pub const fn with_firmware_reboot(mut self, enabled: bool) -> Self {
        self.firmware_reboot = enabled;
        self
    }

    /// Select doorbell or polling completion.
    #[must_use]
    pub const fn with_completion(mut self, mode: CompletionMode) -> Self {
        self.completion = mode;
        self
    }

    /// Enable or disable cache maintenance.
    #[must_use]
    pub const fn with_cache_sync(mut self, enabled: bool) -> Self {
        self.cache_sync = enabled;
        self
    }

    /// Set the IOVA window.
    #[must_use]
    pub const fn with_iova_window(mut self, base: u64, size: u64) -> Self {
        self.iova_base = base;
        self.iova_size = size;
        self
    }

    /// Replace the IOMMU unit list.
    #[must_use]
    pub fn with_iommus(mut self, iommus: Vec<IommuInstanceConfig>) -> Self {
        self.iommus = iommus;
        self
    }

    /// Set the mapping record capacity.
    #[must_use]
    pub const fn with_record_capacity(mut self, capacity: usize) -> Self {
        self.record_capacity = capacity;
        self
    }

    /// Set the command queue priorities.
    #[must_use]
    pub fn with_queue_priorities(mut self, priorities: Vec<u32>) -> Self {
        self.queue_priorities = priorities;
        self
    }

    /// Set the accelerator log settings.
    #[must_use]
    pub const fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Set the firmware region size.
    #[must_use]
    pub const fn with_firmware_region_size(mut self, size: u64) -> Self {
        self.firmware_region_size = size;
        self
    }

    /// Set the namespace limits.
    #[must_use]
    pub const fn with_namespace_limits(mut self, max_namespaces: usize, buffers: u32) -> Self {
        self.max_namespaces = max_namespaces;
        self.buffers_per_namespace = buffers;
        self
    }

    /// Set the carveout heap size.
    #[must_use]
    pub const fn with_carveout_size(mut self, size: usize) -> Self {
        self.carveout_size = size;
        self
    }

    /// Extents carved out of the IOVA window at init.
    pub fn reserved_extents(&self) -> Vec<ReservedExtent> {
        vec![ReservedExtent {
            name: FIRMWARE_EXTENT.to_owned(),
            offset: 0,
            size: self.firmware_region_size,
        }]
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: &str| Err(VdspError::invalid_argument(reason));

        if self.firmware_name.is_empty() {
            return bad("firmware name is empty");
        }
        if self.cmd_timeout.is_zero() || self.boot_timeout.is_zero() {
            return bad("timeouts must be non-zero");
        }
        if !is_page_aligned(self.iova_base) || !is_page_aligned(self.iova_size) {
            return bad("IOVA window must be page aligned");
        }
        if self.iova_size == 0 || self.iova_base + self.iova_size > 1 << 32 {
            return bad("IOVA window must be non-empty and inside 32-bit device space");
        }
        if self.iommus.is_empty() {
            return bad("at least one IOMMU unit is required");
        }
        if self.record_capacity == 0 {
            return bad("mapping record capacity must be non-zero");
        }
        if self.queue_priorities.is_empty() || self.queue_priorities.len() > MAX_QUEUES {
            return bad("queue count must be between 1 and 16");
        }
        if self.firmware_region_size < PAGE_SIZE
            || !is_page_aligned(self.firmware_region_size)
            || self.firmware_region_size >= self.iova_size
        {
            return bad("firmware region must be whole pages inside the IOVA window");
        }
        if self.buffers_per_namespace == 0 || self.max_namespaces == 0 {
            return bad("namespace limits must be non-zero");
        }
        if (self.max_namespaces as u64 + 1) * u64::from(self.buffers_per_namespace)
            > u64::from(u32::MAX)
        {
            return bad("buffer id space does not fit 32 bits");
        }
        if self.log.bank_size == 0 || self.log.bank_size % 4 != 0 {
            return bad("log bank size must be a non-zero multiple of 4");
        }
        if self.poll_yield_interval == 0 {
            return bad("poll yield interval must be non-zero");
        }
        Ok(())
    }
}

fn parse_switch(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        other => Err(VdspError::invalid_argument(format!("{key}: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let cfg = VdspConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.cmd_timeout, Duration::from_secs(200));
        assert_eq!(cfg.iommus[0].name, "vau");
        assert_eq!(cfg.reserved_extents()[0].name, FIRMWARE_EXTENT);
        assert_eq!(cfg.reserved_extents()[0].offset, 0);
    }

    #[test]
    fn test_overlay() {
        let vars: HashMap<&str, &str> = [
            ("VDSP_FIRMWARE", "alt.elf"),
            ("VDSP_CMD_TIMEOUT_MS", "1500"),
            ("VDSP_FIRMWARE_REBOOT", "0"),
            ("VDSP_HOST_IRQ_MODE", "off"),
            ("VDSP_CACHE_SYNC", "false"),
        ]
        .into_iter()
        .collect();
        let cfg = VdspConfig::default()
            .overlay(|k| vars.get(k).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(cfg.firmware_name, "alt.elf");
        assert_eq!(cfg.cmd_timeout, Duration::from_millis(1500));
        assert!(!cfg.firmware_reboot);
        assert_eq!(cfg.completion, CompletionMode::Polling);
        assert!(!cfg.cache_sync);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = VdspConfig::default()
            .overlay(|k| (k == "VDSP_CMD_TIMEOUT_MS").then(|| "soon".to_owned()))
            .unwrap_err();
        assert!(matches!(err, VdspError::InvalidArgument { .. }));
    }

    #[test]
    fn test_validate_rejects() {
        assert!(VdspConfig::default()
            .with_iova_window(0x8000_0800, 1 << 20)
            .validate()
            .is_err());
        assert!(VdspConfig::default()
            .with_queue_priorities(vec![])
            .validate()
            .is_err());
        assert!(VdspConfig::default()
            .with_firmware_region_size(512 << 20)
            .validate()
            .is_err());
        assert!(VdspConfig::default()
            .with_iommus(Vec::new())
            .validate()
            .is_err());
    }
}

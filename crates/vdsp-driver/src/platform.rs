// SPDX-License-Identifier: AGPL-3.0-only

//! Platform seam: the accelerator's power, reset and interrupt plumbing, and
//! where firmware blobs come from.
//!
//! The driver core never touches hardware registers directly. Everything a
//! board does differently lives behind [`Accelerator`]; the in-process
//! [`SimulatedDsp`](crate::sim::SimulatedDsp) implements it for tests and the
//! CLI self-test.
//!
//! ```text
//!   Device ──► Accelerator::power_on / reset / release / send_irq
//!     ▲
//!     └──────── HostBus::raise_irq  (accelerator rings the host)
//! ```

use crate::dma::PhysMemory;
use crate::error::{Result, VdspError};
use crate::lock;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Host interrupt handler, invoked by the accelerator side.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// What the accelerator can reach on the host: memory and the doorbell.
#[derive(Clone)]
pub struct HostBus {
    /// Registry resolving bus addresses to host memory
    pub memory: Arc<PhysMemory>,
    irq: IrqHandler,
}

impl HostBus {
    /// Bus over `memory` delivering interrupts to `irq`.
    pub fn new(memory: Arc<PhysMemory>, irq: IrqHandler) -> Self {
        Self { memory, irq }
    }

    /// Ring the host doorbell.
    pub fn raise_irq(&self) {
        (self.irq)();
    }
}

impl Debug for HostBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBus")
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

/// Where the accelerator starts executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Entry point from the firmware image
    pub entry: u32,
    /// Device address of the firmware region
    pub firmware_iova: u64,
}

/// Page-table parameters handed to an IOMMU unit when it is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IommuProgram {
    /// Unit name
    pub name: String,
    /// Page-table format version
    pub version: u32,
    /// Bus address of the page table
    pub page_table: u64,
    /// First device address covered
    pub iova_base: u64,
    /// Window size
    pub iova_size: u64,
}

/// Board-specific control of one accelerator core.
///
/// Methods are called with driver locks held; implementations must not call
/// back into the driver except through [`HostBus::raise_irq`].
pub trait Accelerator: Debug + Send + Sync {
    /// Connect the accelerator to host memory and the host interrupt.
    ///
    /// # Errors
    ///
    /// Returns an error if the accelerator cannot be claimed.
    fn attach(&self, bus: HostBus) -> Result<()>;

    /// Disconnect; no interrupt is raised afterwards.
    fn detach(&self);

    /// Power the core and its memories.
    ///
    /// # Errors
    ///
    /// Returns an error if the power domain does not come up.
    fn power_on(&self) -> Result<()>;

    /// Cut power.
    fn power_off(&self);

    /// Assert and release reset; the core stays halted.
    fn reset(&self);

    /// Stop the core.
    fn halt(&self);

    /// Let the core run from `boot.entry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the core cannot be started.
    fn release(&self, boot: &BootInfo) -> Result<()>;

    /// Ring the accelerator doorbell.
    fn send_irq(&self);

    /// Whether the firmware reported a panic.
    fn panic_check(&self) -> bool {
        false
    }

    /// Platform blob sent in the handshake. `log_iova` is the device address
    /// of the log buffer.
    fn hw_sync_data(&self, log_iova: u32) -> Bytes;

    /// Point IOMMU unit `unit` at its page table and turn it on.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit rejects the program.
    fn iommu_enable(&self, unit: usize, program: &IommuProgram) -> Result<()>;

    /// Turn IOMMU unit `unit` off.
    fn iommu_disable(&self, unit: usize);

    /// Apply a DVFS level.
    ///
    /// # Errors
    ///
    /// Returns an error if the level is not supported.
    fn set_dvfs_level(&self, level: u32) -> Result<()>;

    /// Copy a firmware segment into core-local memory at `addr`, zero-filling
    /// up to `memsz`.
    ///
    /// # Errors
    ///
    /// The default has no local memory and always fails.
    fn load_local(&self, addr: u32, data: &[u8], memsz: usize) -> Result<()> {
        let _ = (data, memsz);
        Err(VdspError::firmware(format!(
            "segment at {addr:#x} is outside the firmware region and the platform has no local memory"
        )))
    }

    /// Capture firmware state before a recovery reboot.
    fn coredump(&self) {}
}

/// Source of firmware blobs.
pub trait FirmwareStore: Debug + Send + Sync {
    /// Fetch the blob called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::Firmware`] if the blob does not exist.
    fn load(&self, name: &str) -> Result<Bytes>;
}

/// Firmware files in a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    /// Store reading from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FirmwareStore for DirStore {
    fn load(&self, name: &str) -> Result<Bytes> {
        if name.contains('/') || name == ".." {
            return Err(VdspError::firmware(format!("bad firmware name {name:?}")));
        }
        let path = self.dir.join(name);
        let data = std::fs::read(&path).map_err(|e| {
            VdspError::firmware(format!("cannot read {}: {e}", path.display()))
        })?;
        tracing::debug!("loaded firmware {} ({} bytes)", path.display(), data.len());
        Ok(Bytes::from(data))
    }
}

/// Firmware blobs held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a blob.
    pub fn insert(&self, name: impl Into<String>, blob: impl Into<Bytes>) {
        lock(&self.blobs).insert(name.into(), blob.into());
    }

    /// Drop a blob.
    pub fn remove(&self, name: &str) -> Option<Bytes> {
        lock(&self.blobs).remove(name)
    }
}

impl FirmwareStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Bytes> {
        lock(&self.blobs)
            .get(name)
            .cloned()
            .ok_or_else(|| VdspError::firmware(format!("firmware {name:?} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(matches!(store.load("fw"), Err(VdspError::Firmware { .. })));
        store.insert("fw", vec![1u8, 2, 3]);
        assert_eq!(store.load("fw").unwrap().as_ref(), &[1, 2, 3]);
        assert!(store.remove("fw").is_some());
        assert!(store.load("fw").is_err());
    }

    #[test]
    fn test_dir_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dsp.bin"), b"blob").unwrap();
        let store = DirStore::new(dir.path());
        assert_eq!(store.load("dsp.bin").unwrap().as_ref(), b"blob");
        assert!(store.load("missing.bin").is_err());
        assert!(store.load("../dsp.bin").is_err());
    }
}

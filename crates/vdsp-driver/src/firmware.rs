// SPDX-License-Identifier: AGPL-3.0-only

//! Firmware loading.
//!
//! The image is fetched from the [`FirmwareStore`] on every boot, so a blob
//! replaced on disk takes effect at the next reboot. Before the segments are
//! copied, the image's `xrp_dsp_comm_base` object is patched with the device
//! address of the communication region; that is how the firmware finds it.
//!
//! Segments inside the firmware region are copied there with their bss
//! zeroed. Segments below it go to core-local memory through the platform.

// Segment addresses are 32-bit device addresses
#![allow(clippy::cast_possible_truncation)]

use crate::dma::DmaRegion;
use crate::error::{Result, VdspError};
use crate::platform::{Accelerator, BootInfo, FirmwareStore};
use std::sync::Arc;
use tracing::{debug, info};
use vdsp_chip::firmware::{FirmwareImage, COMM_BASE_SYMBOL};

/// Loads the firmware image into its reserved region.
#[derive(Debug)]
pub struct FirmwareLoader {
    store: Arc<dyn FirmwareStore>,
    accel: Arc<dyn Accelerator>,
    name: String,
    region: Arc<DmaRegion>,
    region_iova: u64,
    comm_iova: u64,
}

impl FirmwareLoader {
    /// Loader writing `name` into `region`, mapped at `region_iova`.
    pub fn new(
        store: Arc<dyn FirmwareStore>,
        accel: Arc<dyn Accelerator>,
        name: impl Into<String>,
        region: Arc<DmaRegion>,
        region_iova: u64,
        comm_iova: u64,
    ) -> Self {
        Self {
            store,
            accel,
            name: name.into(),
            region,
            region_iova,
            comm_iova,
        }
    }

    /// Fetch, patch and place the image.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::Firmware`] if the blob is missing, malformed,
    /// lacks the comm-base symbol, or has a segment that fits nowhere.
    pub fn load(&self) -> Result<BootInfo> {
        let blob = self.store.load(&self.name)?;
        let mut patched = blob.to_vec();

        let symbol = FirmwareImage::parse(&blob)
            .and_then(|image| image.find_object_symbol(COMM_BASE_SYMBOL))
            .map_err(|e| VdspError::firmware(format!("{}: {e}", self.name)))?;
        if symbol.size < 4 {
            return Err(VdspError::firmware(format!(
                "{}: {COMM_BASE_SYMBOL} is {} bytes, need 4",
                self.name, symbol.size
            )));
        }
        let at = symbol.file_offset;
        patched[at..at + 4].copy_from_slice(&(self.comm_iova as u32).to_le_bytes());
        debug!(
            "patched {COMM_BASE_SYMBOL} at {:#x} with {:#x}",
            symbol.value, self.comm_iova
        );

        let image = FirmwareImage::parse(&patched)
            .map_err(|e| VdspError::firmware(format!("{}: {e}", self.name)))?;
        let segments = image
            .loadable_segments()
            .map_err(|e| VdspError::firmware(format!("{}: {e}", self.name)))?;

        self.region.fill(0, self.region.len(), 0);
        let start = self.region_iova;
        let end = start + self.region.len() as u64;
        for seg in &segments {
            let data = image.segment_data(seg);
            let paddr = u64::from(seg.paddr);
            let memsz = seg.memsz as usize;
            if paddr >= start && paddr + memsz as u64 <= end {
                let offset = (paddr - start) as usize;
                self.region.write(offset, data);
                debug!("segment {paddr:#x}: {:#x} bytes, {memsz:#x} in memory", data.len());
            } else if paddr + memsz as u64 <= start {
                self.accel.load_local(seg.paddr, data, memsz)?;
                debug!("segment {paddr:#x}: {memsz:#x} bytes to local memory");
            } else {
                return Err(VdspError::firmware(format!(
                    "{}: segment {paddr:#x}+{memsz:#x} straddles the firmware region {start:#x}..{end:#x}",
                    self.name
                )));
            }
        }

        info!(
            "firmware {} loaded: {} segment(s), entry {:#x}",
            self.name,
            segments.len(),
            image.entry()
        );
        Ok(BootInfo {
            entry: image.entry(),
            firmware_iova: self.region_iova,
        })
    }
}

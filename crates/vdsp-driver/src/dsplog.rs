// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator log drain.
//!
//! The firmware writes text into two banks of a shared buffer and flips a
//! bank's flag to READY when it is full or flushed. The host copies READY
//! banks out on each interrupt, re-emits the lines through `tracing` under
//! the `vdsp::dsp` target, and hands the bank back by setting it BUSY.

// Bank sizes and offsets are 32-bit header fields
#![allow(clippy::cast_possible_truncation)]

use crate::config::LogConfig;
use crate::dma::DmaRegion;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vdsp_chip::log::{self as layout, BANK_BUSY, BANK_READY};

/// Host side of the log buffer.
#[derive(Debug)]
pub struct DspLog {
    region: Arc<DmaRegion>,
    bank_size: usize,
    lines: AtomicU64,
}

impl DspLog {
    /// Lay out the header for a buffer mapped at `iova`.
    pub fn new(region: Arc<DmaRegion>, iova: u32, config: &LogConfig) -> Self {
        let bank_size = config.bank_size;
        region.fill(0, region.len(), 0);
        region.write32(layout::MODE, config.mode);
        region.write32(layout::BANK_SIZE, bank_size as u32);
        region.write32(layout::LEVEL, config.level);
        for bank in 0..2 {
            let (flag, addr, fill) = layout::bank_fields(bank);
            region.write32(addr, iova + layout::bank_offset(bank, bank_size) as u32);
            region.write32(fill, 0);
            region.write32(flag, BANK_BUSY);
        }
        Self {
            region,
            bank_size,
            lines: AtomicU64::new(0),
        }
    }

    /// Copy out READY banks. Returns the number of lines emitted.
    pub fn drain(&self) -> usize {
        let mut emitted = 0;
        for bank in 0..2 {
            let (flag, _, fill) = layout::bank_fields(bank);
            if self.region.read32(flag) != BANK_READY {
                continue;
            }
            let len = (self.region.read32(fill) as usize).min(self.bank_size);
            let text = self
                .region
                .to_vec(layout::bank_offset(bank, self.bank_size), len);
            for line in String::from_utf8_lossy(&text)
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
            {
                tracing::info!(target: "vdsp::dsp", "{line}");
                emitted += 1;
            }
            self.region.write32(fill, 0);
            self.region.write32(flag, BANK_BUSY);
        }
        self.lines.fetch_add(emitted as u64, Ordering::Relaxed);
        emitted
    }

    /// Lines drained since start.
    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    /// Coredump marker the firmware sets before a crash.
    pub fn coredump_flag(&self) -> u32 {
        self.region.read32(layout::COREDUMP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_ready_bank() {
        let config = LogConfig::default();
        let region = Arc::new(DmaRegion::alloc(layout::buffer_size(config.bank_size)).unwrap());
        let log = DspLog::new(Arc::clone(&region), 0x8100_0000, &config);
        assert_eq!(region.read32(layout::ADDR1), 0x8100_0000 + 0x40 + 0x800);
        assert_eq!(log.drain(), 0);

        let (flag, _, fill) = layout::bank_fields(1);
        let text = b"boot ok\nready\n";
        region.write(layout::bank_offset(1, config.bank_size), text);
        region.write32(fill, text.len() as u32);
        region.write32(flag, BANK_READY);

        assert_eq!(log.drain(), 2);
        assert_eq!(region.read32(flag), BANK_BUSY);
        assert_eq!(log.drain(), 0);
        assert_eq!(log.lines(), 2);
    }
}

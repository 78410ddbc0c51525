// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator log buffer layout.
//!
//! The buffer starts with a 64-byte header followed by two banks of
//! `bank_size` bytes each. The firmware fills one bank while the host drains
//! the other; a bank's flag word is [`BANK_READY`] once it holds text for the
//! host and [`BANK_BUSY`] while the firmware owns it.
//!
//! ```text
//! 0x00 mode        0x04 bank_size
//! 0x08 flag0       0x0c flag1
//! 0x10 addr0       0x14 addr1       device addresses of the banks
//! 0x18 log_size0   0x1c log_size1   bytes written into each bank
//! 0x20 level       0x24 coredump
//! 0x40 bank 0 ..., bank 1 ...
//! ```

/// Log mode field.
pub const MODE: usize = 0x00;
/// Bank size field.
pub const BANK_SIZE: usize = 0x04;
/// Bank 0 flag.
pub const FLAG0: usize = 0x08;
/// Bank 1 flag.
pub const FLAG1: usize = 0x0c;
/// Bank 0 device address.
pub const ADDR0: usize = 0x10;
/// Bank 1 device address.
pub const ADDR1: usize = 0x14;
/// Bank 0 fill.
pub const LOG_SIZE0: usize = 0x18;
/// Bank 1 fill.
pub const LOG_SIZE1: usize = 0x1c;
/// Log level field.
pub const LEVEL: usize = 0x20;
/// Coredump request field.
pub const COREDUMP: usize = 0x24;

/// Header size; bank 0 starts here.
pub const HEADER_SIZE: usize = 0x40;

/// Bank owned by the firmware.
pub const BANK_BUSY: u32 = 0;
/// Bank holds text for the host.
pub const BANK_READY: u32 = 1;

/// Logging disabled.
pub const MODE_OFF: u32 = 0;
/// Firmware writes into the shared banks.
pub const MODE_BUFFER: u32 = 1;

/// Default bank size.
pub const DEFAULT_BANK_SIZE: usize = 0x800;

/// Field offsets `(flag, addr, fill)` of bank `index` (0 or 1).
#[must_use]
pub const fn bank_fields(index: usize) -> (usize, usize, usize) {
    if index == 0 {
        (FLAG0, ADDR0, LOG_SIZE0)
    } else {
        (FLAG1, ADDR1, LOG_SIZE1)
    }
}

/// Byte offset of bank `index` for banks of `bank_size` bytes.
#[must_use]
pub const fn bank_offset(index: usize, bank_size: usize) -> usize {
    HEADER_SIZE + index * bank_size
}

/// Total buffer size for banks of `bank_size` bytes.
#[must_use]
pub const fn buffer_size(bank_size: usize) -> usize {
    HEADER_SIZE + 2 * bank_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert!(COREDUMP + 4 <= HEADER_SIZE);
        assert_eq!(bank_offset(1, 0x100), 0x140);
        assert_eq!(buffer_size(DEFAULT_BANK_SIZE), 0x1040);
        assert_eq!(bank_fields(1), (FLAG1, ADDR1, LOG_SIZE1));
    }
}

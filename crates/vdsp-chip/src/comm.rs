// SPDX-License-Identifier: AGPL-3.0-only

//! Shared command region layout.
//!
//! The region is the wire format between host and accelerator. It is one page,
//! split into fixed-size queue slots:
//!
//! ```text
//! 0x000  queue 0 slot   (sync word + v2 TLV area during handshake)
//! 0x100  queue 1 slot
//! ...
//! 0xF00  queue 15 slot
//! ```
//!
//! The first word of every slot doubles as that queue's sync word while the
//! handshake runs, and as the command flags afterwards. The host writes
//! [`sync::IDLE`] (zero) when the handshake completes, which leaves every slot
//! with cleared flags.
//!
//! Inside a slot:
//!
//! | Offset | Field | Notes |
//! |--------|-------|-------|
//! | `0x00` | flags | [`cmd::flags`] |
//! | `0x04` | in_data_size | |
//! | `0x08` | out_data_size | |
//! | `0x0c` | buffer_size | descriptor bytes |
//! | `0x10` | in_data / in_data_addr | inline when `<= 16` bytes |
//! | `0x20` | out_data / out_data_addr | inline when `<= 16` bytes |
//! | `0x30` | buffer_data / buffer_addr | one inline descriptor |
//! | `0x40` | nsid | 32 bytes, valid with `REQUEST_NSID` |

/// Size of the whole command region (one page).
pub const COMM_REGION_SIZE: usize = 0x1000;

/// Bytes per queue slot.
pub const CMD_STRIDE: usize = 0x100;

/// Upper bound on negotiated queues.
pub const MAX_QUEUES: usize = COMM_REGION_SIZE / CMD_STRIDE;

/// Byte offset of queue `index`'s slot.
#[must_use]
pub const fn queue_offset(index: usize) -> usize {
    index * CMD_STRIDE
}

/// Sync word values and handshake layout.
pub mod sync {
    /// Sync word offset within a queue slot.
    pub const OFFSET: usize = 0;

    /// Handshake finished, or never started.
    pub const IDLE: u32 = 0;
    /// Host finished writing its handshake data.
    pub const HOST_TO_DSP: u32 = 0x1;
    /// Accelerator consumed the handshake data.
    pub const DSP_TO_HOST: u32 = 0x3;
    /// Host requests a handshake.
    pub const START: u32 = 0x101;
    /// Accelerator speaks the minimal protocol.
    pub const DSP_READY_V1: u32 = 0x203;
    /// Accelerator speaks the TLV protocol.
    pub const DSP_READY_V2: u32 = 0x303;
    /// Accelerator firmware hit a fatal error.
    pub const DSP_PANIC: u32 = 0xdead_0bad;

    /// Offset of the hardware blob in a v1 handshake.
    pub const V1_DATA_OFFSET: usize = 4;
    /// Offset of the first TLV record in a v2 handshake (sync word + 7 reserved).
    pub const V2_DATA_OFFSET: usize = 32;
}

/// Type/length/value records exchanged in a v2 handshake.
///
/// Each record is `{ type: u32, length: u32, value: [u8; length] }` with the
/// value padded to a 4-byte boundary. The accelerator sets [`ACCEPT`] in the
/// type word of every record it understood.
pub mod tlv {
    use super::{sync, CMD_STRIDE};

    /// Terminates the record list.
    pub const LAST: u32 = 0;
    /// Opaque hardware-specific blob.
    pub const HW_SPEC_DATA: u32 = 1;
    /// Queue priority table, one u32 per queue.
    pub const HW_QUEUES: u32 = 2;
    /// Log buffer mode and level.
    pub const LOG: u32 = 3;

    /// Set by the accelerator on records it accepted.
    pub const ACCEPT: u32 = 0x8000_0000;
    /// Bits of the type word that carry the record type.
    pub const TYPE_MASK: u32 = 0x00ff_ffff;

    /// Type + length words.
    pub const HEADER_SIZE: usize = 8;

    /// Bytes available for records in queue 0's slot.
    pub const CAPACITY: usize = CMD_STRIDE - sync::V2_DATA_OFFSET;

    /// Value length rounded up to the record alignment.
    #[must_use]
    pub const fn padded(len: usize) -> usize {
        (len + 3) & !3
    }

    /// Full record footprint for a value of `len` bytes.
    #[must_use]
    pub const fn record_size(len: usize) -> usize {
        HEADER_SIZE + padded(len)
    }
}

/// Command slot fields.
pub mod cmd {
    /// Flags word.
    pub const FLAGS: usize = 0x00;
    /// Input payload size.
    pub const IN_DATA_SIZE: usize = 0x04;
    /// Output payload size.
    pub const OUT_DATA_SIZE: usize = 0x08;
    /// Descriptor array size in bytes.
    pub const BUFFER_SIZE: usize = 0x0c;
    /// Inline input, or its device address.
    pub const IN_DATA: usize = 0x10;
    /// Inline output, or its device address.
    pub const OUT_DATA: usize = 0x20;
    /// Inline descriptors, or the descriptor array's device address.
    pub const BUFFER_DATA: usize = 0x30;
    /// Namespace id.
    pub const NSID: usize = 0x40;
    /// First byte past the command fields.
    pub const END: usize = NSID + NAMESPACE_ID_SIZE;

    /// Payloads up to this size travel inside the slot.
    pub const INLINE_DATA_SIZE: usize = 16;
    /// Descriptor count that fits inside the slot.
    pub const INLINE_BUFFER_COUNT: usize = 1;
    /// Namespace id width.
    pub const NAMESPACE_ID_SIZE: usize = 32;

    /// Flag bits.
    pub mod flags {
        /// Host posted a request.
        pub const REQUEST_VALID: u32 = 0x1;
        /// Accelerator posted the response.
        pub const RESPONSE_VALID: u32 = 0x2;
        /// The nsid field is meaningful.
        pub const REQUEST_NSID: u32 = 0x4;
        /// Accelerator could not route the request (unknown namespace).
        pub const RESPONSE_DELIVERY_FAIL: u32 = 0x8;
        /// Request and response both posted.
        pub const COMPLETE: u32 = REQUEST_VALID | RESPONSE_VALID;
    }
}

/// Buffer descriptor: `{ flags, size, addr, id }`, 16 bytes, little endian.
pub mod descriptor {
    /// Encoded descriptor size.
    pub const SIZE: usize = 16;
    /// Access flags offset.
    pub const FLAGS: usize = 0;
    /// Size offset.
    pub const LEN: usize = 4;
    /// Device address offset.
    pub const ADDR: usize = 8;
    /// Host buffer id offset.
    pub const ID: usize = 12;

    /// Accelerator reads the buffer.
    pub const ACCESS_READ: u32 = 0x1;
    /// Accelerator writes the buffer.
    pub const ACCESS_WRITE: u32 = 0x2;
}

/// Client-visible queue flags.
pub mod queue_flags {
    /// Request carries a namespace id.
    pub const NSID: u32 = 0x4;
    /// Priority field.
    pub const PRIO: u32 = 0xff00;
    /// Priority shift.
    pub const PRIO_SHIFT: u32 = 8;
    /// Every bit a client may set.
    pub const VALID: u32 = NSID | PRIO;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_fields_fit_in_slot() {
        assert!(cmd::END <= CMD_STRIDE);
        assert!(
            cmd::BUFFER_DATA + cmd::INLINE_BUFFER_COUNT * descriptor::SIZE <= cmd::NSID
        );
        assert_eq!(cmd::OUT_DATA - cmd::IN_DATA, cmd::INLINE_DATA_SIZE);
    }

    #[test]
    fn test_tlv_padding() {
        assert_eq!(tlv::padded(0), 0);
        assert_eq!(tlv::padded(5), 8);
        assert_eq!(tlv::record_size(8), 16);
        assert_eq!(tlv::CAPACITY, 224);
    }

    #[test]
    fn test_queue_offsets() {
        assert_eq!(MAX_QUEUES, 16);
        assert_eq!(queue_offset(3), 0x300);
        assert!(queue_offset(MAX_QUEUES - 1) + CMD_STRIDE <= COMM_REGION_SIZE);
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Command slot encoding.
//!
//! A request is written into its queue's slot payload-first; the flags word
//! goes last with release ordering, so the accelerator never sees
//! `REQUEST_VALID` before the payload. Responses are read after an acquire
//! load of the flags.

use crate::dma::DmaRegion;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use vdsp_chip::comm::cmd::{self, flags, INLINE_DATA_SIZE, NAMESPACE_ID_SIZE};
use vdsp_chip::comm::{descriptor, queue_flags};

/// One buffer descriptor as the accelerator reads it (little endian).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Descriptor {
    flags: u32,
    size: u32,
    addr: u32,
    id: u32,
}

const _: () = assert!(std::mem::size_of::<Descriptor>() == descriptor::SIZE);

impl Descriptor {
    /// Descriptor for `size` bytes at device address `addr`.
    pub fn new(access: u32, size: u32, addr: u32, id: u32) -> Self {
        Self {
            flags: access.to_le(),
            size: size.to_le(),
            addr: addr.to_le(),
            id: id.to_le(),
        }
    }

    /// Access bits.
    pub fn access(&self) -> u32 {
        u32::from_le(self.flags)
    }

    /// Length in bytes.
    pub fn size(&self) -> u32 {
        u32::from_le(self.size)
    }

    /// Device address.
    pub fn addr(&self) -> u32 {
        u32::from_le(self.addr)
    }

    /// Buffer id.
    pub fn id(&self) -> u32 {
        u32::from_le(self.id)
    }
}

/// Request or response data: inline in the slot, or at a device address.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Inline(Bytes),
    Remote { addr: u32, size: u32 },
}

impl Payload {
    pub fn size(&self) -> u32 {
        match self {
            Self::Inline(b) => u32::try_from(b.len()).unwrap_or(u32::MAX),
            Self::Remote { size, .. } => *size,
        }
    }
}

/// Where the descriptor array lives.
#[derive(Debug, Clone)]
pub(crate) enum Descriptors {
    None,
    Inline(Descriptor),
    Remote { addr: u32, count: u32 },
}

impl Descriptors {
    fn bytes(&self) -> u32 {
        let count = match self {
            Self::None => 0,
            Self::Inline(_) => 1,
            Self::Remote { count, .. } => *count,
        };
        count * descriptor::SIZE as u32
    }
}

/// A request with every buffer already at a device address.
#[derive(Debug, Clone)]
pub(crate) struct HwRequest {
    pub priority: u32,
    pub nsid: Option<[u8; NAMESPACE_ID_SIZE]>,
    pub input: Payload,
    /// Inline when `out_addr` is `None`
    pub out_size: u32,
    pub out_addr: Option<u32>,
    pub descriptors: Descriptors,
}

impl HwRequest {
    /// Queue flags carried in the slot flags word.
    pub fn queue_flags(&self) -> u32 {
        let nsid = if self.nsid.is_some() { queue_flags::NSID } else { 0 };
        nsid | ((self.priority << queue_flags::PRIO_SHIFT) & queue_flags::PRIO)
    }
}

/// Fill the slot at `base` and hand it to the accelerator.
pub(crate) fn post(comm: &DmaRegion, base: usize, req: &HwRequest) {
    comm.write32(base + cmd::IN_DATA_SIZE, req.input.size());
    comm.write32(base + cmd::OUT_DATA_SIZE, req.out_size);
    comm.write32(base + cmd::BUFFER_SIZE, req.descriptors.bytes());

    match &req.input {
        Payload::Inline(data) => {
            let mut inline = [0u8; INLINE_DATA_SIZE];
            inline[..data.len()].copy_from_slice(data);
            comm.write(base + cmd::IN_DATA, &inline);
        }
        Payload::Remote { addr, .. } => comm.write32(base + cmd::IN_DATA, *addr),
    }
    if let Some(addr) = req.out_addr {
        comm.write32(base + cmd::OUT_DATA, addr);
    }
    match &req.descriptors {
        Descriptors::None => {}
        Descriptors::Inline(d) => comm.write(base + cmd::BUFFER_DATA, bytemuck::bytes_of(d)),
        Descriptors::Remote { addr, .. } => comm.write32(base + cmd::BUFFER_DATA, *addr),
    }
    if let Some(nsid) = &req.nsid {
        comm.write(base + cmd::NSID, nsid);
    }

    // The queue NSID bit doubles as REQUEST_NSID in the slot.
    comm.write32(
        base + cmd::FLAGS,
        (req.queue_flags() & !flags::RESPONSE_VALID) | flags::REQUEST_VALID,
    );
}

/// Whether the accelerator answered the slot at `base`.
pub(crate) fn is_complete(comm: &DmaRegion, base: usize) -> bool {
    comm.read32(base + cmd::FLAGS) & flags::COMPLETE == flags::COMPLETE
}

/// Collect the answer and return the slot to idle. Returns the response flags
/// and the inline output.
pub(crate) fn take_response(comm: &DmaRegion, base: usize, req: &HwRequest) -> (u32, Bytes) {
    let status = comm.read32(base + cmd::FLAGS);
    let output = if req.out_addr.is_none() && req.out_size > 0 {
        let len = (req.out_size as usize).min(INLINE_DATA_SIZE);
        Bytes::from(comm.to_vec(base + cmd::OUT_DATA, len))
    } else {
        Bytes::new()
    };
    comm.write32(base + cmd::FLAGS, 0);
    (status, output)
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Client requests and their translation to command slots.
//!
//! Small payloads travel inline in the slot. Anything larger, and descriptor
//! arrays of more than one entry, go through staging buffers the driver
//! allocates in the client's namespace and maps for the duration of the
//! request. Buffers named by the request are device mapped for the same
//! span and unmapped afterwards.

// Sizes cross into 32-bit device fields
#![allow(clippy::cast_possible_truncation)]

use crate::error::{Result, VdspError};
use crate::mem::{BufferAttr, BufferId, BufferManager, HeapKind, NamespaceId, SyncDirection};
use crate::transport::wire::{Descriptor, Descriptors, HwRequest, Payload};
use crate::transport::{LinkState, Transport};
use bitflags::bitflags;
use bytes::Bytes;
use tracing::{debug, warn};
use vdsp_chip::comm::cmd::{INLINE_BUFFER_COUNT, INLINE_DATA_SIZE, NAMESPACE_ID_SIZE};
use vdsp_chip::comm::{descriptor, queue_flags};
use vdsp_chip::library::nsid_for;

bitflags! {
    /// How the accelerator may touch a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        /// Accelerator reads
        const READ = descriptor::ACCESS_READ;
        /// Accelerator writes
        const WRITE = descriptor::ACCESS_WRITE;
    }
}

/// A buffer handed to the accelerator with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    /// Buffer in the submitting session's namespace
    pub buffer: BufferId,
    /// Access granted
    pub access: Access,
}

impl BufferRef {
    /// Read-only reference.
    pub fn read(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: Access::READ,
        }
    }

    /// Read-write reference.
    pub fn read_write(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: Access::READ | Access::WRITE,
        }
    }
}

/// A request to the accelerator.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Priority rank; clamped to the queues available
    pub priority: u32,
    /// Routing namespace inside the firmware
    pub nsid: Option<[u8; NAMESPACE_ID_SIZE]>,
    /// Input bytes
    pub input: Bytes,
    /// Output bytes expected back
    pub output_size: usize,
    /// Buffers passed by reference
    pub buffers: Vec<BufferRef>,
}

impl Request {
    /// Request carrying `input`.
    pub fn new(input: impl Into<Bytes>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    /// Expect `size` bytes of output.
    #[must_use]
    pub fn with_output(mut self, size: usize) -> Self {
        self.output_size = size;
        self
    }

    /// Priority rank.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Route to the firmware namespace `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` does not fit a namespace id.
    pub fn with_namespace(mut self, name: &str) -> Result<Self> {
        self.nsid = Some(nsid_for(name)?);
        Ok(self)
    }

    /// Pass a buffer by reference.
    #[must_use]
    pub fn with_buffer(mut self, buffer: BufferRef) -> Self {
        self.buffers.push(buffer);
        self
    }

    /// Check the fields the slot format constrains.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for an out-of-range priority or
    /// oversized payload.
    pub fn validate(&self) -> Result<()> {
        if (self.priority << queue_flags::PRIO_SHIFT) & !queue_flags::PRIO != 0 {
            return Err(VdspError::invalid_argument(format!(
                "priority {} does not fit the queue flags",
                self.priority
            )));
        }
        if u32::try_from(self.input.len()).is_err() || u32::try_from(self.output_size).is_err() {
            return Err(VdspError::invalid_argument("payload larger than 4 GiB"));
        }
        Ok(())
    }
}

/// Answer to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Output bytes
    pub output: Bytes,
    /// Link generation the request completed in
    pub generation: u64,
}

/// Maps a request's buffers, posts it, and cleans up.
pub(crate) struct Executor<'a> {
    pub buffers: &'a BufferManager,
    pub transport: &'a Transport,
}

#[derive(Default)]
struct Staged {
    /// Client buffers device mapped for the request
    mapped: Vec<BufferId>,
    /// Driver-allocated staging buffers
    staging: Vec<BufferId>,
    out_buffer: Option<BufferId>,
}

impl Executor<'_> {
    /// Run `req` on behalf of namespace `ns`.
    pub fn run(&self, ns: NamespaceId, req: &Request) -> Result<Response> {
        req.validate()?;
        let mut staged = Staged::default();
        let result = self
            .prepare(ns, req, &mut staged)
            .and_then(|hw| {
                let completion = self.transport.submit(&hw)?;
                let output = match staged.out_buffer {
                    Some(out) => {
                        self.buffers.sync(ns, out, SyncDirection::FromDevice)?;
                        Bytes::from(self.buffers.region(ns, out)?.to_vec(0, req.output_size))
                    }
                    None => completion.output,
                };
                Ok(Response {
                    output,
                    generation: completion.generation,
                })
            });

        if matches!(result, Err(VdspError::DeviceUnavailable))
            && self.transport.link().0 == LinkState::Down
        {
            warn!(
                "{ns}: accelerator down, leaving {} request buffer(s) mapped",
                staged.mapped.len() + staged.staging.len()
            );
            return result;
        }
        self.cleanup(ns, &staged);
        result
    }

    fn prepare(&self, ns: NamespaceId, req: &Request, staged: &mut Staged) -> Result<HwRequest> {
        let mut descriptors = Vec::with_capacity(req.buffers.len());
        for r in &req.buffers {
            let addr = self.buffers.map_device(ns, r.buffer)?;
            staged.mapped.push(r.buffer);
            self.buffers.sync(ns, r.buffer, SyncDirection::ToDevice)?;
            let size = self.buffers.info(ns, r.buffer)?.requested_size;
            descriptors.push(Descriptor::new(
                r.access.bits(),
                size as u32,
                addr as u32,
                r.buffer.0,
            ));
        }

        let input = if req.input.len() <= INLINE_DATA_SIZE {
            Payload::Inline(req.input.clone())
        } else {
            let (_, addr) = self.stage(ns, staged, &req.input, req.input.len())?;
            Payload::Remote {
                addr,
                size: req.input.len() as u32,
            }
        };

        let out_addr = if req.output_size > INLINE_DATA_SIZE {
            let (id, addr) = self.stage(ns, staged, &[], req.output_size)?;
            staged.out_buffer = Some(id);
            Some(addr)
        } else {
            None
        };

        let descriptors = match descriptors.len() {
            0 => Descriptors::None,
            n if n <= INLINE_BUFFER_COUNT => Descriptors::Inline(descriptors[0]),
            n => {
                let bytes = bytemuck::cast_slice::<Descriptor, u8>(&descriptors);
                let (_, addr) = self.stage(ns, staged, bytes, bytes.len())?;
                Descriptors::Remote {
                    addr,
                    count: n as u32,
                }
            }
        };

        Ok(HwRequest {
            priority: req.priority,
            nsid: req.nsid,
            input,
            out_size: req.output_size as u32,
            out_addr,
            descriptors,
        })
    }

    /// Allocate, fill and map a staging buffer.
    fn stage(&self, ns: NamespaceId, staged: &mut Staged, data: &[u8], size: usize) -> Result<(BufferId, u32)> {
        let heap = self
            .buffers
            .heap_id(HeapKind::Unified)
            .ok_or(VdspError::UnknownHeap { heap: 0 })?;
        let id = self.buffers.alloc(ns, heap, size, BufferAttr::WRITECOMBINE)?;
        staged.staging.push(id);
        if !data.is_empty() {
            self.buffers.region(ns, id)?.write(0, data);
        }
        let addr = self.buffers.map_device(ns, id)?;
        debug!("{ns}: staged {size:#x} bytes in {id} at {addr:#x}");
        Ok((id, addr as u32))
    }

    fn cleanup(&self, ns: NamespaceId, staged: &Staged) {
        for &id in &staged.mapped {
            if let Err(e) = self.buffers.unmap_device(ns, id) {
                warn!("{ns}: unmap of request buffer {id}: {e}");
            }
        }
        for &id in &staged.staging {
            let _ = self.buffers.unmap_device(ns, id);
            if let Err(e) = self.buffers.free(ns, id) {
                warn!("{ns}: free of staging buffer {id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_and_validation() {
        let req = Request::new(&b"abc"[..])
            .with_output(8)
            .with_priority(1)
            .with_buffer(BufferRef::read_write(BufferId(5)))
            .with_namespace("lib.fft")
            .unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.buffers[0].access, Access::READ | Access::WRITE);
        assert!(req.nsid.is_some());

        assert!(Request::new(Bytes::new()).with_priority(256).validate().is_err());
        assert!(Request::new(Bytes::new()).with_namespace(&"x".repeat(40)).is_err());
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer identity and bookkeeping.

use crate::dma::DmaRegion;
use crate::error::{Result, VdspError};
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

/// Buffer handle, unique across namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Cache and security attributes of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferAttr: u32 {
        /// Host-cached; needs cache maintenance around device access
        const CACHED = 1 << 0;
        /// Host-uncached
        const UNCACHED = 1 << 1;
        /// Write-combined host mapping
        const WRITECOMBINE = 1 << 2;
        /// Secure memory
        const SECURE = 1 << 3;
    }
}

impl BufferAttr {
    /// Whether host caches hold this buffer's lines.
    pub fn is_cached(self) -> bool {
        !self.intersects(Self::UNCACHED | Self::WRITECOMBINE)
    }
}

impl Default for BufferAttr {
    fn default() -> Self {
        Self::CACHED
    }
}

/// Heap families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Shareable system memory
    Unified,
    /// Imported dma-buf style file descriptors
    DmaBuf,
    /// Anonymous memory and imported user pointers
    Anonymous,
    /// Physically contiguous pool
    Carveout,
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unified => write!(f, "unified"),
            Self::DmaBuf => write!(f, "dmabuf"),
            Self::Anonymous => write!(f, "anonymous"),
            Self::Carveout => write!(f, "carveout"),
        }
    }
}

/// Snapshot of a buffer's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Handle
    pub id: BufferId,
    /// Heap id
    pub heap: u32,
    /// Heap family
    pub kind: HeapKind,
    /// Size the caller asked for
    pub requested_size: usize,
    /// Backing size, whole pages
    pub size: usize,
    /// Attributes
    pub attr: BufferAttr,
    /// Device address while device mapped
    pub device_addr: Option<u64>,
    /// Physical address for contiguous heaps
    pub paddr: Option<u64>,
    /// Live driver-side host mappings
    pub kernel_maps: u32,
    /// Live user mappings
    pub user_maps: u32,
}

/// Host view of a buffer, handed to the driver or a client.
#[derive(Debug, Clone)]
pub struct UserMapping {
    id: BufferId,
    region: Arc<DmaRegion>,
    len: usize,
}

impl UserMapping {
    pub(crate) fn new(id: BufferId, region: Arc<DmaRegion>, len: usize) -> Self {
        Self { id, region, len }
    }

    /// Mapped buffer.
    pub fn buffer(&self) -> BufferId {
        self.id
    }

    /// Mapped length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` in at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if the range falls outside
    /// the mapping.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.region.write(offset, data);
        Ok(())
    }

    /// Copy `len` bytes out from `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if the range falls outside
    /// the mapping.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        Ok(self.region.to_vec(offset, len))
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(VdspError::invalid_argument(format!(
                "{}: {offset:#x}+{len:#x} outside {:#x} byte mapping",
                self.id, self.len
            ))),
        }
    }
}

/// Allocated buffer.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub id: BufferId,
    pub heap: u32,
    pub kind: HeapKind,
    pub requested_size: usize,
    pub attr: BufferAttr,
    pub region: Arc<DmaRegion>,
    pub paddr: Option<u64>,
    pub device_addr: Option<u64>,
    pub kernel_maps: u32,
    pub user_maps: u32,
}

impl Buffer {
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Page-granular scatter list as (bus address, length) runs.
    pub fn scatter(&self) -> Vec<(u64, u64)> {
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for page in self.region.pages() {
            match runs.last_mut() {
                Some((start, len)) if *start + *len == page => {
                    *len += vdsp_chip::iommu::PAGE_SIZE;
                }
                _ => runs.push((page, vdsp_chip::iommu::PAGE_SIZE)),
            }
        }
        runs
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            id: self.id,
            heap: self.heap,
            kind: self.kind,
            requested_size: self.requested_size,
            size: self.size(),
            attr: self.attr,
            device_addr: self.device_addr,
            paddr: self.paddr,
            kernel_maps: self.kernel_maps,
            user_maps: self.user_maps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_caching() {
        assert!(BufferAttr::default().is_cached());
        assert!(BufferAttr::SECURE.is_cached());
        assert!(!BufferAttr::UNCACHED.is_cached());
        assert!(!(BufferAttr::CACHED | BufferAttr::WRITECOMBINE).is_cached());
    }

    #[test]
    fn test_scatter_merges_contiguous_pages() {
        let region = Arc::new(DmaRegion::alloc(3 * 4096).unwrap());
        let buf = Buffer {
            id: BufferId(1),
            heap: 0,
            kind: HeapKind::Unified,
            requested_size: 10_000,
            attr: BufferAttr::default(),
            region: Arc::clone(&region),
            paddr: None,
            device_addr: None,
            kernel_maps: 0,
            user_maps: 0,
        };
        assert_eq!(buf.scatter(), vec![(region.phys(), 3 * 4096)]);
        assert_eq!(buf.info().size, 3 * 4096);
        assert_eq!(buf.id.to_string(), "#1");
    }

    #[test]
    fn test_mapping_rejects_out_of_range_access() {
        let region = Arc::new(DmaRegion::alloc(4096).unwrap());
        let view = UserMapping::new(BufferId(7), region, 100);
        view.write(96, b"tail").unwrap();
        assert_eq!(view.read(96, 4).unwrap(), b"tail");
        assert!(matches!(view.write(97, b"tail"), Err(VdspError::InvalidArgument { .. })));
        assert!(matches!(view.read(100, 1), Err(VdspError::InvalidArgument { .. })));
        assert!(view.read(usize::MAX, 2).is_err());
        assert!(view.read(100, 0).unwrap().is_empty());
    }
}

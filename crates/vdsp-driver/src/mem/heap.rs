// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer heaps.
//!
//! Heaps are a closed set. Each one decides where a buffer's pages come from
//! and whether the buffer can be shared with other processes.
//!
//! | Heap | Allocates | Imports | Exports | Contiguous |
//! |------|-----------|---------|---------|------------|
//! | unified | memfd | - | yes | no |
//! | dmabuf | - | fd | yes | no |
//! | anonymous | anonymous mmap | user pointer | no | no |
//! | carveout | pool slice | - | no | yes |

// Sizes and offsets convert between u64 bus addresses and usize lengths
#![allow(clippy::cast_possible_truncation)]

use super::buffer::HeapKind;
use crate::dma::{DmaRegion, PhysMemory};
use crate::error::{Result, VdspError};
use crate::iommu::IovaAllocator;
use crate::lock;
use rustix::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use vdsp_chip::iommu::{page_align, PAGE_SIZE};

/// Public description of a heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapInfo {
    /// Heap id used in allocation requests
    pub id: u32,
    /// Family
    pub kind: HeapKind,
    /// Whether buffers are physically contiguous
    pub contiguous: bool,
    /// Whether buffers can be exported as file descriptors
    pub exportable: bool,
}

/// Pages backing one buffer.
#[derive(Debug)]
pub(crate) struct Backing {
    pub region: Arc<DmaRegion>,
    pub paddr: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct Carveout {
    pool: Arc<DmaRegion>,
    slices: Mutex<IovaAllocator>,
}

#[derive(Debug)]
pub(crate) enum Heap {
    Unified,
    DmaBuf,
    Anonymous,
    Carveout(Carveout),
}

impl Heap {
    /// The default heap set; the carveout pool is only created when
    /// `carveout_size` is non-zero.
    pub fn standard(memory: &PhysMemory, carveout_size: usize) -> Result<Vec<Self>> {
        let mut heaps = vec![Self::Unified, Self::DmaBuf, Self::Anonymous];
        let carveout_size = (carveout_size as u64 / PAGE_SIZE * PAGE_SIZE) as usize;
        if carveout_size > 0 {
            let pool = memory.alloc(carveout_size)?;
            let slices = IovaAllocator::new(pool.phys(), carveout_size as u64)?;
            info!(
                "carveout heap: {carveout_size:#x} bytes at {:#x}",
                pool.phys()
            );
            heaps.push(Self::Carveout(Carveout {
                pool,
                slices: Mutex::new(slices),
            }));
        }
        Ok(heaps)
    }

    pub const fn kind(&self) -> HeapKind {
        match self {
            Self::Unified => HeapKind::Unified,
            Self::DmaBuf => HeapKind::DmaBuf,
            Self::Anonymous => HeapKind::Anonymous,
            Self::Carveout(_) => HeapKind::Carveout,
        }
    }

    pub fn info(&self, id: u32) -> HeapInfo {
        HeapInfo {
            id,
            kind: self.kind(),
            contiguous: matches!(self, Self::Carveout(_)),
            exportable: matches!(self, Self::Unified | Self::DmaBuf),
        }
    }

    /// Allocate `size` bytes, page rounded.
    pub fn alloc(&self, memory: &PhysMemory, size: usize) -> Result<Backing> {
        if size == 0 {
            return Err(VdspError::invalid_argument("zero-size buffer"));
        }
        let size = page_align(size as u64) as usize;
        match self {
            Self::Unified => Ok(Backing {
                region: memory.register(DmaRegion::memfd("vdsp-unified", size)?),
                paddr: None,
            }),
            Self::Anonymous => Ok(Backing {
                region: memory.register(DmaRegion::anonymous(size)?),
                paddr: None,
            }),
            Self::DmaBuf => Err(VdspError::invalid_argument(
                "dmabuf heap only imports buffers",
            )),
            Self::Carveout(c) => {
                let phys = lock(&c.slices).alloc(size as u64)?;
                let offset = (phys - c.pool.phys()) as usize;
                let region = match DmaRegion::sub(&c.pool, offset, size) {
                    Ok(r) => Arc::new(r),
                    Err(e) => {
                        let _ = lock(&c.slices).free(phys, size as u64);
                        return Err(e);
                    }
                };
                debug!("carveout slice {phys:#x}+{size:#x}");
                Ok(Backing {
                    region,
                    paddr: Some(phys),
                })
            }
        }
    }

    /// Map a shared fd. The fd must hold at least `size` bytes and at most one
    /// page more.
    pub fn import_fd(&self, memory: &PhysMemory, fd: OwnedFd, size: usize) -> Result<Backing> {
        if !matches!(self, Self::DmaBuf) {
            return Err(VdspError::invalid_argument(format!(
                "{} heap does not import file descriptors",
                self.kind()
            )));
        }
        if size == 0 {
            return Err(VdspError::invalid_argument("zero-size import"));
        }
        let actual = rustix::fs::fstat(&fd)?.st_size;
        let actual = u64::try_from(actual)
            .map_err(|_| VdspError::invalid_argument("negative fd size"))?;
        check_import_size(actual, size)?;
        let len = page_align(actual) as usize;
        Ok(Backing {
            region: memory.register(DmaRegion::map_fd(fd, len)?),
            paddr: None,
        })
    }

    /// Wrap caller-owned pages.
    ///
    /// # Safety
    ///
    /// See [`DmaRegion::borrow`].
    pub unsafe fn import_user(
        &self,
        memory: &PhysMemory,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Backing> {
        if !matches!(self, Self::Anonymous) {
            return Err(VdspError::invalid_argument(format!(
                "{} heap does not import user memory",
                self.kind()
            )));
        }
        // SAFETY: forwarded from the caller.
        let region = unsafe { DmaRegion::borrow(ptr, size)? };
        Ok(Backing {
            region: memory.register(region),
            paddr: None,
        })
    }

    /// Share a buffer's pages as a new fd.
    pub fn export(&self, region: &DmaRegion) -> Result<OwnedFd> {
        if !matches!(self, Self::Unified | Self::DmaBuf) {
            return Err(VdspError::invalid_argument(format!(
                "{} heap buffers cannot be exported",
                self.kind()
            )));
        }
        let fd = region
            .fd()
            .ok_or_else(|| VdspError::invalid_argument("buffer has no shareable fd"))?;
        Ok(fd.try_clone_to_owned()?)
    }

    /// Give a buffer's pages back.
    pub fn free(&self, backing: &Backing) {
        if let (Self::Carveout(c), Some(phys)) = (self, backing.paddr) {
            if let Err(e) = lock(&c.slices).free(phys, backing.region.len() as u64) {
                tracing::error!("carveout free of {phys:#x}: {e}");
            }
        }
    }
}

fn check_import_size(actual: u64, requested: usize) -> Result<()> {
    let requested = requested as u64;
    if actual < requested {
        return Err(VdspError::invalid_argument(format!(
            "import of {requested:#x} bytes from an fd of {actual:#x}"
        )));
    }
    if actual - requested > PAGE_SIZE {
        return Err(VdspError::invalid_argument(format!(
            "fd holds {actual:#x} bytes, more than a page over the requested {requested:#x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_size_rule() {
        assert!(check_import_size(0x1000, 0x1000).is_ok());
        assert!(check_import_size(0x2000, 0x1800).is_ok());
        assert!(check_import_size(0x2000, 0x1000).is_ok());
        assert!(check_import_size(0x3000, 0x1000).is_err());
        assert!(check_import_size(0x1000, 0x2000).is_err());
    }

    #[test]
    fn test_carveout_slices_are_contiguous_and_reused() {
        let memory = PhysMemory::new();
        let heaps = Heap::standard(&memory, 4 * 4096).unwrap();
        let carveout = &heaps[3];
        assert!(carveout.info(3).contiguous);

        let a = carveout.alloc(&memory, 4096).unwrap();
        let b = carveout.alloc(&memory, 8192).unwrap();
        assert_eq!(b.paddr.unwrap(), a.paddr.unwrap() + 4096);
        assert!(carveout.alloc(&memory, 8192).is_err());

        carveout.free(&a);
        let c = carveout.alloc(&memory, 4096).unwrap();
        assert_eq!(c.paddr, a.paddr);
    }

    #[test]
    fn test_no_carveout_when_disabled() {
        let heaps = Heap::standard(&PhysMemory::new(), 0).unwrap();
        assert_eq!(heaps.len(), 3);
        assert!(heaps.iter().all(|h| h.kind() != HeapKind::Carveout));
    }

    #[test]
    fn test_export_support() {
        let memory = PhysMemory::new();
        let heaps = Heap::standard(&memory, 0).unwrap();
        let unified = heaps[0].alloc(&memory, 100).unwrap();
        assert!(heaps[0].export(&unified.region).is_ok());
        let anon = heaps[2].alloc(&memory, 100).unwrap();
        assert!(heaps[2].export(&anon.region).is_err());
        assert!(heaps[1].alloc(&memory, 100).is_err());
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! First-fit IOVA allocator with named reserved extents.
//!
//! Extents are page granular and kept in a `BTreeMap` keyed by start address.
//! Reserved extents are carved out once by [`IovaAllocator::reserve_init`] and
//! afterwards checked out and in by [`IovaAllocator::alloc_fixed`] and
//! [`IovaAllocator::free`]; they only return to the pool through
//! [`IovaAllocator::reserve_release`].
//!
//! The allocator does no locking of its own. It lives under the IOMMU table
//! lock.

use crate::config::ReservedExtent;
use crate::error::{Result, VdspError};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use vdsp_chip::iommu::{is_page_aligned, page_align};

#[derive(Debug, Clone)]
struct Reserved {
    name: String,
    addr: u64,
    size: u64,
    checked_out: bool,
}

/// Device virtual address allocator.
#[derive(Debug)]
pub struct IovaAllocator {
    base: u64,
    size: u64,
    /// start -> size of every allocated extent, reserved ones included
    extents: BTreeMap<u64, u64>,
    reserved: Vec<Reserved>,
}

impl IovaAllocator {
    /// Manage `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for an empty or misaligned window.
    pub fn new(base: u64, size: u64) -> Result<Self> {
        if size == 0 || !is_page_aligned(base) || !is_page_aligned(size) {
            return Err(VdspError::invalid_argument(format!(
                "IOVA window {base:#x}+{size:#x} must be non-empty and page aligned"
            )));
        }
        debug!("IOVA window {base:#x}+{size:#x}");
        Ok(Self {
            base,
            size,
            extents: BTreeMap::new(),
            reserved: Vec::new(),
        })
    }

    /// First address of the window.
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Window size.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently allocated, reserved extents included.
    pub fn used(&self) -> u64 {
        self.extents.values().sum()
    }

    /// Allocate the first free range of `size` bytes (page rounded).
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::ResourceExhausted`] when no gap is large enough.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(VdspError::invalid_argument("zero-size IOVA allocation"));
        }
        let size = page_align(size);
        let end = self.base + self.size;
        let mut candidate = self.base;
        for (&start, &len) in &self.extents {
            if start >= candidate + size {
                break;
            }
            candidate = candidate.max(start + len);
        }
        if candidate + size > end {
            error!("IOVA space exhausted allocating {size:#x} bytes");
            return Err(VdspError::exhausted("IOVA space"));
        }
        self.extents.insert(candidate, size);
        debug!("IOVA alloc {candidate:#x}+{size:#x}");
        Ok(candidate)
    }

    /// Check out the reserved extent at `addr`, or allocate exactly
    /// `[addr, addr + size)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range escapes the window, overlaps an existing
    /// extent, or names a reserved extent that is already checked out.
    pub fn alloc_fixed(&mut self, addr: u64, size: u64) -> Result<()> {
        let size = page_align(size);
        if size == 0
            || !is_page_aligned(addr)
            || addr < self.base
            || addr + size > self.base + self.size
        {
            return Err(VdspError::invalid_argument(format!(
                "fixed IOVA {addr:#x}+{size:#x} outside window"
            )));
        }

        if let Some(res) = self
            .reserved
            .iter_mut()
            .find(|r| r.addr == addr && r.size == size)
        {
            if res.checked_out {
                error!("reserved extent {} already in use", res.name);
                return Err(VdspError::exhausted(format!("reserved extent {}", res.name)));
            }
            res.checked_out = true;
            debug!("IOVA reserve {} checked out", res.name);
            return Ok(());
        }

        if self.overlaps(addr, size) {
            return Err(VdspError::invalid_argument(format!(
                "fixed IOVA {addr:#x}+{size:#x} overlaps an existing extent"
            )));
        }
        warn!("no reserved extent at {addr:#x}+{size:#x}, allocating fixed range");
        self.extents.insert(addr, size);
        Ok(())
    }

    /// Release an extent. A reserved extent is checked back in and stays out
    /// of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if no extent starts at `addr`
    /// with that size.
    pub fn free(&mut self, addr: u64, size: u64) -> Result<()> {
        let size = page_align(size);
        if let Some(res) = self
            .reserved
            .iter_mut()
            .find(|r| r.addr == addr && r.size == size)
        {
            res.checked_out = false;
            debug!("IOVA reserve {} checked in", res.name);
            return Ok(());
        }
        match self.extents.get(&addr) {
            Some(&len) if len == size => {
                self.extents.remove(&addr);
                debug!("IOVA free {addr:#x}+{size:#x}");
                Ok(())
            }
            _ => Err(VdspError::invalid_argument(format!(
                "no IOVA extent {addr:#x}+{size:#x}"
            ))),
        }
    }

    /// Carve out named extents at fixed offsets from the base.
    ///
    /// # Errors
    ///
    /// Returns an error, with nothing carved out, if any extent does not fit.
    pub fn reserve_init(&mut self, list: &[ReservedExtent]) -> Result<()> {
        let mut carved: Vec<Reserved> = Vec::with_capacity(list.len());
        for ext in list {
            let addr = self.base + ext.offset;
            let size = page_align(ext.size);
            let fits = size != 0
                && is_page_aligned(addr)
                && addr + size <= self.base + self.size
                && !self.overlaps(addr, size);
            if !fits {
                for r in &carved {
                    self.extents.remove(&r.addr);
                }
                return Err(VdspError::invalid_argument(format!(
                    "reserved extent {} at {:#x}+{size:#x} does not fit",
                    ext.name, ext.offset
                )));
            }
            self.extents.insert(addr, size);
            carved.push(Reserved {
                name: ext.name.clone(),
                addr,
                size,
                checked_out: false,
            });
        }
        self.reserved.extend(carved);
        Ok(())
    }

    /// Return every reserved extent to the pool.
    pub fn reserve_release(&mut self) {
        for res in self.reserved.drain(..) {
            if res.checked_out {
                warn!("reserved extent {} still in use at release", res.name);
            }
            self.extents.remove(&res.addr);
        }
    }

    /// Address of a reserved extent by name.
    pub fn reserved(&self, name: &str) -> Option<(u64, u64)> {
        self.reserved
            .iter()
            .find(|r| r.name == name)
            .map(|r| (r.addr, r.size))
    }

    /// Whether a reserved extent is currently checked out.
    pub fn is_checked_out(&self, name: &str) -> bool {
        self.reserved
            .iter()
            .any(|r| r.name == name && r.checked_out)
    }

    fn overlaps(&self, addr: u64, size: u64) -> bool {
        self.extents
            .range(..addr + size)
            .next_back()
            .is_some_and(|(&start, &len)| addr < start + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x8000_0000;

    fn fw_extent() -> ReservedExtent {
        ReservedExtent {
            name: "fw_buf".to_owned(),
            offset: 0,
            size: 0x4000,
        }
    }

    #[test]
    fn test_first_fit_reuses_gap() {
        let mut iova = IovaAllocator::new(BASE, 0x10_0000).unwrap();
        let a = iova.alloc(0x1000).unwrap();
        let b = iova.alloc(0x2000).unwrap();
        let c = iova.alloc(10).unwrap();
        assert_eq!((a, b, c), (BASE, BASE + 0x1000, BASE + 0x3000));
        iova.free(b, 0x2000).unwrap();
        assert_eq!(iova.alloc(0x1000).unwrap(), BASE + 0x1000);
        assert_eq!(iova.alloc(0x2000).unwrap(), BASE + 0x4000);
    }

    #[test]
    fn test_exhaustion() {
        let mut iova = IovaAllocator::new(BASE, 0x2000).unwrap();
        iova.alloc(0x2000).unwrap();
        assert!(matches!(
            iova.alloc(0x1000),
            Err(VdspError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_fixed_rejects_overlap_and_escape() {
        let mut iova = IovaAllocator::new(BASE, 0x10_0000).unwrap();
        iova.alloc_fixed(BASE + 0x3000, 0x2000).unwrap();
        assert!(iova.alloc_fixed(BASE + 0x4000, 0x1000).is_err());
        assert!(iova.alloc_fixed(BASE + 0x10_0000, 0x1000).is_err());
        assert!(iova.alloc_fixed(BASE - 0x1000, 0x1000).is_err());
        // first fit skips the fixed extent
        assert_eq!(iova.alloc(0x4000).unwrap(), BASE + 0x5000);
    }

    #[test]
    fn test_reserve_checkout_and_checkin_restores_state() {
        let mut iova = IovaAllocator::new(BASE, 0x10_0000).unwrap();
        iova.reserve_init(&[fw_extent()]).unwrap();
        let used = iova.used();

        iova.alloc_fixed(BASE, 0x4000).unwrap();
        assert!(iova.is_checked_out("fw_buf"));
        assert!(iova.alloc_fixed(BASE, 0x4000).is_err());

        iova.free(BASE, 0x4000).unwrap();
        assert!(!iova.is_checked_out("fw_buf"));
        assert_eq!(iova.used(), used);
        // still carved out of the pool
        assert_eq!(iova.alloc(0x1000).unwrap(), BASE + 0x4000);
    }

    #[test]
    fn test_reserve_release_returns_extents() {
        let mut iova = IovaAllocator::new(BASE, 0x10_0000).unwrap();
        iova.reserve_init(&[fw_extent()]).unwrap();
        iova.alloc_fixed(BASE, 0x4000).unwrap();
        iova.reserve_release();
        assert_eq!(iova.used(), 0);
        assert_eq!(iova.alloc(0x1000).unwrap(), BASE);
    }

    #[test]
    fn test_reserve_init_rolls_back() {
        let mut iova = IovaAllocator::new(BASE, 0x10_0000).unwrap();
        let list = [
            fw_extent(),
            ReservedExtent {
                name: "too_big".to_owned(),
                offset: 0x8000,
                size: 0x20_0000,
            },
        ];
        assert!(iova.reserve_init(&list).is_err());
        assert_eq!(iova.used(), 0);
        assert!(iova.reserved("fw_buf").is_none());
    }
}

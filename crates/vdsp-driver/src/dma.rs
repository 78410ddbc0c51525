// SPDX-License-Identifier: AGPL-3.0-only

//! Pinned host memory reachable by the accelerator.
//!
//! A [`DmaRegion`] is a page-aligned range of host memory whose pages stay
//! resident while the region lives. Each region also gets a range in a
//! 44-bit bus address space, which is what the IOMMU page tables point at;
//! [`PhysMemory`] resolves a bus address back to the region that owns it.
//! The simulated accelerator walks page tables through that registry.
//!
//! Bus ranges are handed out once and never reused, so a stale page-table
//! entry can never alias a newer region.
//!
//! Word accessors are atomic with acquire/release ordering; they are the only
//! accesses used on memory the accelerator writes concurrently.

// Region accessors cast between pointer and integer widths on purpose
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{Result, VdspError};
use crate::lock;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{mlock, mmap, mmap_anonymous, munlock, munmap, MapFlags, ProtFlags};
use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use vdsp_chip::iommu::{is_page_aligned, page_align, PAGE_SIZE};

const PAGE: usize = PAGE_SIZE as usize;

/// First bus address handed out; above the 32-bit device window.
pub const BUS_BASE: u64 = 0x1_0000_0000;

static BUS_TOP: AtomicU64 = AtomicU64::new(BUS_BASE);

/// Claim a bus range for `len` bytes, with one unused page after it.
fn bus_range(len: usize) -> u64 {
    BUS_TOP.fetch_add(page_align(len as u64) + PAGE_SIZE, Ordering::Relaxed)
}

enum Owner {
    /// `alloc_zeroed` with this layout
    Heap(Layout),
    /// `mmap`, optionally of a shareable fd
    Mapping(Option<OwnedFd>),
    /// Caller-owned pages
    Borrowed,
    /// Slice of a larger region
    Sub(Arc<DmaRegion>),
}

/// Pinned, page-aligned host memory.
pub struct DmaRegion {
    ptr: NonNull<u8>,
    bus: u64,
    len: usize,
    owner: Owner,
    locked: bool,
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = match &self.owner {
            Owner::Heap(_) => "heap",
            Owner::Mapping(Some(_)) => "fd",
            Owner::Mapping(None) => "anonymous",
            Owner::Borrowed => "borrowed",
            Owner::Sub(_) => "sub",
        };
        f.debug_struct("DmaRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("bus", &format_args!("{:#x}", self.bus))
            .field("len", &self.len)
            .field("owner", &owner)
            .field("locked", &self.locked)
            .finish()
    }
}

// SAFETY: Send - DmaRegion owns (or borrows for its whole life) the pages it points at.
// The mapping is process-wide, so moving the handle between threads keeps it valid.
unsafe impl Send for DmaRegion {}

// SAFETY: Sync - shared access goes through atomic word accessors or bounds-checked
// copies. Concurrent writers are coordinated by the command protocol (valid flags
// with release/acquire handoff), the same contract the accelerator follows.
unsafe impl Sync for DmaRegion {}

/// Best-effort pin; containers commonly cap `RLIMIT_MEMLOCK`.
fn pin(ptr: NonNull<u8>, len: usize) -> bool {
    // SAFETY: mlock only changes residency of [ptr, ptr+len), which the caller owns.
    match unsafe { mlock(ptr.as_ptr().cast(), len) } {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("mlock of {len:#x} bytes at {ptr:p} failed ({e}), continuing unpinned");
            false
        }
    }
}

impl DmaRegion {
    /// Allocate zeroed, page-aligned memory.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for a zero size and
    /// [`VdspError::ResourceExhausted`] if the allocation fails.
    pub fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(VdspError::invalid_argument("zero-size DMA allocation"));
        }
        let len = page_align(len as u64) as usize;
        let layout = Layout::from_size_align(len, PAGE)
            .map_err(|e| VdspError::invalid_argument(format!("DMA layout: {e}")))?;

        // SAFETY: alloc_zeroed with a non-zero size and power-of-two alignment. The
        // same layout is handed to dealloc in Drop.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| VdspError::exhausted("DMA memory"))?;
        let locked = pin(ptr, len);

        tracing::debug!("Allocated DMA region at {ptr:p}, size={len:#x}");
        Ok(Self {
            ptr,
            bus: bus_range(len),
            len,
            owner: Owner::Heap(layout),
            locked,
        })
    }

    /// Map `len` bytes of a shareable fd (memfd or dma-buf).
    ///
    /// # Errors
    ///
    /// Returns an error if the fd cannot be mapped.
    pub fn map_fd(fd: OwnedFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(VdspError::invalid_argument("zero-size fd mapping"));
        }
        // SAFETY: mmap of a caller-provided fd into a fresh address range chosen by
        // the kernel. The range is unmapped exactly once in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd.as_fd(),
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VdspError::invalid_argument("mmap returned null"))?;
        let locked = pin(ptr, len);
        Ok(Self {
            ptr,
            bus: bus_range(len),
            len,
            owner: Owner::Mapping(Some(fd)),
            locked,
        })
    }

    /// Create a memfd of `len` bytes (page rounded) and map it.
    ///
    /// # Errors
    ///
    /// Returns an error if the memfd cannot be created, sized or mapped.
    pub fn memfd(name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(VdspError::invalid_argument("zero-size memfd"));
        }
        let len = page_align(len as u64) as usize;
        let fd = rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, len as u64)?;
        Self::map_fd(fd, len)
    }

    /// Map anonymous private pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    pub fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(VdspError::invalid_argument("zero-size anonymous mapping"));
        }
        let len = page_align(len as u64) as usize;
        // SAFETY: fresh anonymous mapping at a kernel-chosen address, unmapped in Drop.
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VdspError::invalid_argument("mmap returned null"))?;
        let locked = pin(ptr, len);
        Ok(Self {
            ptr,
            bus: bus_range(len),
            len,
            owner: Owner::Mapping(None),
            locked,
        })
    }

    /// Wrap caller-owned pages.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if `ptr` or `len` is not page
    /// aligned or `ptr` is null.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// life of the returned region, and the accelerator may write it at any
    /// time while mapped.
    pub unsafe fn borrow(ptr: *mut u8, len: usize) -> Result<Self> {
        if !is_page_aligned(ptr as u64) || len == 0 || !is_page_aligned(len as u64) {
            return Err(VdspError::invalid_argument(format!(
                "user pages {ptr:p}+{len:#x} are not page aligned"
            )));
        }
        let ptr = NonNull::new(ptr).ok_or_else(|| VdspError::invalid_argument("null user pointer"))?;
        let locked = pin(ptr, len);
        Ok(Self {
            ptr,
            bus: bus_range(len),
            len,
            owner: Owner::Borrowed,
            locked,
        })
    }

    /// A page-aligned window into `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if the window is misaligned or
    /// leaves the parent.
    pub fn sub(parent: &Arc<Self>, offset: usize, len: usize) -> Result<Self> {
        if !is_page_aligned(offset as u64) || len == 0 || offset + len > parent.len {
            return Err(VdspError::invalid_argument(format!(
                "window {offset:#x}+{len:#x} outside region of {:#x}",
                parent.len
            )));
        }
        // SAFETY: offset + len <= parent.len, so the pointer stays inside the parent.
        let ptr = unsafe { NonNull::new_unchecked(parent.ptr.as_ptr().add(offset)) };
        Ok(Self {
            ptr,
            bus: parent.bus + offset as u64,
            len,
            owner: Owner::Sub(Arc::clone(parent)),
            locked: false,
        })
    }

    /// Bus address of the first byte.
    pub fn phys(&self) -> u64 {
        self.bus
    }

    /// Host address of the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (never true for a constructed region).
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the pages are locked in memory.
    pub const fn is_pinned(&self) -> bool {
        self.locked
    }

    /// The shareable fd behind the region, if any.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.owner {
            Owner::Mapping(Some(fd)) => Some(fd.as_fd()),
            Owner::Sub(parent) => parent.fd(),
            _ => None,
        }
    }

    /// Bus address of every page.
    pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len.div_ceil(PAGE)).map(move |i| self.phys() + (i * PAGE) as u64)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "unaligned word access at {offset:#x}");
        assert!(offset + 4 <= self.len, "word offset {offset:#x} out of bounds");
        // SAFETY: ptr is page aligned and offset is a multiple of 4, so the address
        // is aligned for AtomicU32. offset + 4 <= len keeps it inside the region,
        // which outlives the returned reference.
        unsafe { AtomicU32::from_ptr(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    /// Read a word with acquire ordering.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or out of bounds.
    pub fn read32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    /// Write a word with release ordering.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or out of bounds.
    pub fn write32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release);
    }

    /// Copy bytes out of the region.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the region.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(
            offset + out.len() <= self.len,
            "read of {:#x} bytes at {offset:#x} out of bounds",
            out.len()
        );
        // SAFETY: source range checked above; destination is a distinct &mut slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Copy `len` bytes out of the region.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the region.
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }

    /// Copy bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the region.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.len,
            "write of {:#x} bytes at {offset:#x} out of bounds",
            data.len()
        );
        // SAFETY: destination range checked above; source is a distinct slice.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Set `len` bytes at `offset` to `byte`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the region.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len, "fill at {offset:#x} out of bounds");
        // SAFETY: range checked above.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len) };
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: the range was locked by pin() and is still mapped.
            let _ = unsafe { munlock(self.ptr.as_ptr().cast(), self.len) };
        }
        match &self.owner {
            Owner::Heap(layout) => {
                // SAFETY: ptr came from alloc_zeroed with this layout; no references
                // outlive the region.
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), *layout) };
            }
            Owner::Mapping(_) => {
                // SAFETY: ptr/len describe the mapping created in the constructor.
                let _ = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) };
            }
            Owner::Borrowed | Owner::Sub(_) => {}
        }
    }
}

/// Registry of every region the accelerator may reach, keyed by bus address.
#[derive(Debug, Default)]
pub struct PhysMemory {
    regions: Mutex<BTreeMap<u64, Weak<DmaRegion>>>,
}

impl PhysMemory {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate zeroed pinned memory and register it.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails.
    pub fn alloc(&self, len: usize) -> Result<Arc<DmaRegion>> {
        Ok(self.register(DmaRegion::alloc(len)?))
    }

    /// Register a region so its bus addresses resolve.
    pub fn register(&self, region: DmaRegion) -> Arc<DmaRegion> {
        let region = Arc::new(region);
        let mut regions = lock(&self.regions);
        regions.retain(|_, r| r.strong_count() > 0);
        regions.insert(region.phys(), Arc::downgrade(&region));
        region
    }

    /// The live region containing `[phys, phys + len)` and the offset into it.
    pub fn resolve(&self, phys: u64, len: usize) -> Option<(Arc<DmaRegion>, usize)> {
        let regions = lock(&self.regions);
        regions
            .range(..=phys)
            .rev()
            .filter_map(|(_, r)| r.upgrade())
            .find(|r| phys + len as u64 <= r.phys() + r.len() as u64)
            .map(|r| {
                let offset = (phys - r.phys()) as usize;
                (r, offset)
            })
    }

    /// Number of live registered regions.
    pub fn live_regions(&self) -> usize {
        lock(&self.regions)
            .values()
            .filter(|r| r.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let region = DmaRegion::alloc(100).unwrap();
        assert_eq!(region.len(), PAGE);
        assert!(is_page_aligned(region.phys()));
        assert!(region.phys() >= BUS_BASE);
        assert!(region.as_ptr() as usize % PAGE == 0);
        assert!(region.to_vec(0, PAGE).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_word_and_byte_access() {
        let region = DmaRegion::alloc(PAGE).unwrap();
        region.write32(8, 0xdead_beef);
        assert_eq!(region.read32(8), 0xdead_beef);
        region.write(16, b"hello");
        assert_eq!(region.to_vec(16, 5), b"hello");
        region.fill(16, 5, 0);
        assert_eq!(region.to_vec(16, 5), [0u8; 5]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_word() {
        let region = DmaRegion::alloc(PAGE).unwrap();
        region.read32(PAGE);
    }

    #[test]
    fn test_memfd_is_shareable() {
        let region = DmaRegion::memfd("vdsp-test", 3 * PAGE).unwrap();
        assert!(region.fd().is_some());
        assert_eq!(region.pages().count(), 3);
    }

    #[test]
    fn test_borrow_rejects_misaligned() {
        let parent = DmaRegion::alloc(2 * PAGE).unwrap();
        // SAFETY: the pointer is inside `parent`, which outlives the call.
        let err = unsafe { DmaRegion::borrow(parent.as_ptr().wrapping_add(8), PAGE) };
        assert!(matches!(err, Err(VdspError::InvalidArgument { .. })));
    }

    #[test]
    fn test_registry_resolves() {
        let phys = PhysMemory::new();
        let a = phys.alloc(2 * PAGE).unwrap();
        let (found, offset) = phys.resolve(a.phys() + 0x1004, 4).unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert_eq!(offset, 0x1004);
        assert!(phys.resolve(a.phys() + 2 * PAGE as u64, 4).is_none());

        let sub = Arc::new(DmaRegion::sub(&a, PAGE, PAGE).unwrap());
        sub.write32(0, 7);
        assert_eq!(a.read32(PAGE), 7);

        let addr = a.phys();
        drop(found);
        drop(sub);
        drop(a);
        assert!(phys.resolve(addr, 4).is_none());
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer manager: heaps, namespaces and buffer lifetimes.
//!
//! Every client owns a namespace. Buffers are allocated into a namespace and
//! identified by a [`BufferId`] from that namespace's id range:
//!
//! ```text
//!   namespace n  →  ids n * per_ns + 1 ..= (n + 1) * per_ns
//! ```
//!
//! Device mappings go through the shared [`IommuTable`], so a buffer mapped
//! twice shares one device address. Destroying a namespace force-unmaps and
//! frees whatever the client left behind.

pub mod buffer;
pub mod heap;

pub use buffer::{BufferAttr, BufferId, BufferInfo, HeapKind, UserMapping};
pub use heap::HeapInfo;

use crate::dma::{DmaRegion, PhysMemory};
use crate::error::{Result, VdspError};
use crate::iommu::{IommuTable, Placement};
use crate::lock;
use buffer::Buffer;
use heap::{Backing, Heap};
use rustix::fd::OwnedFd;
use slab::Slab;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Namespace handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub u32);

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns{}", self.0)
    }
}

/// Byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes allocated now
    pub current: usize,
    /// Highest value of `current` seen
    pub peak: usize,
}

impl MemoryUsage {
    fn add(&mut self, bytes: usize) {
        self.current += bytes;
        self.peak = self.peak.max(self.current);
    }

    fn sub(&mut self, bytes: usize) {
        self.current = self.current.saturating_sub(bytes);
    }
}

/// Outcome of a cache maintenance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSync {
    /// Maintenance was performed
    Performed,
    /// The buffer is not host-cached
    Uncached,
    /// Global cache maintenance is switched off
    Disabled,
}

/// Direction of a cache maintenance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Host writes become visible to the accelerator
    ToDevice,
    /// Accelerator writes become visible to the host
    FromDevice,
}

#[derive(Debug)]
struct Namespace {
    buffers: BTreeMap<BufferId, Buffer>,
    usage: MemoryUsage,
}

#[derive(Debug)]
struct Namespaces {
    slab: Slab<Namespace>,
    total: MemoryUsage,
}

/// Heaps plus per-namespace buffer tables.
#[derive(Debug)]
pub struct BufferManager {
    memory: Arc<PhysMemory>,
    iommu: Arc<IommuTable>,
    heaps: Vec<Heap>,
    per_namespace: u32,
    max_namespaces: usize,
    cache_sync: bool,
    namespaces: Mutex<Namespaces>,
}

impl BufferManager {
    /// Manager with the standard heaps.
    ///
    /// # Errors
    ///
    /// Returns an error if the carveout pool cannot be allocated.
    pub fn new(
        memory: Arc<PhysMemory>,
        iommu: Arc<IommuTable>,
        carveout_size: usize,
        per_namespace: u32,
        max_namespaces: usize,
        cache_sync: bool,
    ) -> Result<Self> {
        let heaps = Heap::standard(&memory, carveout_size)?;
        Ok(Self {
            memory,
            iommu,
            heaps,
            per_namespace,
            max_namespaces,
            cache_sync,
            namespaces: Mutex::new(Namespaces {
                slab: Slab::new(),
                total: MemoryUsage::default(),
            }),
        })
    }

    /// Registered heaps.
    pub fn heaps(&self) -> Vec<HeapInfo> {
        self.heaps
            .iter()
            .zip(0u32..)
            .map(|(h, id)| h.info(id))
            .collect()
    }

    /// Id of the first heap of `kind`.
    pub fn heap_id(&self, kind: HeapKind) -> Option<u32> {
        self.heaps
            .iter()
            .zip(0u32..)
            .find(|(h, _)| h.kind() == kind)
            .map(|(_, id)| id)
    }

    fn heap(&self, id: u32) -> Result<&Heap> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.heaps.get(i))
            .ok_or(VdspError::UnknownHeap { heap: id })
    }

    /// Open a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::ResourceExhausted`] at the namespace limit.
    pub fn create_namespace(&self) -> Result<NamespaceId> {
        let mut ns = lock(&self.namespaces);
        if ns.slab.len() >= self.max_namespaces {
            return Err(VdspError::exhausted("namespaces"));
        }
        let key = ns.slab.insert(Namespace {
            buffers: BTreeMap::new(),
            usage: MemoryUsage::default(),
        });
        let id = u32::try_from(key).map_err(|_| VdspError::exhausted("namespaces"))?;
        debug!("namespace ns{id} created");
        Ok(NamespaceId(id))
    }

    /// Close a namespace, unmapping and freeing every buffer left in it.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for an unknown namespace.
    pub fn destroy_namespace(&self, id: NamespaceId) -> Result<()> {
        let mut guard = lock(&self.namespaces);
        let ns = guard
            .slab
            .try_remove(id.0 as usize)
            .ok_or_else(|| VdspError::invalid_argument(format!("unknown namespace {id}")))?;
        for buffer in ns.buffers.values() {
            if self.iommu.force_unmap(buffer.id).is_some() {
                warn!("{id}: {} still device mapped at teardown", buffer.id);
            }
            warn!("{id}: freeing leftover {} ({} bytes)", buffer.id, buffer.size());
            self.release(buffer);
        }
        guard.total.sub(ns.usage.current);
        debug!("namespace {id} destroyed");
        Ok(())
    }

    /// Number of open namespaces.
    pub fn namespace_count(&self) -> usize {
        lock(&self.namespaces).slab.len()
    }

    /// Allocate a buffer from heap `heap`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown namespace or heap, a full namespace, or
    /// when the heap cannot supply the memory.
    pub fn alloc(&self, ns: NamespaceId, heap: u32, size: usize, attr: BufferAttr) -> Result<BufferId> {
        let h = self.heap(heap)?;
        let backing = h.alloc(&self.memory, size)?;
        self.insert(ns, heap, size, attr, backing)
    }

    /// Import a shared fd into heap `heap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the heap does not import fds or the fd size does
    /// not match `size`.
    pub fn import_fd(
        &self,
        ns: NamespaceId,
        heap: u32,
        fd: OwnedFd,
        size: usize,
        attr: BufferAttr,
    ) -> Result<BufferId> {
        let h = self.heap(heap)?;
        let backing = h.import_fd(&self.memory, fd, size)?;
        self.insert(ns, heap, size, attr, backing)
    }

    /// Import caller-owned pages into heap `heap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the heap does not import user memory or the range
    /// is not page aligned.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of `size` bytes until the
    /// buffer is freed.
    pub unsafe fn import_user(
        &self,
        ns: NamespaceId,
        heap: u32,
        ptr: *mut u8,
        size: usize,
        attr: BufferAttr,
    ) -> Result<BufferId> {
        let h = self.heap(heap)?;
        // SAFETY: forwarded from the caller.
        let backing = unsafe { h.import_user(&self.memory, ptr, size)? };
        self.insert(ns, heap, size, attr, backing)
    }

    fn insert(
        &self,
        ns: NamespaceId,
        heap: u32,
        requested_size: usize,
        attr: BufferAttr,
        backing: Backing,
    ) -> Result<BufferId> {
        let h = self.heap(heap)?;
        let mut guard = lock(&self.namespaces);
        let Some(space) = guard.slab.get_mut(ns.0 as usize) else {
            h.free(&backing);
            return Err(VdspError::invalid_argument(format!("unknown namespace {ns}")));
        };
        let first = ns.0 * self.per_namespace + 1;
        let Some(id) = (first..first + self.per_namespace)
            .map(BufferId)
            .find(|id| !space.buffers.contains_key(id))
        else {
            h.free(&backing);
            return Err(VdspError::exhausted(format!("buffer ids in {ns}")));
        };
        let size = backing.region.len();
        space.buffers.insert(
            id,
            Buffer {
                id,
                heap,
                kind: h.kind(),
                requested_size,
                attr,
                region: backing.region,
                paddr: backing.paddr,
                device_addr: None,
                kernel_maps: 0,
                user_maps: 0,
            },
        );
        space.usage.add(size);
        guard.total.add(size);
        debug!("{ns}: {id} allocated, {size:#x} bytes from {} heap", h.kind());
        Ok(id)
    }

    /// Free a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::StillMapped`] while the buffer is device mapped and
    /// [`VdspError::UnknownBuffer`] if it is not in `ns`.
    pub fn free(&self, ns: NamespaceId, id: BufferId) -> Result<()> {
        let mut guard = lock(&self.namespaces);
        let space = namespace(&mut guard.slab, ns)?;
        if !space.buffers.contains_key(&id) {
            return Err(VdspError::UnknownBuffer { buffer: id.0 });
        }
        if self.iommu.is_mapped(id) {
            error!("{ns}: free of {id} while device mapped");
            return Err(VdspError::StillMapped { buffer: id.0 });
        }
        let Some(buffer) = space.buffers.remove(&id) else {
            return Err(VdspError::UnknownBuffer { buffer: id.0 });
        };
        if buffer.user_maps > 0 || buffer.kernel_maps > 0 {
            warn!(
                "{ns}: {id} freed with {} user and {} kernel mappings",
                buffer.user_maps, buffer.kernel_maps
            );
        }
        let size = buffer.size();
        space.usage.sub(size);
        guard.total.sub(size);
        self.release(&buffer);
        debug!("{ns}: {id} freed");
        Ok(())
    }

    fn release(&self, buffer: &Buffer) {
        if let Ok(h) = self.heap(buffer.heap) {
            h.free(&Backing {
                region: Arc::clone(&buffer.region),
                paddr: buffer.paddr,
            });
        }
    }

    fn with_buffer<T>(
        &self,
        ns: NamespaceId,
        id: BufferId,
        f: impl FnOnce(&mut Buffer) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.namespaces);
        let space = namespace(&mut guard.slab, ns)?;
        let buffer = space
            .buffers
            .get_mut(&id)
            .ok_or(VdspError::UnknownBuffer { buffer: id.0 })?;
        f(buffer)
    }

    /// Map a buffer for the accelerator and return its device address.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is unknown or the IOMMU table is full.
    pub fn map_device(&self, ns: NamespaceId, id: BufferId) -> Result<u64> {
        self.map_device_at(ns, id, Placement::Any)
    }

    /// [`Self::map_device`] with an explicit placement.
    ///
    /// # Errors
    ///
    /// As [`Self::map_device`], plus placement conflicts.
    pub fn map_device_at(&self, ns: NamespaceId, id: BufferId, placement: Placement) -> Result<u64> {
        self.with_buffer(ns, id, |buffer| {
            let addr = self.iommu.map(id, &buffer.scatter(), placement)?;
            buffer.device_addr = Some(addr);
            Ok(addr)
        })
    }

    /// Drop one device mapping reference.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::NotMapped`] if the buffer has no mapping.
    pub fn unmap_device(&self, ns: NamespaceId, id: BufferId) -> Result<()> {
        self.with_buffer(ns, id, |buffer| {
            if self.iommu.unmap(id)? == 0 {
                buffer.device_addr = None;
            }
            Ok(())
        })
    }

    /// Device address of a mapped buffer.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::NotMapped`] if the buffer has no mapping.
    pub fn device_addr(&self, ns: NamespaceId, id: BufferId) -> Result<u64> {
        self.with_buffer(ns, id, |buffer| {
            buffer
                .device_addr
                .ok_or(VdspError::NotMapped { buffer: id.0 })
        })
    }

    /// Give the driver a host mapping of the buffer. Mappings are counted;
    /// each one needs its own [`Self::unmap_kernel`].
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownBuffer`] if the buffer is not in `ns`.
    pub fn map_kernel(&self, ns: NamespaceId, id: BufferId) -> Result<UserMapping> {
        self.with_buffer(ns, id, |buffer| {
            buffer.kernel_maps += 1;
            Ok(UserMapping::new(id, Arc::clone(&buffer.region), buffer.size()))
        })
    }

    /// Drop one of the driver's host mappings.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::NotMapped`] if there is none.
    pub fn unmap_kernel(&self, ns: NamespaceId, id: BufferId) -> Result<()> {
        self.with_buffer(ns, id, |buffer| {
            if buffer.kernel_maps == 0 {
                return Err(VdspError::NotMapped { buffer: id.0 });
            }
            buffer.kernel_maps -= 1;
            Ok(())
        })
    }

    /// Map the buffer into the client.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownBuffer`] if the buffer is not in `ns`.
    pub fn map_user(&self, ns: NamespaceId, id: BufferId) -> Result<UserMapping> {
        self.with_buffer(ns, id, |buffer| {
            buffer.user_maps += 1;
            Ok(UserMapping::new(
                id,
                Arc::clone(&buffer.region),
                buffer.requested_size.min(buffer.size()),
            ))
        })
    }

    /// Drop one client mapping.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::NotMapped`] if the buffer has no user mapping.
    pub fn unmap_user(&self, ns: NamespaceId, id: BufferId) -> Result<()> {
        self.with_buffer(ns, id, |buffer| {
            if buffer.user_maps == 0 {
                return Err(VdspError::NotMapped { buffer: id.0 });
            }
            buffer.user_maps -= 1;
            Ok(())
        })
    }

    /// Cache maintenance around device access.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownBuffer`] if the buffer is not in `ns`.
    pub fn sync(&self, ns: NamespaceId, id: BufferId, direction: SyncDirection) -> Result<CacheSync> {
        self.with_buffer(ns, id, |buffer| {
            if !buffer.attr.is_cached() {
                debug!("{id}: uncached, no sync needed");
                return Ok(CacheSync::Uncached);
            }
            if !self.cache_sync {
                warn!("{id}: cache sync {direction:?} skipped, disabled globally");
                return Ok(CacheSync::Disabled);
            }
            match direction {
                SyncDirection::ToDevice => fence(Ordering::Release),
                SyncDirection::FromDevice => fence(Ordering::Acquire),
            }
            Ok(CacheSync::Performed)
        })
    }

    /// Page-granular (bus address, length) runs.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownBuffer`] if the buffer is not in `ns`.
    pub fn scatter_list(&self, ns: NamespaceId, id: BufferId) -> Result<Vec<(u64, u64)>> {
        self.with_buffer(ns, id, |buffer| Ok(buffer.scatter()))
    }

    /// Bus address of every page.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownBuffer`] if the buffer is not in `ns`.
    pub fn page_array(&self, ns: NamespaceId, id: BufferId) -> Result<Vec<u64>> {
        self.with_buffer(ns, id, |buffer| Ok(buffer.region.pages().collect()))
    }

    /// Export the buffer as a shareable fd.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] if its heap cannot export.
    pub fn export(&self, ns: NamespaceId, id: BufferId) -> Result<OwnedFd> {
        self.with_buffer(ns, id, |buffer| self.heap(buffer.heap)?.export(&buffer.region))
    }

    /// Attribute snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownBuffer`] if the buffer is not in `ns`.
    pub fn info(&self, ns: NamespaceId, id: BufferId) -> Result<BufferInfo> {
        self.with_buffer(ns, id, |buffer| Ok(buffer.info()))
    }

    /// Host memory of a buffer, for driver-side copies.
    pub(crate) fn region(&self, ns: NamespaceId, id: BufferId) -> Result<Arc<DmaRegion>> {
        self.with_buffer(ns, id, |buffer| Ok(Arc::clone(&buffer.region)))
    }

    /// Bytes held by `ns`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for an unknown namespace.
    pub fn usage(&self, ns: NamespaceId) -> Result<MemoryUsage> {
        let mut guard = lock(&self.namespaces);
        Ok(namespace(&mut guard.slab, ns)?.usage)
    }

    /// Bytes held across all namespaces.
    pub fn total_usage(&self) -> MemoryUsage {
        lock(&self.namespaces).total
    }

    /// Live buffers in `ns`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::InvalidArgument`] for an unknown namespace.
    pub fn buffers(&self, ns: NamespaceId) -> Result<Vec<BufferId>> {
        let mut guard = lock(&self.namespaces);
        Ok(namespace(&mut guard.slab, ns)?.buffers.keys().copied().collect())
    }
}

fn namespace(slab: &mut Slab<Namespace>, ns: NamespaceId) -> Result<&mut Namespace> {
    slab.get_mut(ns.0 as usize)
        .ok_or_else(|| VdspError::invalid_argument(format!("unknown namespace {ns}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VdspConfig;
    use crate::platform::Accelerator;
    use crate::sim::SimulatedDsp;

    fn manager(per_namespace: u32, max_namespaces: usize) -> BufferManager {
        let config = VdspConfig::default()
            .with_iova_window(0x8000_0000, 1 << 20)
            .with_firmware_region_size(0x10000);
        let memory = Arc::new(PhysMemory::new());
        let accel: Arc<dyn Accelerator> = Arc::new(SimulatedDsp::new());
        let iommu = Arc::new(IommuTable::new(&config, &memory, accel).unwrap());
        BufferManager::new(memory, iommu, 0, per_namespace, max_namespaces, true).unwrap()
    }

    #[test]
    fn test_ids_come_from_the_namespace_range() {
        let m = manager(4, 3);
        let a = m.create_namespace().unwrap();
        let b = m.create_namespace().unwrap();
        let id_a = m.alloc(a, 0, 100, BufferAttr::default()).unwrap();
        let id_b = m.alloc(b, 0, 100, BufferAttr::default()).unwrap();
        assert_eq!(id_a, BufferId(a.0 * 4 + 1));
        assert_eq!(id_b, BufferId(b.0 * 4 + 1));
        assert!(matches!(m.info(b, id_a), Err(VdspError::UnknownBuffer { .. })));

        m.free(a, id_a).unwrap();
        assert_eq!(m.alloc(a, 0, 100, BufferAttr::default()).unwrap(), id_a);
    }

    #[test]
    fn test_kernel_mappings_are_counted() {
        let m = manager(4, 3);
        let ns = m.create_namespace().unwrap();
        let id = m.alloc(ns, 0, 4096, BufferAttr::default()).unwrap();

        let first = m.map_kernel(ns, id).unwrap();
        let second = m.map_kernel(ns, id).unwrap();
        assert_eq!(m.info(ns, id).unwrap().kernel_maps, 2);

        m.unmap_kernel(ns, id).unwrap();
        assert_eq!(m.info(ns, id).unwrap().kernel_maps, 1, "other holder still mapped");
        first.write(0, b"held").unwrap();
        assert_eq!(second.read(0, 4).unwrap(), b"held");

        m.unmap_kernel(ns, id).unwrap();
        assert!(matches!(m.unmap_kernel(ns, id), Err(VdspError::NotMapped { .. })));
    }

    #[test]
    fn test_usage_tracks_pages() {
        let m = manager(4, 3);
        let ns = m.create_namespace().unwrap();
        let a = m.alloc(ns, 0, 1, BufferAttr::default()).unwrap();
        let b = m.alloc(ns, 2, 4097, BufferAttr::default()).unwrap();
        assert_eq!(m.usage(ns).unwrap().current, 3 * 4096);
        m.free(ns, a).unwrap();
        m.free(ns, b).unwrap();
        let usage = m.usage(ns).unwrap();
        assert_eq!((usage.current, usage.peak), (0, 3 * 4096));
        assert_eq!(m.total_usage().current, 0);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let m = manager(4, 1);
        let ns = m.create_namespace().unwrap();
        assert!(m.create_namespace().is_err());
        let id = m.alloc(ns, 0, 4096, BufferAttr::default()).unwrap();
        m.map_device(ns, id).unwrap();
        m.map_device(ns, id).unwrap();

        m.destroy_namespace(ns).unwrap();
        assert_eq!(m.namespace_count(), 0);
        assert_eq!(m.total_usage().current, 0);
        assert!(m.buffers(ns).is_err());
        assert!(m.destroy_namespace(ns).is_err());

        let again = m.create_namespace().unwrap();
        assert!(m.buffers(again).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_heap() {
        let m = manager(4, 1);
        let ns = m.create_namespace().unwrap();
        assert!(matches!(
            m.alloc(ns, 7, 4096, BufferAttr::default()),
            Err(VdspError::UnknownHeap { heap: 7 })
        ));
        assert_eq!(m.heap_id(HeapKind::Carveout), None);
        assert_eq!(m.heap_id(HeapKind::Anonymous), Some(2));
    }
}

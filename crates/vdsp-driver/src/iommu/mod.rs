// SPDX-License-Identifier: AGPL-3.0-only

//! IOMMU device table.
//!
//! Every IOMMU unit translates the same IOVA window through its own flat page
//! table: one 32-bit entry per page, holding the physical page number or
//! [`PTE_INVALID`]. A mapping is programmed into all units; a unit is switched
//! on with its first mapping and off when its last one goes away.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`IovaAllocator`] | hands out device address ranges |
//! | [`MappingRecord`] | buffer → address, reference counted |
//! | page tables | one [`DmaRegion`] per unit |
//!
//! All of it sits behind one mutex, taken after the queue and buffer locks.

// Page indices fit usize on every supported target
#![allow(clippy::cast_possible_truncation)]

pub mod iova;
pub mod record;

pub use iova::IovaAllocator;
pub use record::{MappingRecord, RecordEntry};

use crate::config::VdspConfig;
use crate::dma::{DmaRegion, PhysMemory};
use crate::error::{Result, VdspError};
use crate::lock;
use crate::mem::BufferId;
use crate::platform::{Accelerator, IommuProgram};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use vdsp_chip::iommu::{
    entry_index, is_page_aligned, page_align, page_table_bytes, pte_for, translate, PAGE_SIZE,
    PTE_INVALID, PTE_SIZE,
};

/// Where a new mapping goes in the IOVA window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Anywhere free
    Any,
    /// At this offset from the window base
    Offset(u64),
    /// At this device address
    Fixed(u64),
}

/// IOVA and record occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuUsage {
    /// Bytes of IOVA allocated, reserved extents included
    pub iova_used: u64,
    /// Live record entries
    pub records: usize,
    /// Record slots
    pub record_capacity: usize,
}

#[derive(Debug)]
struct Unit {
    name: String,
    version: u32,
    table: Arc<DmaRegion>,
    mappings: usize,
}

#[derive(Debug)]
struct Table {
    iova: IovaAllocator,
    record: MappingRecord,
    units: Vec<Unit>,
}

/// Device address space shared by all IOMMU units.
#[derive(Debug)]
pub struct IommuTable {
    base: u64,
    size: u64,
    accel: Arc<dyn Accelerator>,
    inner: Mutex<Table>,
}

impl IommuTable {
    /// Build page tables for every configured unit and carve out the reserved
    /// extents.
    ///
    /// # Errors
    ///
    /// Returns an error if the window is invalid, a reserved extent does not
    /// fit, or page-table memory cannot be allocated.
    pub fn new(
        config: &VdspConfig,
        memory: &PhysMemory,
        accel: Arc<dyn Accelerator>,
    ) -> Result<Self> {
        let mut iova = IovaAllocator::new(config.iova_base, config.iova_size)?;
        iova.reserve_init(&config.reserved_extents())?;

        let bytes = page_table_bytes(config.iova_size);
        let units = config
            .iommus
            .iter()
            .map(|unit| {
                let table = memory.alloc(bytes)?;
                table.fill(0, table.len(), 0xff);
                Ok(Unit {
                    name: unit.name.clone(),
                    version: unit.version,
                    table,
                    mappings: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "IOMMU window {:#x}+{:#x}, {} unit(s), {} record slots",
            config.iova_base,
            config.iova_size,
            units.len(),
            config.record_capacity
        );
        Ok(Self {
            base: config.iova_base,
            size: config.iova_size,
            accel,
            inner: Mutex::new(Table {
                iova,
                record: MappingRecord::new(config.record_capacity),
                units,
            }),
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

    /// Map `scatter` for `buffer`, or take another reference to its existing
    /// mapping. Returns the device address.
    ///
    /// `scatter` is a list of page-aligned (bus address, length) runs.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::ResourceExhausted`] when the record or IOVA space
    /// is full, and an error if a unit refuses to switch on. Nothing stays
    /// allocated or programmed on failure.
    pub fn map(&self, buffer: BufferId, scatter: &[(u64, u64)], placement: Placement) -> Result<u64> {
        let mut t = lock(&self.inner);
        if let Some(addr) = t.record.map_check(buffer) {
            debug!("{buffer} already mapped at {addr:#x}");
            return Ok(addr);
        }
        if t.record.is_full() {
            error!(
                "mapping record full ({} slots), cannot map {buffer}",
                t.record.capacity()
            );
            return Err(VdspError::exhausted("mapping record slots"));
        }
        if scatter.is_empty()
            || scatter
                .iter()
                .any(|&(phys, len)| !is_page_aligned(phys) || len == 0)
        {
            return Err(VdspError::invalid_argument(format!(
                "scatter list of {buffer} is empty or not page aligned"
            )));
        }
        let size = page_align(scatter.iter().map(|&(_, len)| len).sum());

        let addr = match placement {
            Placement::Any => t.iova.alloc(size)?,
            Placement::Offset(off) => {
                let addr = self.base + off;
                t.iova.alloc_fixed(addr, size)?;
                addr
            }
            Placement::Fixed(addr) => {
                t.iova.alloc_fixed(addr, size)?;
                addr
            }
        };

        if let Err(e) = self.program(&mut t, addr, scatter) {
            if let Err(free) = t.iova.free(addr, size) {
                warn!("leaking IOVA {addr:#x}+{size:#x} after failed map: {free}");
            }
            return Err(e);
        }
        if let Err(e) = t.record.insert(buffer, addr, size) {
            self.release(&mut t, addr, size);
            return Err(e);
        }
        debug!("mapped {buffer} at {addr:#x}+{size:#x}");
        Ok(addr)
    }

    /// Drop one reference to `buffer`'s mapping and return the references
    /// left. The translation goes away with the last one.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::NotMapped`] if `buffer` has no mapping.
    pub fn unmap(&self, buffer: BufferId) -> Result<u32> {
        let mut t = lock(&self.inner);
        let addr = t
            .record
            .addr_of(buffer)
            .ok_or(VdspError::NotMapped { buffer: buffer.0 })?;
        let entry = t
            .record
            .remove(addr)
            .ok_or(VdspError::NotMapped { buffer: buffer.0 })?;
        if entry.refs == 0 {
            self.release(&mut t, entry.addr, entry.size);
            debug!("unmapped {buffer} from {addr:#x}");
        }
        Ok(entry.refs)
    }

    /// Tear down `buffer`'s mapping whatever its reference count. Returns the
    /// address it was mapped at.
    pub fn force_unmap(&self, buffer: BufferId) -> Option<u64> {
        let mut t = lock(&self.inner);
        let entry = t.record.force_remove(buffer)?;
        if entry.refs > 1 {
            warn!("{buffer} force-unmapped with {} references", entry.refs);
        }
        self.release(&mut t, entry.addr, entry.size);
        Some(entry.addr)
    }

    /// Whether `buffer` is mapped.
    pub fn is_mapped(&self, buffer: BufferId) -> bool {
        lock(&self.inner).record.unmap_check(buffer)
    }

    /// Device address of `buffer`.
    pub fn addr_of(&self, buffer: BufferId) -> Option<u64> {
        lock(&self.inner).record.addr_of(buffer)
    }

    /// Mapping of `buffer`.
    pub fn entry(&self, buffer: BufferId) -> Option<RecordEntry> {
        lock(&self.inner).record.find(buffer).copied()
    }

    /// Buffer mapped at `addr`.
    pub fn buffer_at(&self, addr: u64) -> Option<BufferId> {
        lock(&self.inner).record.buffer_of(addr)
    }

    /// Bus address `iova` translates to through the first unit.
    pub fn translate(&self, iova: u64) -> Option<u64> {
        if iova < self.base || iova >= self.base + self.size {
            return None;
        }
        let t = lock(&self.inner);
        let unit = t.units.first()?;
        let pte = unit.table.read32(entry_index(self.base, iova) * PTE_SIZE);
        translate(pte, iova)
    }

    /// Device address and size of a reserved extent.
    pub fn reserved(&self, name: &str) -> Option<(u64, u64)> {
        lock(&self.inner).iova.reserved(name)
    }

    /// Whether unit `unit` is switched on.
    pub fn is_enabled(&self, unit: usize) -> bool {
        lock(&self.inner)
            .units
            .get(unit)
            .is_some_and(|u| u.mappings > 0)
    }

    /// Occupancy counters.
    pub fn usage(&self) -> IommuUsage {
        let t = lock(&self.inner);
        IommuUsage {
            iova_used: t.iova.used(),
            records: t.record.len(),
            record_capacity: t.record.capacity(),
        }
    }

    /// Human-readable table of live mappings.
    pub fn dump(&self) -> String {
        lock(&self.inner).record.dump()
    }

    /// Return the reserved extents to the pool, ahead of teardown.
    pub fn release_reserved(&self) {
        lock(&self.inner).iova.reserve_release();
    }

    fn program_for(&self, unit: &Unit) -> IommuProgram {
        IommuProgram {
            name: unit.name.clone(),
            version: unit.version,
            page_table: unit.table.phys(),
            iova_base: self.base,
            iova_size: self.size,
        }
    }

    /// Write entries for `scatter` at `addr` in every unit, switching units
    /// on as needed. On failure every unit is left as it was.
    fn program(&self, t: &mut Table, addr: u64, scatter: &[(u64, u64)]) -> Result<()> {
        let mut ptes = Vec::new();
        for &(phys, len) in scatter {
            for page in (0..page_align(len)).step_by(PAGE_SIZE as usize) {
                ptes.push(pte_for(phys + page).ok_or_else(|| {
                    VdspError::invalid_argument(format!(
                        "bus address {:#x} has no page-table encoding",
                        phys + page
                    ))
                })?);
            }
        }
        let first = entry_index(self.base, addr);

        for index in 0..t.units.len() {
            let unit = &mut t.units[index];
            for (i, &pte) in ptes.iter().enumerate() {
                unit.table.write32((first + i) * PTE_SIZE, pte);
            }
            if unit.mappings == 0 {
                let program = self.program_for(unit);
                if let Err(e) = self.accel.iommu_enable(index, &program) {
                    error!("IOMMU {} failed to enable: {e}", unit.name);
                    let size = ptes.len() as u64 * PAGE_SIZE;
                    self.clear(t, addr, size, index + 1, index);
                    return Err(e);
                }
                debug!("IOMMU {} enabled", unit.name);
            }
            unit.mappings += 1;
        }
        Ok(())
    }

    /// Invalidate `[addr, addr + size)` in the first `units` units and drop
    /// the mapping count of the first `counted` of them, switching off units
    /// left without mappings.
    fn clear(&self, t: &mut Table, addr: u64, size: u64, units: usize, counted: usize) {
        let first = entry_index(self.base, addr);
        let pages = (size / PAGE_SIZE) as usize;
        for (index, unit) in t.units.iter_mut().take(units).enumerate() {
            for i in first..first + pages {
                unit.table.write32(i * PTE_SIZE, PTE_INVALID);
            }
            if index >= counted {
                continue;
            }
            unit.mappings -= 1;
            if unit.mappings == 0 {
                self.accel.iommu_disable(index);
                debug!("IOMMU {} disabled", unit.name);
            }
        }
    }

    fn release(&self, t: &mut Table, addr: u64, size: u64) {
        let units = t.units.len();
        self.clear(t, addr, size, units, units);
        if let Err(e) = t.iova.free(addr, size) {
            error!("IOVA release of {addr:#x}+{size:#x}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IommuInstanceConfig;
    use crate::sim::SimulatedDsp;

    const BASE: u64 = 0x8000_0000;

    fn table(units: usize, records: usize) -> (Arc<SimulatedDsp>, PhysMemory, IommuTable) {
        let config = VdspConfig::default()
            .with_iova_window(BASE, 1 << 20)
            .with_firmware_region_size(0x10000)
            .with_record_capacity(records)
            .with_iommus(
                (0..units)
                    .map(|i| IommuInstanceConfig {
                        name: format!("vau{i}"),
                        version: 12,
                    })
                    .collect(),
            );
        let sim = Arc::new(SimulatedDsp::new());
        let memory = PhysMemory::new();
        let iommu = IommuTable::new(&config, &memory, Arc::clone(&sim) as Arc<dyn Accelerator>)
            .unwrap();
        (sim, memory, iommu)
    }

    fn scatter(memory: &PhysMemory, pages: usize) -> Vec<(u64, u64)> {
        let region = memory.alloc(pages * PAGE_SIZE as usize).unwrap();
        vec![(region.phys(), region.len() as u64)]
    }

    #[test]
    fn test_every_unit_sees_the_mapping() {
        let (sim, memory, iommu) = table(2, 8);
        let pages = scatter(&memory, 2);
        let addr = iommu.map(BufferId(1), &pages, Placement::Any).unwrap();
        assert!(addr >= BASE + 0x10000, "reserved extent is skipped");
        assert!(sim.iommu_enabled(0) && sim.iommu_enabled(1));
        assert_eq!(iommu.translate(addr + PAGE_SIZE + 3), Some(pages[0].0 + PAGE_SIZE + 3));

        assert_eq!(iommu.unmap(BufferId(1)).unwrap(), 0);
        assert_eq!(iommu.translate(addr), None);
        assert!(!sim.iommu_enabled(0) && !sim.iommu_enabled(1));
        assert_eq!(iommu.usage().iova_used, 0x10000);
    }

    #[test]
    fn test_repeat_map_shares_the_address() {
        let (_sim, memory, iommu) = table(1, 8);
        let pages = scatter(&memory, 1);
        let a = iommu.map(BufferId(4), &pages, Placement::Any).unwrap();
        let b = iommu.map(BufferId(4), &pages, Placement::Any).unwrap();
        assert_eq!(a, b);
        assert_eq!(iommu.entry(BufferId(4)).unwrap().refs, 2);
        assert_eq!(iommu.buffer_at(a), Some(BufferId(4)));

        assert_eq!(iommu.unmap(BufferId(4)).unwrap(), 1);
        assert!(iommu.is_mapped(BufferId(4)));
        assert_eq!(iommu.unmap(BufferId(4)).unwrap(), 0);
        assert!(matches!(
            iommu.unmap(BufferId(4)),
            Err(VdspError::NotMapped { buffer: 4 })
        ));
    }

    #[test]
    fn test_full_record_leaves_nothing_behind() {
        let (_sim, memory, iommu) = table(1, 1);
        iommu.map(BufferId(1), &scatter(&memory, 1), Placement::Any).unwrap();
        let before = iommu.usage();
        assert!(matches!(
            iommu.map(BufferId(2), &scatter(&memory, 1), Placement::Any),
            Err(VdspError::ResourceExhausted { .. })
        ));
        assert_eq!(iommu.usage(), before);
    }

    #[test]
    fn test_fixed_placement() {
        let (_sim, memory, iommu) = table(1, 8);
        let at = BASE + 0x40000;
        let addr = iommu
            .map(BufferId(1), &scatter(&memory, 2), Placement::Fixed(at))
            .unwrap();
        assert_eq!(addr, at);
        assert!(iommu
            .map(BufferId(2), &scatter(&memory, 1), Placement::Offset(0x41000))
            .is_err());
        assert!(iommu.addr_of(BufferId(2)).is_none());
    }

    #[test]
    fn test_bad_scatter_is_rejected() {
        let (_sim, memory, iommu) = table(1, 8);
        let (phys, _) = scatter(&memory, 1)[0];
        assert!(iommu.map(BufferId(1), &[], Placement::Any).is_err());
        assert!(iommu.map(BufferId(1), &[(phys + 8, 4096)], Placement::Any).is_err());
        assert_eq!(iommu.usage().records, 0);
    }

    #[test]
    fn test_failed_programming_returns_the_iova() {
        let (sim, memory, iommu) = table(1, 8);
        let before = iommu.usage();
        let unencodable = [(u64::MAX & !(PAGE_SIZE - 1), PAGE_SIZE)];
        assert!(matches!(
            iommu.map(BufferId(3), &unencodable, Placement::Any),
            Err(VdspError::InvalidArgument { .. })
        ));
        assert_eq!(iommu.usage(), before);
        assert!(!sim.iommu_enabled(0));

        let addr = iommu.map(BufferId(3), &scatter(&memory, 1), Placement::Any).unwrap();
        assert_eq!(addr, BASE + 0x10000, "first free extent is reused");
    }

    #[test]
    fn test_force_unmap_ignores_references() {
        let (sim, memory, iommu) = table(1, 8);
        let pages = scatter(&memory, 1);
        let addr = iommu.map(BufferId(9), &pages, Placement::Any).unwrap();
        iommu.map(BufferId(9), &pages, Placement::Any).unwrap();
        assert_eq!(iommu.force_unmap(BufferId(9)), Some(addr));
        assert!(!iommu.is_mapped(BufferId(9)));
        assert!(!sim.iommu_enabled(0));
        assert_eq!(iommu.force_unmap(BufferId(9)), None);
    }
}

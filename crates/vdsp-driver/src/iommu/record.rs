// SPDX-License-Identifier: AGPL-3.0-only

//! Mapping record: buffer identity to device address, with reference counts.
//!
//! The table has a fixed number of slots chosen at init and never grows. A
//! buffer has at most one live entry; mapping it again only bumps the count.

use crate::error::{Result, VdspError};
use crate::mem::BufferId;
use std::fmt::Write as _;
use tracing::{debug, error};

/// One live mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordEntry {
    /// Mapped buffer
    pub buffer: BufferId,
    /// Device address
    pub addr: u64,
    /// Mapped size
    pub size: u64,
    /// Outstanding maps
    pub refs: u32,
}

/// Fixed-size mapping table.
#[derive(Debug)]
pub struct MappingRecord {
    slots: Vec<Option<RecordEntry>>,
}

impl MappingRecord {
    /// Table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Whether no mapping is live.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Whether every slot is taken.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Record a new mapping with one reference.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::ResourceExhausted`] when every slot is taken and
    /// [`VdspError::InvalidArgument`] if the buffer already has an entry.
    pub fn insert(&mut self, buffer: BufferId, addr: u64, size: u64) -> Result<()> {
        if self.find(buffer).is_some() {
            return Err(VdspError::invalid_argument(format!(
                "buffer {buffer} already recorded"
            )));
        }
        let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) else {
            error!(
                "mapping record full ({} slots), raise record_capacity",
                self.slots.len()
            );
            return Err(VdspError::exhausted("mapping record slots"));
        };
        *slot = Some(RecordEntry {
            buffer,
            addr,
            size,
            refs: 1,
        });
        debug!("record insert {buffer} -> {addr:#x}+{size:#x}");
        Ok(())
    }

    /// Drop one reference to the mapping at `addr`.
    ///
    /// Returns the entry as it stands after the decrement; `refs == 0` means
    /// the slot was freed.
    pub fn remove(&mut self, addr: u64) -> Option<RecordEntry> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_some_and(|e| e.addr == addr))?;
        let mut entry = slot.take()?;
        entry.refs -= 1;
        if entry.refs > 0 {
            *slot = Some(entry);
        }
        debug!("record remove {addr:#x}, {} refs left", entry.refs);
        Some(entry)
    }

    /// Drop the entry for `buffer` regardless of its count.
    pub fn force_remove(&mut self, buffer: BufferId) -> Option<RecordEntry> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_some_and(|e| e.buffer == buffer))?;
        slot.take()
    }

    /// Device address of `buffer`, taking a reference when found.
    pub fn map_check(&mut self, buffer: BufferId) -> Option<u64> {
        let entry = self.slots.iter_mut().flatten().find(|e| e.buffer == buffer)?;
        entry.refs += 1;
        Some(entry.addr)
    }

    /// Whether `buffer` has an entry.
    pub fn unmap_check(&self, buffer: BufferId) -> bool {
        self.find(buffer).is_some()
    }

    /// Buffer mapped at `addr`.
    pub fn buffer_of(&self, addr: u64) -> Option<BufferId> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.addr == addr)
            .map(|e| e.buffer)
    }

    /// Device address of `buffer`.
    pub fn addr_of(&self, buffer: BufferId) -> Option<u64> {
        self.find(buffer).map(|e| e.addr)
    }

    /// Entry for `buffer`.
    pub fn find(&self, buffer: BufferId) -> Option<&RecordEntry> {
        self.slots.iter().flatten().find(|e| e.buffer == buffer)
    }

    /// One line per live slot.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, e) in self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|e| (i, e)))
        {
            let _ = writeln!(
                out,
                "[{i:4}] buffer {} iova {:#010x} size {:#x} refs {}",
                e.buffer, e.addr, e.size, e.refs
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_counts_references() {
        let mut rec = MappingRecord::new(4);
        let b = BufferId(7);
        assert_eq!(rec.map_check(b), None);
        rec.insert(b, 0x8000_1000, 0x1000).unwrap();
        assert_eq!(rec.map_check(b), Some(0x8000_1000));
        assert_eq!(rec.find(b).unwrap().refs, 2);
        assert_eq!(rec.len(), 1);

        assert_eq!(rec.remove(0x8000_1000).unwrap().refs, 1);
        assert!(rec.unmap_check(b));
        assert_eq!(rec.remove(0x8000_1000).unwrap().refs, 0);
        assert!(!rec.unmap_check(b));
        assert!(rec.remove(0x8000_1000).is_none());
    }

    #[test]
    fn test_full_table() {
        let mut rec = MappingRecord::new(2);
        rec.insert(BufferId(1), 0x1000, 0x1000).unwrap();
        rec.insert(BufferId(2), 0x2000, 0x1000).unwrap();
        assert!(rec.is_full());
        assert!(matches!(
            rec.insert(BufferId(3), 0x3000, 0x1000),
            Err(VdspError::ResourceExhausted { .. })
        ));
        assert!(rec.insert(BufferId(1), 0x4000, 0x1000).is_err());
    }

    #[test]
    fn test_reverse_lookups_and_dump() {
        let mut rec = MappingRecord::new(8);
        rec.insert(BufferId(3), 0x8000_0000, 0x2000).unwrap();
        assert_eq!(rec.buffer_of(0x8000_0000), Some(BufferId(3)));
        assert_eq!(rec.addr_of(BufferId(3)), Some(0x8000_0000));
        assert!(rec.dump().contains("iova 0x80000000"));
        assert_eq!(rec.force_remove(BufferId(3)).unwrap().refs, 1);
        assert!(rec.is_empty());
    }
}

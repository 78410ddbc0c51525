// SPDX-License-Identifier: AGPL-3.0-only

//! IOMMU page-table format.
//!
//! One u32 entry per 4 KiB page of IOVA space. An entry holds the physical page
//! number; `0xffff_ffff` marks an unmapped page.

/// Page shift.
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mask of the in-page offset.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Bytes per page-table entry.
pub const PTE_SIZE: usize = 4;
/// Entry value for unmapped pages.
pub const PTE_INVALID: u32 = 0xffff_ffff;

/// Page-table version assumed when none is configured.
pub const DEFAULT_VERSION: u32 = 12;

/// Round `size` up to a whole number of pages.
#[must_use]
pub const fn page_align(size: u64) -> u64 {
    (size + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK
}

/// Whether `addr` sits on a page boundary.
#[must_use]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

/// Number of pages covering `size` bytes.
#[must_use]
pub const fn page_count(size: u64) -> u64 {
    page_align(size) >> PAGE_SHIFT
}

/// Number of entries for an IOVA window of `iova_size` bytes.
#[must_use]
pub const fn entry_count(iova_size: u64) -> usize {
    (iova_size >> PAGE_SHIFT) as usize
}

/// Page-table size in bytes for an IOVA window of `iova_size` bytes.
#[must_use]
pub const fn page_table_bytes(iova_size: u64) -> usize {
    entry_count(iova_size) * PTE_SIZE
}

/// Entry for the page at physical address `phys`.
///
/// Returns `None` if the page number does not fit an entry or collides with
/// the invalid marker.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn pte_for(phys: u64) -> Option<u32> {
    let ppn = phys >> PAGE_SHIFT;
    if ppn >= PTE_INVALID as u64 {
        None
    } else {
        Some(ppn as u32)
    }
}

/// Physical address that `iova` resolves to through `pte`.
#[must_use]
pub const fn translate(pte: u32, iova: u64) -> Option<u64> {
    if pte == PTE_INVALID {
        None
    } else {
        Some(((pte as u64) << PAGE_SHIFT) | (iova & PAGE_OFFSET_MASK))
    }
}

/// Index of the entry covering `iova` in a table starting at `base`.
#[must_use]
pub const fn entry_index(base: u64, iova: u64) -> usize {
    ((iova - base) >> PAGE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_arithmetic() {
        assert_eq!(page_align(1), PAGE_SIZE);
        assert_eq!(page_align(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_count(PAGE_SIZE + 1), 2);
        assert!(is_page_aligned(0x8000_0000));
        assert!(!is_page_aligned(0x8000_0010));
    }

    #[test]
    fn test_table_size() {
        // 256 MiB window -> 65536 entries -> 256 KiB of table
        assert_eq!(entry_count(256 << 20), 65_536);
        assert_eq!(page_table_bytes(256 << 20), 256 << 10);
    }

    #[test]
    fn test_translate() {
        let pte = pte_for(0x1234_5000).unwrap();
        assert_eq!(pte, 0x12345);
        assert_eq!(translate(pte, 0x8000_0abc), Some(0x1234_5abc));
        assert_eq!(translate(PTE_INVALID, 0x8000_0000), None);
        assert_eq!(entry_index(0x8000_0000, 0x8000_3fff), 3);
    }
}

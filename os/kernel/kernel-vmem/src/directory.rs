//! # i386 Page Directory (first level)
//!
//! - [`DirectoryIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a PD entry pointing to a [`PageTable`](crate::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs, the root of an
//!   address space (its physical address goes into CR3).
//!
//! Only `PS=0` entries are created; 4 MiB pages are left to the boot code.

use crate::PageEntryBits;
use kernel_info::memory::PAGE_TABLE_WINDOW_SLOT;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; 1024],
}

impl DirectoryIndex {
    /// The slot through which the directory maps itself.
    pub const WINDOW: Self = Self(PAGE_TABLE_WINDOW_SLOT as u16);

    /// Build an index from a virtual address (extracts bits `[31:22]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }
}

impl PdEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present and not a 4 MiB page, the physical address of the page table.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalAddress> {
        if self.is_present() && !self.0.large_page() {
            Some(self.0.physical_address())
        } else {
            None
        }
    }

    /// Create a present, writable, supervisor-only pointer to the table at `table`.
    #[inline]
    #[must_use]
    pub fn make_next(table: PhysicalAddress) -> Self {
        debug_assert!(table.is_aligned::<Size4K>(), "PT base must be 4K-aligned");
        Self(PageEntryBits::new_kernel_rw(table))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    /// Create a fully zeroed Page Directory (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); 1024],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_from_va() {
        assert_eq!(DirectoryIndex::from(VirtualAddress::new(0xC000_0000)).as_usize(), 768);
        assert_eq!(DirectoryIndex::from(VirtualAddress::new(0xC040_0000)).as_usize(), 769);
        assert_eq!(DirectoryIndex::from(VirtualAddress::new(0xFFC0_0000)), DirectoryIndex::WINDOW);
        assert_eq!(DirectoryIndex::new(769).base(), VirtualAddress::new(0xC040_0000));
    }

    #[test]
    fn pde_points_to_table() {
        let e = PdEntry::make_next(PhysicalAddress::new(0x0040_1000));
        assert_eq!(e.next_table(), Some(PhysicalAddress::new(0x0040_1000)));
        assert_eq!(e.raw(), 0x0040_1003);

        // 4 MiB page entries are not tables.
        let large = PdEntry::from_raw(0x0040_0083);
        assert!(large.is_present());
        assert_eq!(large.next_table(), None);
    }
}

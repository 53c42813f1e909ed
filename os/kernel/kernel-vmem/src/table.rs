//! # i386 Page Table (second level)
//!
//! - [`TableIndex`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a PT entry (PTE); every present entry maps one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! After modifying active mappings, the caller must perform any required TLB maintenance.

use crate::PageEntryBits;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

/// Index into a Page Table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct PtEntry(PageEntryBits);

/// The Page Table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; 1024],
}

impl TableIndex {
    /// Build an index from a virtual address (extracts bits `[21:12]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3FF) as u16)
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
}

impl PtEntry {
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

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the mapped 4 KiB physical page.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(self.0.physical_address())
        } else {
            None
        }
    }

    /// Create a present, writable, supervisor-only 4 KiB mapping of `page`.
    #[inline]
    #[must_use]
    pub fn make_4k(page: PhysicalAddress) -> Self {
        debug_assert!(page.is_aligned::<Size4K>(), "PTE base must be 4K-aligned");
        Self(PageEntryBits::new_kernel_rw(page))
    }

    /// Same entry with the `RW` bit replaced.
    #[inline]
    #[must_use]
    pub const fn with_writable(self, writable: bool) -> Self {
        Self(self.0.with_writable(writable))
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

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); 1024],
        }
    }

    /// Mark every entry non-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_from_va() {
        assert_eq!(TableIndex::from(VirtualAddress::new(0xC040_3123)).as_usize(), 3);
        assert_eq!(TableIndex::from(VirtualAddress::new(0xFFFF_F000)).as_usize(), 1023);
        assert_eq!(TableIndex::from(VirtualAddress::new(0x003F_F000)).as_usize(), 1023);
    }

    #[test]
    fn pte_4k_leaf() {
        let e = PtEntry::make_4k(PhysicalAddress::new(0x5555_0000));
        assert_eq!(e.page_4k(), Some(PhysicalAddress::new(0x5555_0000)));
        assert!(e.flags().writable());
        assert!(!e.flags().user_access());
        assert!(!e.flags().large_page());

        let ro = e.with_writable(false);
        assert_eq!(ro.raw(), 0x5555_0001);
        assert!(PtEntry::from_raw(0x5555_0002).page_4k().is_none());
    }

    #[test]
    fn table_is_one_page() {
        assert_eq!(size_of::<PageTable>(), 4096);
        assert_eq!(align_of::<PageTable>(), 4096);
        let mut t = PageTable::zeroed();
        t.set(TableIndex::new(7), PtEntry::make_4k(PhysicalAddress::new(0x7000)));
        assert_eq!(t.present_count(), 1);
        t.zero();
        assert_eq!(t.present_count(), 0);
    }
}

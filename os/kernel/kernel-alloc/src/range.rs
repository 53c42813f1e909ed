//! # Address-Range Manager
//!
//! Tracks the free, page-granular parts of one address space (kernel virtual
//! or physical) as a set of disjoint half-open regions `[begin, end)`.
//!
//! Every region record is linked into two [`AvlTree`]s at once:
//!
//! ```text
//!             by address                      by (size, begin)
//!
//!          [0x5000, 0x6000)                   [0x5000, 0x6000) 1 page
//!            /          \                       /           \
//! [0x1000, 0x3000)  [0x8000, 0xC000)      (none)      [0x1000, 0x3000) 2 pages
//!                                                              \
//!                                                      [0x8000, 0xC000) 4 pages
//! ```
//!
//! * The **address index** finds the regions touching a freed range so they
//!   can be merged; regions are therefore always maximal (no two adjacent).
//! * The **size index** answers "smallest region with at least n pages",
//!   breaking ties by the lower address.
//!
//! Records live in a fixed [`Slab`]; the manager never allocates.

use crate::avl::{AvlAdapter, AvlLinks, AvlTree};
use crate::slab::{Handle, Slab};
use core::cmp::Ordering;
use core::marker::PhantomData;
use core::ops::Range;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::TypedAddress;
use log::warn;

/// Region records per manager unless specified otherwise.
pub const DEFAULT_REGION_CAPACITY: usize = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("address range wraps around the end of the address space")]
    Overflow,
    #[error("no region record left")]
    OutOfRecords,
}

struct Region {
    begin: u32,
    end: u32,
    by_address: AvlLinks,
    by_size: AvlLinks,
}

impl Region {
    const fn new(span: Span) -> Self {
        Self {
            begin: span.begin,
            end: span.end,
            by_address: AvlLinks::new(),
            by_size: AvlLinks::new(),
        }
    }

    const fn size(&self) -> u32 {
        self.end - self.begin
    }

    const fn span(&self) -> Span {
        Span {
            begin: self.begin,
            end: self.end,
        }
    }
}

/// Raw `[begin, end)`.
#[derive(Copy, Clone, Debug)]
struct Span {
    begin: u32,
    end: u32,
}

enum ByAddress {}

impl AvlAdapter for ByAddress {
    type Node = Region;
    type Key = Span;

    fn links(node: &Region) -> &AvlLinks {
        &node.by_address
    }

    fn links_mut(node: &mut Region) -> &mut AvlLinks {
        &mut node.by_address
    }

    fn key(node: &Region) -> Span {
        node.span()
    }

    /// Overlapping spans compare equal.
    fn compare(a: &Span, b: &Span) -> Ordering {
        if a.end <= b.begin {
            Ordering::Less
        } else if b.end <= a.begin {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

enum BySize {}

impl AvlAdapter for BySize {
    type Node = Region;
    type Key = (u32, u32);

    fn links(node: &Region) -> &AvlLinks {
        &node.by_size
    }

    fn links_mut(node: &mut Region) -> &mut AvlLinks {
        &mut node.by_size
    }

    fn key(node: &Region) -> (u32, u32) {
        (node.size(), node.begin)
    }

    fn compare(a: &(u32, u32), b: &(u32, u32)) -> Ordering {
        a.cmp(b)
    }
}

/// Free-range bookkeeping for addresses of kind `A`, with room for `N` regions.
pub struct AddressRangeManager<A: TypedAddress, const N: usize = DEFAULT_REGION_CAPACITY> {
    regions: Slab<Region, N>,
    by_address: AvlTree<ByAddress>,
    by_size: AvlTree<BySize>,
    free_pages: u32,
    _kind: PhantomData<A>,
}

impl<A: TypedAddress, const N: usize> Default for AddressRangeManager<A, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: TypedAddress, const N: usize> AddressRangeManager<A, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: Slab::new(),
            by_address: AvlTree::new(),
            by_size: AvlTree::new(),
            free_pages: 0,
            _kind: PhantomData,
        }
    }

    /// Number of free pages across all regions.
    #[inline]
    #[must_use]
    pub const fn free_pages(&self) -> u32 {
        self.free_pages
    }

    /// Number of disjoint free regions.
    #[inline]
    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Visit the free regions in ascending address order.
    pub fn for_each_region(&self, mut f: impl FnMut(Range<A>)) {
        self.by_address.for_each(&self.regions, |_, r| {
            f(A::from_raw(r.begin)..A::from_raw(r.end));
        });
    }

    /// Make `page_count` pages starting at `base` available for allocation.
    ///
    /// A range touching an existing free region is merged into it.
    ///
    /// # Errors
    /// - [`RangeError::Overflow`] if the range runs past the end of the address space.
    /// - [`RangeError::OutOfRecords`] if a new record would be needed and none is left.
    ///
    /// # Panics
    /// If `base` is not page-aligned or the range overlaps a free region.
    pub fn add_free_range(&mut self, base: A, page_count: u32) -> Result<(), RangeError> {
        if page_count == 0 {
            return Ok(());
        }

        let span = Self::span(base, page_count).ok_or(RangeError::Overflow)?;
        if self.by_address.find(&self.regions, &span).is_some() {
            panic!(
                "range [{base}, {}) overlaps a free region",
                A::from_raw(span.end)
            );
        }

        self.insert_merged(span)
            .map_err(|()| RangeError::OutOfRecords)
    }

    /// Take `page_count` pages from the smallest region that is large enough.
    ///
    /// Returns `None` for a zero-page request or when no region fits.
    pub fn allocate(&mut self, page_count: u32) -> Option<A> {
        if page_count == 0 {
            return None;
        }

        let size = page_count.checked_mul(PAGE_SIZE)?;
        let handle = self.by_size.first_where(&self.regions, |r| r.size() >= size)?;

        let begin = self.regions[handle].begin;
        self.unlink(handle);
        self.regions[handle].begin += size;
        if self.regions[handle].size() == 0 {
            self.regions.remove(handle);
        } else {
            self.link(handle);
        }

        self.free_pages -= page_count;
        Some(A::from_raw(begin))
    }

    /// Give back `page_count` pages starting at `address`.
    ///
    /// Without a record to describe the range, the pages are dropped with a warning.
    ///
    /// # Panics
    /// On a double free (any part of the range is already free), a misaligned
    /// `address`, or a range wrapping around the address space.
    pub fn free(&mut self, address: A, page_count: u32) {
        if page_count == 0 {
            return;
        }

        let Some(span) = Self::span(address, page_count) else {
            panic!("freeing {page_count} pages at {address} wraps around the address space");
        };
        if self.by_address.find(&self.regions, &span).is_some() {
            panic!(
                "double free of [{address}, {})",
                A::from_raw(span.end)
            );
        }

        if self.insert_merged(span).is_err() {
            warn!(
                "no region record left, leaking [{address}, {})",
                A::from_raw(span.end)
            );
        }
    }

    fn span(base: A, page_count: u32) -> Option<Span> {
        let begin = base.into_raw();
        assert!(
            begin.is_multiple_of(PAGE_SIZE),
            "range base {base} is not page-aligned"
        );
        let end = page_count
            .checked_mul(PAGE_SIZE)
            .and_then(|size| begin.checked_add(size))?;
        Some(Span { begin, end })
    }

    /// Record `span` as free, absorbing the regions directly left and right of it.
    ///
    /// Fails only when neither neighbour exists and no record is left; nothing
    /// has changed in that case.
    fn insert_merged(&mut self, span: Span) -> Result<(), ()> {
        let left = self.adjacent_left(span.begin);
        let right = self.adjacent_right(span.end);

        let mut merged = span;
        let mut record = None;

        if let Some(left) = left {
            merged.begin = self.regions[left].begin;
            self.unlink(left);
            record = Some(left);
        }

        if let Some(right) = right {
            merged.end = self.regions[right].end;
            self.unlink(right);
            if record.is_some() {
                self.regions.remove(right);
            } else {
                record = Some(right);
            }
        }

        let handle = match record {
            Some(handle) => {
                let region = &mut self.regions[handle];
                region.begin = merged.begin;
                region.end = merged.end;
                handle
            }
            None => self.regions.insert(Region::new(merged)).map_err(|_| ())?,
        };

        self.link(handle);
        self.free_pages += (span.end - span.begin) / PAGE_SIZE;
        Ok(())
    }

    /// The free region ending exactly at `begin`.
    fn adjacent_left(&self, begin: u32) -> Option<Handle> {
        let probe = Span {
            begin: begin.checked_sub(1)?,
            end: begin,
        };
        self.by_address
            .find(&self.regions, &probe)
            .filter(|&h| self.regions[h].end == begin)
    }

    /// The free region starting exactly at `end`.
    fn adjacent_right(&self, end: u32) -> Option<Handle> {
        let probe = Span {
            begin: end,
            end: end.checked_add(1)?,
        };
        self.by_address
            .find(&self.regions, &probe)
            .filter(|&h| self.regions[h].begin == end)
    }

    fn link(&mut self, handle: Handle) {
        if let Err(existing) = self.by_address.insert(&mut self.regions, handle) {
            panic!("region {handle:?} overlaps region {existing:?}");
        }
        if let Err(existing) = self.by_size.insert(&mut self.regions, handle) {
            panic!("region {handle:?} duplicates size key of {existing:?}");
        }
    }

    fn unlink(&mut self, handle: Handle) {
        let region = &self.regions[handle];
        let (span, size_key) = (region.span(), BySize::key(region));

        let erased = self.by_size.erase(&mut self.regions, &size_key);
        assert_eq!(erased, Some(handle), "size index lost a region");
        let erased = self.by_address.erase(&mut self.regions, &span);
        assert_eq!(erased, Some(handle), "address index lost a region");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

    const PAGE: u32 = PAGE_SIZE;

    fn va(v: u32) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn regions<A: TypedAddress, const N: usize>(m: &AddressRangeManager<A, N>) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        m.for_each_region(|r| out.push((r.start.into_raw(), r.end.into_raw())));
        out
    }

    /// Regions are sorted, non-empty, disjoint, non-adjacent, and add up to `free_pages`.
    fn assert_well_formed<A: TypedAddress, const N: usize>(m: &AddressRangeManager<A, N>) {
        let rs = regions(m);
        let mut pages = 0;
        for (b, e) in &rs {
            assert!(e > b);
            assert_eq!((e - b) % PAGE, 0);
            pages += (e - b) / PAGE;
        }
        for w in rs.windows(2) {
            assert!(w[0].1 < w[1].0, "regions {:x?} and {:x?} touch", w[0], w[1]);
        }
        assert_eq!(pages, m.free_pages());
        assert_eq!(rs.len(), m.region_count());
        assert_eq!(m.by_size.len(), m.region_count());
        assert_eq!(m.by_address.len(), m.region_count());
    }

    #[test]
    fn four_page_scenario() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x1000), 4).unwrap();

        assert_eq!(m.allocate(1), Some(va(0x1000)));
        assert_eq!(m.allocate(2), Some(va(0x2000)));
        assert_eq!(m.allocate(2), None);

        m.free(va(0x1000), 1);
        m.free(va(0x2000), 2);
        assert_eq!(regions(&m), [(0x1000, 0x5000)]);
        assert_eq!(m.allocate(4), Some(va(0x1000)));
        assert_eq!(m.free_pages(), 0);
        assert_eq!(m.region_count(), 0);
    }

    #[test]
    fn four_pages_split_one_and_three() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x1000), 4).unwrap();

        assert_eq!(m.allocate(1), Some(va(0x1000)));
        assert_eq!(m.allocate(3), Some(va(0x2000)));
        assert_eq!(m.region_count(), 0);

        m.free(va(0x1000), 1);
        m.free(va(0x2000), 3);
        assert_eq!(regions(&m), [(0x1000, 0x5000)]);
        assert_eq!(m.free_pages(), 4);
        assert_well_formed(&m);
    }

    #[test]
    fn zero_pages_are_ignored() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x1000), 0).unwrap();
        assert_eq!(m.region_count(), 0);
        m.add_free_range(va(0x1000), 2).unwrap();
        assert_eq!(m.allocate(0), None);
        m.free(va(0x8000), 0);
        assert_eq!(regions(&m), [(0x1000, 0x3000)]);
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let mut m = AddressRangeManager::<PhysicalAddress>::new();
        assert_eq!(
            m.add_free_range(PhysicalAddress::new(0xFFFF_F000), 1),
            Err(RangeError::Overflow)
        );
        assert_eq!(
            m.add_free_range(PhysicalAddress::new(0x1000), u32::MAX),
            Err(RangeError::Overflow)
        );
        m.add_free_range(PhysicalAddress::new(0xFFFF_E000), 1).unwrap();
        assert_eq!(m.free_pages(), 1);
    }

    #[test]
    fn smallest_adequate_region_wins() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x10000), 8).unwrap();
        m.add_free_range(va(0x40000), 2).unwrap();
        m.add_free_range(va(0x80000), 3).unwrap();
        m.add_free_range(va(0x90000), 2).unwrap();

        // two 2-page regions: the lower address wins
        assert_eq!(m.allocate(2), Some(va(0x40000)));
        assert_eq!(m.allocate(3), Some(va(0x80000)));
        assert_eq!(m.allocate(1), Some(va(0x90000)));
        assert_eq!(m.allocate(5), Some(va(0x10000)));
        assert_eq!(m.allocate(4), None);
        assert_eq!(regions(&m), [(0x15000, 0x18000), (0x91000, 0x92000)]);
        assert_well_formed(&m);
    }

    #[test]
    fn adjacent_registrations_are_merged() {
        let mut m = AddressRangeManager::<PhysicalAddress>::new();
        m.add_free_range(PhysicalAddress::new(0x3000), 1).unwrap();
        m.add_free_range(PhysicalAddress::new(0x1000), 2).unwrap();
        m.add_free_range(PhysicalAddress::new(0x4000), 1).unwrap();
        assert_eq!(regions(&m), [(0x1000, 0x5000)]);
        assert_well_formed(&m);
    }

    #[test]
    fn free_bridging_two_regions_reuses_one_record() {
        let mut m = AddressRangeManager::<VirtualAddress, 2>::new();
        m.add_free_range(va(0x1000), 1).unwrap();
        m.add_free_range(va(0x3000), 1).unwrap();
        assert_eq!(m.region_count(), 2);

        m.free(va(0x2000), 1);
        assert_eq!(regions(&m), [(0x1000, 0x4000)]);
        assert_eq!(m.region_count(), 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x1000), 4).unwrap();
        let a = m.allocate(2).unwrap();
        m.free(a, 2);
        m.free(a, 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn partially_free_range_panics() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x1000), 4).unwrap();
        let a = m.allocate(4).unwrap();
        m.free(a + 2 * PAGE, 2);
        m.free(a, 3);
    }

    #[test]
    #[should_panic(expected = "overlaps a free region")]
    fn overlapping_registration_panics() {
        let mut m = AddressRangeManager::<PhysicalAddress>::new();
        m.add_free_range(PhysicalAddress::new(0x1000), 4).unwrap();
        let _ = m.add_free_range(PhysicalAddress::new(0x4000), 2);
    }

    #[test]
    fn out_of_records() {
        let mut m = AddressRangeManager::<VirtualAddress, 2>::new();
        m.add_free_range(va(0x1000), 1).unwrap();
        m.add_free_range(va(0x5000), 1).unwrap();
        assert_eq!(
            m.add_free_range(va(0x9000), 1),
            Err(RangeError::OutOfRecords)
        );
        // merging needs no new record
        m.add_free_range(va(0x2000), 1).unwrap();
        assert_eq!(regions(&m), [(0x1000, 0x3000), (0x5000, 0x6000)]);

        // an isolated free without a record is dropped, nothing else changes
        let a = m.allocate(1).unwrap();
        assert_eq!(a, va(0x5000));
        m.add_free_range(va(0x9000), 1).unwrap();
        m.free(va(0x5000), 1);
        assert_eq!(regions(&m), [(0x1000, 0x3000), (0x9000, 0xA000)]);
        assert_well_formed(&m);
    }

    #[test]
    fn capacity_round_trip() {
        let mut m = AddressRangeManager::<VirtualAddress>::new();
        m.add_free_range(va(0x0010_0000), 64).unwrap();

        let mut taken = Vec::new();
        for n in [1, 3, 7, 2, 16, 5, 30] {
            taken.push((m.allocate(n).unwrap(), n));
        }
        assert_eq!(m.free_pages(), 0);
        assert_eq!(m.allocate(1), None);

        // free in a scattered order
        for i in [3, 0, 6, 2, 5, 1, 4] {
            let (a, n) = taken[i];
            m.free(a, n);
            assert_well_formed(&m);
        }
        assert_eq!(regions(&m), [(0x0010_0000, 0x0014_0000)]);
        assert_eq!(m.allocate(64), Some(va(0x0010_0000)));
    }

    #[test]
    fn random_operations_keep_regions_disjoint_and_maximal() {
        let mut m = AddressRangeManager::<VirtualAddress, 256>::new();
        m.add_free_range(va(0x0100_0000), 512).unwrap();
        m.add_free_range(va(0x0300_0000), 256).unwrap();
        let total = m.free_pages();

        let mut state = 0x9E37_79B9_u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        let mut live: Vec<(VirtualAddress, u32)> = Vec::new();
        for round in 0..3000 {
            if live.is_empty() || next() % 5 < 3 {
                let n = next() % 12 + 1;
                if let Some(a) = m.allocate(n) {
                    for &(b, k) in &live {
                        let (a0, a1) = (a.as_u32(), a.as_u32() + n * PAGE);
                        let (b0, b1) = (b.as_u32(), b.as_u32() + k * PAGE);
                        assert!(a1 <= b0 || b1 <= a0, "allocations overlap");
                    }
                    live.push((a, n));
                }
            } else {
                let i = next() as usize % live.len();
                let (a, n) = live.swap_remove(i);
                m.free(a, n);
            }
            if round % 50 == 0 {
                assert_well_formed(&m);
            }
        }

        let held: u32 = live.iter().map(|&(_, n)| n).sum();
        assert_eq!(m.free_pages() + held, total);
        for (a, n) in live.drain(..) {
            m.free(a, n);
        }
        assert_well_formed(&m);
        assert_eq!(
            regions(&m),
            [(0x0100_0000, 0x0120_0000), (0x0300_0000, 0x0310_0000)]
        );
    }
}

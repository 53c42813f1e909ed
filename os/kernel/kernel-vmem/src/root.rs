//! # Page-Table Root
//!
//! [`PageTableRoot`] owns one address space: the directory frame, the frames
//! of all page tables it created or adopted, and the means to reach them.
//!
//! ## Invariants
//!
//! - At most one page table per directory slot; tables are created lazily by
//!   [`PageTableRoot::map_addr`] and never reclaimed while the root lives.
//! - Slot 1023 always maps the directory onto itself (the page-table window)
//!   and is never handed out for regular mappings.
//! - All addresses passed in must be 4 KiB-aligned; violations are bugs and panic.
//! - TLB maintenance is the caller's responsibility.
//! - A root built by [`PageTableRoot::empty`] has no directory until
//!   [`PageTableRoot::adopt_directory`]; every other operation panics before.

use crate::{
    DirectoryIndex, FrameAlloc, FrameMapper, MapError, PageDirectory, PageTable, PdEntry, PtEntry,
    TableFrame, TableIndex, table_window_address,
};
use kernel_info::memory::{ENTRIES_PER_TABLE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, TypedAddress, VirtualAddress};

const SLOTS: usize = ENTRIES_PER_TABLE as usize;

pub struct PageTableRoot<F: TableFrame, M: FrameMapper> {
    directory: Option<F>,
    tables: [Option<F>; SLOTS],
    mapper: M,
}

impl<F: TableFrame, M: FrameMapper> PageTableRoot<F, M> {
    /// Build an empty address space in `directory` (zeroed, window installed).
    pub fn new(directory: F, mapper: M) -> Self {
        let mut root = Self::empty(mapper);
        root.directory = Some(directory);
        root.directory_mut().zero();
        root.install_window();
        root
    }

    /// Take over a directory that is already populated, e.g. the one the boot
    /// code activated. Existing entries are kept; tables referenced by them are
    /// not owned until registered with [`adopt_table`](Self::adopt_table).
    pub fn adopt(directory: F, mapper: M) -> Self {
        let mut root = Self::empty(mapper);
        root.adopt_directory(directory);
        root
    }

    /// A root without a directory, for statics that are set up in place.
    #[must_use]
    pub const fn empty(mapper: M) -> Self {
        Self {
            directory: None,
            tables: [const { None }; SLOTS],
            mapper,
        }
    }

    /// [`adopt`](Self::adopt) for a root built by [`empty`](Self::empty).
    ///
    /// # Panics
    /// If the root already has a directory.
    pub fn adopt_directory(&mut self, directory: F) {
        assert!(self.directory.is_none(), "page-table root already has a directory");
        self.directory = Some(directory);
        self.install_window();
    }

    fn install_window(&mut self) {
        let pa = self.directory_pa();
        self.directory_mut()
            .set(DirectoryIndex::WINDOW, PdEntry::make_next(pa));
    }

    /// Whether the root has a directory yet.
    #[inline]
    #[must_use]
    pub const fn has_directory(&self) -> bool {
        self.directory.is_some()
    }

    /// Physical address of the directory (the value for CR3).
    #[inline]
    #[must_use]
    pub fn directory_pa(&self) -> PhysicalAddress {
        self.directory_frame().location().pa
    }

    #[inline]
    #[must_use]
    pub const fn directory_frame(&self) -> &F {
        match &self.directory {
            Some(directory) => directory,
            None => panic!("page-table root has no directory"),
        }
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub fn directory(&self) -> &PageDirectory {
        // SAFETY: the directory frame is owned by this root and stays mapped.
        unsafe { self.mapper.frame_to_mut(self.directory_frame().location()) }
    }

    fn directory_mut(&mut self) -> &mut PageDirectory {
        let location = self.directory_frame().location();
        // SAFETY: see `directory`; `&mut self` keeps the borrow unique.
        unsafe { self.mapper.frame_to_mut(location) }
    }

    fn table(&self, slot: DirectoryIndex) -> Option<&PageTable> {
        let frame = self.tables[slot.as_usize()].as_ref()?;
        // SAFETY: table frames are owned by this root and reachable through the mapper.
        Some(unsafe { self.mapper.frame_to_mut(frame.location()) })
    }

    fn table_mut(&mut self, slot: DirectoryIndex) -> Option<&mut PageTable> {
        let frame = self.tables[slot.as_usize()].as_ref()?;
        // SAFETY: see `table`; `&mut self` keeps the borrow unique.
        Some(unsafe { self.mapper.frame_to_mut(frame.location()) })
    }

    /// Whether a page table exists for the slot covering `va`.
    #[inline]
    #[must_use]
    pub fn has_table(&self, va: VirtualAddress) -> bool {
        self.tables[DirectoryIndex::from(va).as_usize()].is_some()
    }

    /// Number of page tables owned by this root.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    /// Register an already populated page table for `slot` and point the
    /// directory at it.
    ///
    /// # Panics
    /// If `slot` is the window slot or already owns a table.
    pub fn adopt_table(&mut self, slot: DirectoryIndex, table: F) {
        assert_ne!(slot, DirectoryIndex::WINDOW, "the window slot cannot hold a page table");
        assert!(
            self.tables[slot.as_usize()].is_none(),
            "directory slot {slot:?} already owns a page table"
        );
        let pa = table.location().pa;
        self.directory_mut().set(slot, PdEntry::make_next(pa));
        self.tables[slot.as_usize()] = Some(table);
    }

    /// Make `slot` non-present and release the table it owned, if any.
    ///
    /// # Panics
    /// If `slot` is the window slot.
    pub fn clear_directory_entry(&mut self, slot: DirectoryIndex) -> Option<F> {
        assert_ne!(slot, DirectoryIndex::WINDOW, "the window slot cannot be cleared");
        self.directory_mut().set(slot, PdEntry::zero());
        self.tables[slot.as_usize()].take()
    }

    fn ensure_table<A>(&mut self, frames: &mut A, slot: DirectoryIndex) -> Result<(), MapError>
    where
        A: FrameAlloc<Frame = F>,
    {
        if self.tables[slot.as_usize()].is_some() {
            return Ok(());
        }

        let frame = frames
            .alloc_table_frame(table_window_address(slot))
            .ok_or(MapError::OutOfFrames)?;
        let pa = frame.location().pa;
        log::trace!("new page table for slot {} at {pa}", slot.as_usize());

        // Directory first: the window address only becomes valid afterwards.
        self.directory_mut().set(slot, PdEntry::make_next(pa));
        self.tables[slot.as_usize()] = Some(frame);
        if let Some(table) = self.table_mut(slot) {
            table.zero();
        }
        Ok(())
    }

    /// Map `page_count` consecutive pages at `va` to consecutive frames at `pa`
    /// (present, writable, supervisor-only), creating page tables as needed.
    ///
    /// On failure every page mapped by this call is unmapped again; page tables
    /// created on the way are kept.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a page table could not be allocated.
    ///
    /// # Panics
    /// If an address is not page-aligned, the range wraps, or it reaches into
    /// the page-table window.
    pub fn map_addr<A>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        page_count: u32,
    ) -> Result<(), MapError>
    where
        A: FrameAlloc<Frame = F>,
    {
        assert!(va.is_aligned::<Size4K>(), "unaligned virtual address {va:?}");
        assert!(pa.is_aligned::<Size4K>(), "unaligned physical address {pa:?}");

        for i in 0..page_count {
            let page_va = nth_page(va, i);
            let page_pa = nth_page(pa, i);
            let slot = DirectoryIndex::from(page_va);
            assert_ne!(slot, DirectoryIndex::WINDOW, "{page_va:?} lies in the page-table window");

            if let Err(e) = self.ensure_table(frames, slot) {
                self.unmap_addr(va, i);
                return Err(e);
            }

            if let Some(table) = self.table_mut(slot) {
                table.set(TableIndex::from(page_va), PtEntry::make_4k(page_pa));
            }
        }

        Ok(())
    }

    /// Remove the mappings of `page_count` pages starting at `va`.
    ///
    /// # Panics
    /// If `va` is not page-aligned or any of the pages is not mapped.
    pub fn unmap_addr(&mut self, va: VirtualAddress, page_count: u32) {
        assert!(va.is_aligned::<Size4K>(), "unaligned virtual address {va:?}");
        for i in 0..page_count {
            let page_va = nth_page(va, i);
            let slot = DirectoryIndex::from(page_va);
            let Some(table) = self.table_mut(slot) else {
                panic!("unmapping {page_va:?} without a page table");
            };
            let idx = TableIndex::from(page_va);
            assert!(table.get(idx).is_present(), "unmapping {page_va:?} which is not mapped");
            table.set(idx, PtEntry::zero());
        }
    }

    /// Remove whatever mappings exist in `page_count` pages starting at `va`.
    ///
    /// Unlike [`unmap_addr`](Self::unmap_addr), absent pages are skipped.
    pub fn clear_range(&mut self, va: VirtualAddress, page_count: u32) {
        for i in 0..page_count {
            let page_va = nth_page(va, i);
            if let Some(table) = self.table_mut(DirectoryIndex::from(page_va)) {
                table.set(TableIndex::from(page_va), PtEntry::zero());
            }
        }
    }

    /// Change the `RW` bit of `page_count` mapped pages starting at `va`.
    ///
    /// # Panics
    /// If any of the pages is not mapped.
    pub fn set_writable(&mut self, va: VirtualAddress, page_count: u32, writable: bool) {
        for i in 0..page_count {
            let page_va = nth_page(va, i);
            let Some(table) = self.table_mut(DirectoryIndex::from(page_va)) else {
                panic!("changing protection of {page_va:?} without a page table");
            };
            let idx = TableIndex::from(page_va);
            let entry = table.get(idx);
            assert!(entry.is_present(), "changing protection of unmapped {page_va:?}");
            table.set(idx, entry.with_writable(writable));
        }
    }

    /// Translate `va` to the base of the physical page it maps to.
    #[must_use]
    pub fn lookup_pa(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.table(DirectoryIndex::from(va))?
            .get(TableIndex::from(va))
            .page_4k()
    }

    /// Read the raw entry for `va`, if its page table exists.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        Some(self.table(DirectoryIndex::from(va))?.get(TableIndex::from(va)))
    }
}

/// Address of the `i`-th page after `base`.
#[inline]
fn nth_page<A: TypedAddress>(base: A, i: u32) -> A {
    i.checked_mul(PAGE_SIZE)
        .and_then(|off| base.into_raw().checked_add(off))
        .map_or_else(
            || panic!("page {i} past {base:?} leaves the address space"),
            A::from_raw,
        )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{BumpAlloc, TestFrame, TestPhys};
    use crate::FrameLocation;

    const DIR_PA: u32 = 0x0010_0000;

    fn dir_frame() -> TestFrame {
        TestFrame(FrameLocation {
            va: VirtualAddress::new(0xC010_0000),
            pa: PhysicalAddress::new(DIR_PA),
        })
    }

    #[test]
    fn new_root_has_only_the_window() {
        let phys = TestPhys::default();
        let root = PageTableRoot::new(dir_frame(), &phys);
        let dir = root.directory();
        for i in 0..1023 {
            assert!(!dir.get(DirectoryIndex::new(i)).is_present());
        }
        assert_eq!(
            dir.get(DirectoryIndex::WINDOW).next_table(),
            Some(PhysicalAddress::new(DIR_PA))
        );
        assert_eq!(root.directory_pa(), PhysicalAddress::new(DIR_PA));
        assert_eq!(root.table_count(), 0);
    }

    #[test]
    fn map_lookup_unmap_roundtrip() {
        let phys = TestPhys::default();
        let mut frames = BumpAlloc::new(0x0020_0000, 8);
        let mut root = PageTableRoot::new(dir_frame(), &phys);

        let va = VirtualAddress::new(0xC040_0000);
        let pa = PhysicalAddress::new(0x0100_0000);
        root.map_addr(&mut frames, va, pa, 3).unwrap();

        for i in 0..3 {
            assert_eq!(
                root.lookup_pa(va + i * 4096),
                Some(PhysicalAddress::new(0x0100_0000 + i * 4096))
            );
        }
        assert_eq!(root.lookup_pa(va + 3 * 4096), None);

        // one table, requested at its window address
        assert_eq!(frames.handed_out.len(), 1);
        assert_eq!(frames.handed_out[0].va, VirtualAddress::new(0xFFF0_1000));
        assert!(root.has_table(va));

        // the hardware view agrees
        let pde = phys.read_u32(PhysicalAddress::new(DIR_PA + 769 * 4));
        assert_eq!(pde, 0x0020_0003);
        let pte = phys.read_u32(PhysicalAddress::new(0x0020_0000 + 4));
        assert_eq!(pte, 0x0100_1003);

        root.unmap_addr(va, 3);
        for i in 0..3 {
            assert_eq!(root.lookup_pa(va + i * 4096), None);
        }
        // tables stay
        assert!(root.has_table(va));
    }

    #[test]
    fn mapping_across_a_slot_boundary_creates_two_tables() {
        let phys = TestPhys::default();
        let mut frames = BumpAlloc::new(0x0020_0000, 8);
        let mut root = PageTableRoot::new(dir_frame(), &phys);

        let va = VirtualAddress::new(0xC07F_F000);
        root.map_addr(&mut frames, va, PhysicalAddress::new(0x0030_0000), 2)
            .unwrap();
        assert_eq!(root.table_count(), 2);
        assert_eq!(
            root.lookup_pa(VirtualAddress::new(0xC080_0000)),
            Some(PhysicalAddress::new(0x0030_1000))
        );
    }

    #[test]
    fn failed_map_leaves_nothing_mapped() {
        let phys = TestPhys::default();
        // enough for the first table only
        let mut frames = BumpAlloc::new(0x0020_0000, 1);
        let mut root = PageTableRoot::new(dir_frame(), &phys);

        let va = VirtualAddress::new(0xC07F_E000);
        let err = root
            .map_addr(&mut frames, va, PhysicalAddress::new(0x0030_0000), 4)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfFrames);

        for i in 0..4 {
            assert_eq!(root.lookup_pa(va + i * 4096), None);
        }
    }

    #[test]
    fn lookup_without_table_is_none() {
        let phys = TestPhys::default();
        let root = PageTableRoot::new(dir_frame(), &phys);
        assert_eq!(root.lookup_pa(VirtualAddress::new(0xD000_0000)), None);
        assert!(root.entry(VirtualAddress::new(0xD000_0000)).is_none());
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn unmapping_absent_page_panics() {
        let phys = TestPhys::default();
        let mut frames = BumpAlloc::new(0x0020_0000, 1);
        let mut root = PageTableRoot::new(dir_frame(), &phys);
        let va = VirtualAddress::new(0xC040_0000);
        root.map_addr(&mut frames, va, PhysicalAddress::new(0x0030_0000), 1)
            .unwrap();
        root.unmap_addr(va + 4096, 1);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn misaligned_map_panics() {
        let phys = TestPhys::default();
        let mut frames = BumpAlloc::new(0x0020_0000, 1);
        let mut root = PageTableRoot::new(dir_frame(), &phys);
        let _ = root.map_addr(
            &mut frames,
            VirtualAddress::new(0xC040_0010),
            PhysicalAddress::new(0x0030_0000),
            1,
        );
    }

    #[test]
    #[should_panic(expected = "page-table window")]
    fn mapping_into_window_panics() {
        let phys = TestPhys::default();
        let mut frames = BumpAlloc::new(0x0020_0000, 1);
        let mut root = PageTableRoot::new(dir_frame(), &phys);
        let _ = root.map_addr(
            &mut frames,
            VirtualAddress::new(0xFFC0_0000),
            PhysicalAddress::new(0x0030_0000),
            1,
        );
    }

    #[test]
    fn adopt_keeps_entries_and_tables() {
        let phys = TestPhys::default();
        // a boot directory with an identity slot 0 and the kernel slot 768,
        // both pointing at the same boot table
        let boot_table = TestFrame(FrameLocation {
            va: VirtualAddress::new(0xC010_1000),
            pa: PhysicalAddress::new(0x0010_1000),
        });
        {
            let mut pre = PageTableRoot::new(dir_frame(), &phys);
            pre.adopt_table(DirectoryIndex::new(0), boot_table);
            pre.adopt_table(DirectoryIndex::new(768), boot_table);
            pre.put_entry(DirectoryIndex::new(768), 0x100, PhysicalAddress::new(0x0010_0000));
        }

        let mut root = PageTableRoot::adopt(dir_frame(), &phys);
        assert!(root.directory().get(DirectoryIndex::new(0)).is_present());
        assert_eq!(root.table_count(), 0);

        root.adopt_table(DirectoryIndex::new(768), boot_table);
        assert_eq!(
            root.lookup_pa(VirtualAddress::new(0xC010_0000)),
            Some(PhysicalAddress::new(0x0010_0000))
        );

        assert!(root.clear_directory_entry(DirectoryIndex::new(0)).is_none());
        assert!(!root.directory().get(DirectoryIndex::new(0)).is_present());

        root.set_writable(VirtualAddress::new(0xC010_0000), 1, false);
        let e = root.entry(VirtualAddress::new(0xC010_0000)).unwrap();
        assert!(e.is_present());
        assert!(!e.flags().writable());

        root.clear_range(VirtualAddress::new(0xC000_0000), 0x101);
        assert_eq!(root.lookup_pa(VirtualAddress::new(0xC010_0000)), None);
    }

    #[test]
    fn window_addresses_start_at_the_window() {
        use kernel_info::memory::PAGE_TABLE_WINDOW;
        assert_eq!(table_window_address(DirectoryIndex::new(0)), PAGE_TABLE_WINDOW);
        assert_eq!(
            table_window_address(DirectoryIndex::WINDOW),
            VirtualAddress::new(0xFFFF_F000)
        );
    }

    #[test]
    fn empty_root_adopts_in_place() {
        let phys = TestPhys::default();
        let mut root = PageTableRoot::empty(&phys);
        assert!(!root.has_directory());
        assert_eq!(root.lookup_pa(VirtualAddress::new(0xC040_0000)), None);

        root.adopt_directory(dir_frame());
        assert!(root.has_directory());
        assert_eq!(root.directory_pa(), PhysicalAddress::new(DIR_PA));
        assert_eq!(
            root.directory().get(DirectoryIndex::WINDOW).next_table(),
            Some(PhysicalAddress::new(DIR_PA))
        );

        let mut frames = BumpAlloc::new(0x0020_0000, 1);
        let va = VirtualAddress::new(0xC040_0000);
        root.map_addr(&mut frames, va, PhysicalAddress::new(0x0030_0000), 1)
            .unwrap();
        assert_eq!(root.lookup_pa(va), Some(PhysicalAddress::new(0x0030_0000)));
    }

    #[test]
    #[should_panic(expected = "has no directory")]
    fn empty_root_has_no_directory_pa() {
        let phys = TestPhys::default();
        let root = PageTableRoot::<TestFrame, _>::empty(&phys);
        let _ = root.directory_pa();
    }

    #[test]
    #[should_panic(expected = "already has a directory")]
    fn second_directory_is_rejected() {
        let phys = TestPhys::default();
        let mut root = PageTableRoot::adopt(dir_frame(), &phys);
        root.adopt_directory(dir_frame());
    }

    impl<F: TableFrame, M: FrameMapper> PageTableRoot<F, M> {
        fn put_entry(&mut self, slot: DirectoryIndex, idx: u16, pa: PhysicalAddress) {
            let table = self.table_mut(slot).unwrap();
            table.set(TableIndex::new(idx), PtEntry::make_4k(pa));
        }
    }
}

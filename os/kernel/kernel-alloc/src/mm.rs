//! # Memory Manager
//!
//! [`MemoryManager`] ties together the two address-range managers (kernel
//! virtual space and physical frames) and the active page-table root.
//!
//! ```text
//!   alloc_pages(n)
//!        │
//!        ├─► va.allocate(n) ─────────────┐
//!        ├─► pa.allocate(n) ─────────┐   │
//!        └─► page_table.map_addr(va, pa, n)
//!                 │
//!                 └─► new page table? pa.allocate(1), visible in the window
//! ```
//!
//! Every step is undone when a later one fails, so a failed allocation
//! leaves all three structures as they were.
//!
//! ## Boot
//!
//! The boot code runs on a directory with two slots: an identity mapping
//! (slot 0) and the kernel image at [`KERNEL_HIGH_VA`], both through one boot
//! page table. Bring-up happens in three steps:
//!
//! 1. [`MemoryManager::from_boot`] (or [`MemoryManager::adopt_boot`] on a
//!    manager built by [`MemoryManager::empty`]) takes both tables over;
//! 2. [`MemoryManager::init`] feeds the bootloader's memory map into the
//!    physical manager and the kernel heap window into the virtual one;
//! 3. [`MemoryManager::finish_boot`] drops the identity mapping and
//!    write-protects the kernel's code and read-only data.

use crate::heap::PageSource;
use crate::pages::{Pages, PagesRef, PagesRelease};
use crate::range::AddressRangeManager;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;
use kernel_info::boot::{MemoryKind, MemoryMap, MemoryRegion};
use kernel_info::memory::{
    ENTRIES_PER_TABLE, KERNEL_HEAP_PAGES, KERNEL_HEAP_START, KERNEL_HIGH_VA, PAGE_SIZE,
    PHYSICAL_LIMIT,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{
    DirectoryIndex, FrameAlloc, FrameLocation, FrameMapper, MapError, PageTableRoot,
    PagingControl, TableFrame,
};
use log::{debug, info, warn};

/// A frame owned by a kernel page-table root.
pub enum KernelFrame<R: PagesRelease> {
    /// A run also referenced elsewhere, e.g. the pinned boot directory.
    Shared(PagesRef<R>),
    /// A page table created on demand. Only the root refers to it; it is
    /// never given back.
    Table(Pages),
}

impl<R: PagesRelease> TableFrame for KernelFrame<R> {
    fn location(&self) -> FrameLocation {
        match self {
            Self::Shared(pages) => pages.location(),
            Self::Table(pages) => pages.location(),
        }
    }
}

/// Hands out page-table frames from the physical manager.
struct TableFrames<'a, R> {
    pa: &'a mut AddressRangeManager<PhysicalAddress>,
    _release: PhantomData<R>,
}

impl<'a, R> TableFrames<'a, R> {
    const fn new(pa: &'a mut AddressRangeManager<PhysicalAddress>) -> Self {
        Self {
            pa,
            _release: PhantomData,
        }
    }
}

impl<R: PagesRelease> FrameAlloc for TableFrames<'_, R> {
    type Frame = KernelFrame<R>;

    fn alloc_table_frame(&mut self, window_va: VirtualAddress) -> Option<KernelFrame<R>> {
        let pa = self.pa.allocate(1)?;
        Some(KernelFrame::Table(Pages::new(window_va, pa, 1)))
    }
}

/// The directory and kernel page table set up by the boot code.
pub struct BootPageTables<R: PagesRelease> {
    pub directory: PagesRef<R>,
    /// The table mapping the first 4 MiB above [`KERNEL_HIGH_VA`].
    pub kernel_table: PagesRef<R>,
}

/// Where the kernel image lives.
#[derive(Clone, Debug)]
pub struct KernelImage {
    /// Physical load range; both ends page-aligned.
    pub physical: Range<PhysicalAddress>,
    /// Linked range of `.text`.
    pub text: Range<VirtualAddress>,
    /// Linked range of `.rodata`.
    pub rodata: Range<VirtualAddress>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("out of kernel virtual address space")]
    NoVirtualSpace,
    #[error("out of contiguous physical memory")]
    NoPhysicalSpace,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Kernel virtual space, physical frames and the active page tables.
pub struct MemoryManager<R: PagesRelease, M: FrameMapper, C: PagingControl> {
    va: AddressRangeManager<VirtualAddress>,
    pa: AddressRangeManager<PhysicalAddress>,
    page_table: PageTableRoot<KernelFrame<R>, M>,
    control: C,
}

impl<R: PagesRelease, M: FrameMapper, C: PagingControl> MemoryManager<R, M, C> {
    /// A manager with empty range managers on top of `page_table`.
    ///
    /// # Safety
    /// `page_table` must be the root `control` currently has loaded.
    pub unsafe fn new(page_table: PageTableRoot<KernelFrame<R>, M>, control: C) -> Self {
        Self {
            va: AddressRangeManager::new(),
            pa: AddressRangeManager::new(),
            page_table,
            control,
        }
    }

    /// Take over the directory and kernel page table the boot code runs on.
    ///
    /// All boot mappings stay in place until [`finish_boot`](Self::finish_boot),
    /// so the bootloader's structures remain reachable for [`init`](Self::init).
    ///
    /// # Safety
    /// `boot` must describe the active directory and its kernel table.
    pub unsafe fn from_boot(boot: BootPageTables<R>, mapper: M, control: C) -> Self {
        let mut mm = Self::empty(mapper, control);
        // SAFETY: forwarded from the caller.
        unsafe { mm.adopt_boot(boot) };
        mm
    }

    /// A manager without a page directory, to be placed in a static and
    /// brought up there with [`adopt_boot`](Self::adopt_boot).
    #[must_use]
    pub const fn empty(mapper: M, control: C) -> Self {
        Self {
            va: AddressRangeManager::new(),
            pa: AddressRangeManager::new(),
            page_table: PageTableRoot::empty(mapper),
            control,
        }
    }

    /// Whether the manager has a page directory.
    #[inline]
    #[must_use]
    pub const fn is_booted(&self) -> bool {
        self.page_table.has_directory()
    }

    /// [`from_boot`](Self::from_boot) in place.
    ///
    /// # Safety
    /// As for [`from_boot`](Self::from_boot).
    ///
    /// # Panics
    /// If the manager already has a page directory.
    pub unsafe fn adopt_boot(&mut self, boot: BootPageTables<R>) {
        let kernel_slot = DirectoryIndex::from(VirtualAddress::new(KERNEL_HIGH_VA));
        self.page_table
            .adopt_directory(KernelFrame::Shared(boot.directory));
        self.page_table
            .adopt_table(kernel_slot, KernelFrame::Shared(boot.kernel_table));
        debug!("adopted boot page directory at {}", self.page_table.directory_pa());
    }

    /// Drop the identity mapping and every boot mapping below the kernel
    /// image, make `.text` and `.rodata` read-only (for the kernel as well),
    /// then flush the TLB.
    ///
    /// # Safety
    /// `image` must describe the running kernel, and nothing may use the
    /// identity mapping afterwards.
    ///
    /// # Panics
    /// If the kernel image does not start on a page boundary inside the boot
    /// page table's range.
    pub unsafe fn finish_boot(&mut self, image: &KernelImage) {
        let kernel_start = image.physical.start;
        assert!(
            kernel_start.is_aligned::<Size4K>(),
            "kernel image at {kernel_start:?} is not page-aligned"
        );
        let below_kernel = kernel_start.as_u32() / PAGE_SIZE;
        assert!(
            below_kernel < ENTRIES_PER_TABLE,
            "kernel image at {kernel_start:?} lies outside the boot page table"
        );

        // identity mapping
        drop(self.page_table.clear_directory_entry(DirectoryIndex::new(0)));
        self.page_table
            .clear_range(VirtualAddress::new(KERNEL_HIGH_VA), below_kernel);

        write_protect(&mut self.page_table, &image.text);
        write_protect(&mut self.page_table, &image.rodata);

        // SAFETY: the kernel runs at CPL0 and does not write its code or constants.
        unsafe { self.control.enforce_write_protect() };
        self.flush_tlb();
    }

    /// Register the kernel heap window and the usable physical memory.
    ///
    /// Every [`MemoryKind::Available`] region is clipped to the 32-bit
    /// physical space, shrunk to whole pages, and has the kernel image cut
    /// out of it.
    ///
    /// # Panics
    /// Without a memory map, on a misaligned kernel image, or if a range
    /// cannot be registered.
    pub fn init(&mut self, memory_map: Option<MemoryMap<'_>>, image: &KernelImage) {
        let Some(memory_map) = memory_map else {
            panic!("invalid memory map given by bootloader");
        };

        if let Err(e) = self.va.add_free_range(KERNEL_HEAP_START, KERNEL_HEAP_PAGES) {
            panic!("cannot register kernel virtual space: {e}");
        }

        let kernel = &image.physical;
        assert!(
            kernel.start.is_aligned::<Size4K>() && kernel.end.is_aligned::<Size4K>(),
            "kernel image [{}, {}) is not page-aligned",
            kernel.start,
            kernel.end
        );
        info!("kernel image at PA [{}, {})", kernel.start, kernel.end);

        let kernel = kernel.start.as_u32()..kernel.end.as_u32();
        for region in memory_map.iter() {
            if region.kind != MemoryKind::Available {
                continue;
            }
            let Some(usable) = usable_range(&region) else {
                continue;
            };
            for piece in subtract(usable, &kernel).into_iter().flatten() {
                self.register_pa(piece);
            }
        }

        info!(
            "{} physical pages in {} regions",
            self.pa.free_pages(),
            self.pa.region_count()
        );
    }

    fn register_pa(&mut self, range: Range<u32>) {
        let start = PhysicalAddress::new(range.start);
        let end = PhysicalAddress::new(range.end);
        info!("registering PA [{start}, {end})");
        if let Err(e) = self.pa.add_free_range(start, (range.end - range.start) / PAGE_SIZE) {
            panic!("cannot register physical range [{start}, {end}): {e}");
        }
    }

    /// Allocate and map `count` pages without a reference-counted descriptor.
    ///
    /// # Errors
    /// [`AllocError::NoVirtualSpace`] (also for `count == 0`),
    /// [`AllocError::NoPhysicalSpace`] or [`AllocError::Map`]. Nothing stays
    /// allocated or mapped on failure.
    pub fn alloc_mapped(&mut self, count: u32) -> Result<Pages, AllocError> {
        let va = self
            .va
            .allocate(count)
            .ok_or(AllocError::NoVirtualSpace)?;
        let Some(pa) = self.pa.allocate(count) else {
            self.va.free(va, count);
            return Err(AllocError::NoPhysicalSpace);
        };

        if let Err(e) = self.map(va, pa, count) {
            self.pa.free(pa, count);
            self.va.free(va, count);
            return Err(e.into());
        }

        debug!("allocated {count} pages at {va:?} -> {pa:?}");
        Ok(Pages::new(va, pa, count))
    }

    /// Allocate and map `count` pages, handing out the first reference.
    ///
    /// # Errors
    /// See [`alloc_mapped`](Self::alloc_mapped).
    pub fn alloc_pages(&mut self, count: u32) -> Result<PagesRef<R>, AllocError> {
        self.alloc_mapped(count).map(PagesRef::new)
    }

    /// Unmap a run and give its frames and virtual range back.
    ///
    /// # Panics
    /// If `pages` is still referenced or not mapped.
    pub fn free_pages(&mut self, pages: Pages) {
        assert_eq!(pages.ref_count(), 0, "freeing {pages:?} while still referenced");

        self.page_table.unmap_addr(pages.va(), pages.count());
        self.pa.free(pages.pa(), pages.count());
        self.va.free(pages.va(), pages.count());

        // SAFETY: the mappings just removed belong to the active root.
        unsafe { self.control.flush_tlb() };
        debug!("freed {pages:?}");
    }

    /// Reserve `count` pages of kernel virtual space, unmapped.
    pub fn alloc_pages_va(&mut self, count: u32) -> Option<VirtualAddress> {
        self.va.allocate(count)
    }

    /// # Panics
    /// On a double free.
    pub fn free_pages_va(&mut self, va: VirtualAddress, count: u32) {
        self.va.free(va, count);
    }

    /// Reserve `count` contiguous physical frames.
    pub fn alloc_pages_pa(&mut self, count: u32) -> Option<PhysicalAddress> {
        self.pa.allocate(count)
    }

    /// # Panics
    /// On a double free.
    pub fn free_pages_pa(&mut self, pa: PhysicalAddress, count: u32) {
        self.pa.free(pa, count);
    }

    /// Map `count` pages at `va` to the frames at `pa` in the active root.
    ///
    /// Page tables come from the physical manager.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`]; no page of the range is mapped then.
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u32,
    ) -> Result<(), MapError> {
        let mut frames = TableFrames::<R>::new(&mut self.pa);
        self.page_table.map_addr(&mut frames, va, pa, count)
    }

    /// Remove `count` mappings at `va` from the active root and the TLB.
    ///
    /// # Panics
    /// If one of the pages is not mapped.
    pub fn unmap(&mut self, va: VirtualAddress, count: u32) {
        self.page_table.unmap_addr(va, count);
        for i in 0..count {
            // SAFETY: the page belongs to the active root.
            unsafe { self.control.invalidate_page(va + i * PAGE_SIZE) };
        }
    }

    /// Physical page backing `va`, if mapped.
    #[must_use]
    pub fn lookup_pa(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.page_table.lookup_pa(va.align_down::<Size4K>())
    }

    /// Switch to another root and return the previous one.
    ///
    /// # Safety
    /// `root` must map the running kernel (code, stack, heap) exactly like
    /// the current root.
    pub unsafe fn set_page_table(
        &mut self,
        root: PageTableRoot<KernelFrame<R>, M>,
    ) -> PageTableRoot<KernelFrame<R>, M> {
        let old = core::mem::replace(&mut self.page_table, root);
        // SAFETY: guaranteed by the caller.
        unsafe { self.control.load_root(self.page_table.directory_pa()) };
        debug!(
            "switched page directory {} -> {}",
            old.directory_pa(),
            self.page_table.directory_pa()
        );
        old
    }

    pub fn flush_tlb(&self) {
        // SAFETY: the kernel runs at CPL0.
        unsafe { self.control.flush_tlb() };
    }

    #[must_use]
    pub const fn page_table(&self) -> &PageTableRoot<KernelFrame<R>, M> {
        &self.page_table
    }

    #[must_use]
    pub const fn virtual_ranges(&self) -> &AddressRangeManager<VirtualAddress> {
        &self.va
    }

    #[must_use]
    pub const fn physical_ranges(&self) -> &AddressRangeManager<PhysicalAddress> {
        &self.pa
    }
}

impl<R: PagesRelease, M: FrameMapper, C: PagingControl> PageSource for MemoryManager<R, M, C> {
    fn alloc_heap_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        let count = u32::try_from(count).ok()?;
        match self.alloc_mapped(count) {
            Ok(pages) => NonNull::new(pages.va().as_mut_ptr()),
            Err(e) => {
                warn!("no pages for the heap: {e}");
                None
            }
        }
    }

    unsafe fn free_heap_pages(&mut self, pages: NonNull<u8>, count: usize) {
        let Some(va) = VirtualAddress::from_ptr(pages.as_ptr()) else {
            panic!("heap pages at {pages:p} outside the address space");
        };
        let Some(pa) = self.page_table.lookup_pa(va) else {
            panic!("heap pages at {va:?} are not mapped");
        };
        let Ok(count) = u32::try_from(count) else {
            panic!("{count} heap pages at {va:?}");
        };

        let pages = Pages::new(va, pa, count);
        pages.unref();
        self.free_pages(pages);
    }
}

/// Change every page overlapping `range` to read-only.
fn write_protect<R: PagesRelease, M: FrameMapper>(
    page_table: &mut PageTableRoot<KernelFrame<R>, M>,
    range: &Range<VirtualAddress>,
) {
    let start = range.start.align_down::<Size4K>();
    let Some(end) = range.end.align_up::<Size4K>() else {
        panic!("section end {:?} rounds past the address space", range.end);
    };
    let pages = end.as_u32().saturating_sub(start.as_u32()) / PAGE_SIZE;
    page_table.set_writable(start, pages, false);
}

/// Page-aligned part of `region` below [`PHYSICAL_LIMIT`].
fn usable_range(region: &MemoryRegion) -> Option<Range<u32>> {
    let limit = u64::from(PHYSICAL_LIMIT);
    let page = u64::from(PAGE_SIZE);

    let begin = region.base.min(limit).next_multiple_of(page);
    let end = region.end().min(limit) / page * page;
    if begin >= end {
        return None;
    }
    Some(u32::try_from(begin).ok()?..u32::try_from(end).ok()?)
}

/// `range` without `hole`: the part below and the part above it.
fn subtract(range: Range<u32>, hole: &Range<u32>) -> [Option<Range<u32>>; 2] {
    let below = range.start..range.end.min(hole.start);
    let above = range.start.max(hole.end)..range.end;
    [
        (!below.is_empty()).then_some(below),
        (!above.is_empty()).then_some(above),
    ]
}

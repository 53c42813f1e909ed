//! # Kernel-wide Memory State
//!
//! The memory manager, the heap and the heap's page source are globals of
//! the kernel, each in its own [`ExclusiveCell`]:
//!
//! ```text
//!  KernelHeap (GlobalAlloc)
//!     │ HEAP ─────────── free list hit? done
//!     │ HEAP_PAGES ───── bootstrap page, else ──► MEMORY (MemoryManager)
//!     └ HEAP ─────────── carve the fresh pages
//!
//!  PagesRef<KernelPagesRelease> dropped ───────► MEMORY.free_pages
//! ```
//!
//! No cell is borrowed while another one is entered from it, except
//! `HEAP_PAGES` → `MEMORY`, which never leads back to the heap: page tables
//! are kept inline in the root, and descriptors are boxed by [`alloc_pages`]
//! only after the manager is released.
//!
//! The manager is built at compile time by [`MemoryManager::empty`] and
//! brought up inside its cell, so it never passes through the boot stack.

use crate::bootstrap::{BootstrapPage, BootstrapPageSource};
use crate::heap::{Heap, MAX_ALIGN, PageSource};
use crate::mm::{AllocError, BootPageTables, KernelImage, MemoryManager};
use crate::pages::{Pages, PagesRef, PagesRelease};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_info::boot::{MemoryMap, MultibootInfo};
use kernel_info::memory::KERNEL_HIGH_VA;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_qemu::QemuLogger;
use kernel_sync::ExclusiveCell;
use kernel_vmem::arch::{MmuControl, WindowMapper};
use log::{LevelFilter, info};

pub type KernelMemoryManager = MemoryManager<KernelPagesRelease, WindowMapper, MmuControl>;

pub type KernelPages = PagesRef<KernelPagesRelease>;

/// The manager, confined to the kernel's single execution context.
struct Memory(KernelMemoryManager);

// Safety: memory management runs on one CPU; descriptors never leave it.
unsafe impl Send for Memory {}

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Info);

static MEMORY: ExclusiveCell<Memory> =
    ExclusiveCell::new(Memory(MemoryManager::empty(WindowMapper, MmuControl)));

static BOOTSTRAP_PAGE: BootstrapPage = BootstrapPage::new();

static HEAP: ExclusiveCell<Heap> = ExclusiveCell::new(Heap::new());

static HEAP_PAGES: ExclusiveCell<BootstrapPageSource<ManagerPages>> =
    ExclusiveCell::new(BootstrapPageSource::new(&BOOTSTRAP_PAGE, ManagerPages));

/// Gives runs whose last handle is gone back to the kernel memory manager.
pub enum KernelPagesRelease {}

impl PagesRelease for KernelPagesRelease {
    fn release(pages: Pages) {
        with_memory(|mm| mm.free_pages(pages));
    }
}

/// Heap pages from the memory manager, once it exists.
pub struct ManagerPages;

impl PageSource for ManagerPages {
    fn alloc_heap_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        MEMORY.with(|memory| {
            let mm = &mut memory.0;
            if mm.is_booted() {
                mm.alloc_heap_pages(count)
            } else {
                None
            }
        })
    }

    unsafe fn free_heap_pages(&mut self, pages: NonNull<u8>, count: usize) {
        // SAFETY: forwarded from the caller.
        with_memory(|mm| unsafe { mm.free_heap_pages(pages, count) });
    }
}

/// Run `f` on the kernel memory manager.
///
/// # Panics
/// Before [`init`], or when called from within another `with_memory`.
pub fn with_memory<T>(f: impl FnOnce(&mut KernelMemoryManager) -> T) -> T {
    MEMORY.with(|memory| {
        assert!(memory.0.is_booted(), "memory manager used before initialization");
        f(&mut memory.0)
    })
}

/// Frame described by a symbol of the kernel image.
const fn image_frame(va: VirtualAddress) -> Pages {
    Pages::new(va, PhysicalAddress::new(va.as_u32() - KERNEL_HIGH_VA), 1)
}

/// Bring up memory management on the boot page tables.
///
/// `boot_directory` and `boot_table` are the linked addresses of the boot
/// directory and of the page table mapping the kernel image.
///
/// # Safety
/// Call once (a second call panics), on the boot page tables with the identity mapping still in
/// place, with `multiboot` pointing at the bootloader's information.
pub unsafe fn init(
    multiboot: &MultibootInfo,
    boot_directory: VirtualAddress,
    boot_table: VirtualAddress,
    image: &KernelImage,
) {
    // Already installed on a second call; keep it.
    let _ = LOGGER.init();

    // Both boxes land on the bootstrap page.
    let boot = BootPageTables {
        directory: PagesRef::pinned(image_frame(boot_directory)),
        kernel_table: PagesRef::pinned(image_frame(boot_table)),
    };

    let memory_map = multiboot.has_memory_map().then(|| {
        // SAFETY: the identity mapping covers the bootloader's memory map.
        unsafe {
            let bytes = core::slice::from_raw_parts(
                multiboot.mmap_addr as usize as *const u8,
                multiboot.mmap_length as usize,
            );
            MemoryMap::new(bytes)
        }
    });

    MEMORY.with(|memory| {
        let mm = &mut memory.0;
        // SAFETY: the caller guarantees we run on the boot tables.
        unsafe { mm.adopt_boot(boot) };
        mm.init(memory_map, image);
        // SAFETY: nothing after this point touches the identity mapping.
        unsafe { mm.finish_boot(image) };

        info!(
            "memory: {} free frames, {} free kernel pages",
            mm.physical_ranges().free_pages(),
            mm.virtual_ranges().free_pages()
        );
    });
}

/// Allocate and map `count` pages.
///
/// # Errors
/// See [`MemoryManager::alloc_mapped`].
pub fn alloc_pages(count: u32) -> Result<KernelPages, AllocError> {
    let pages = with_memory(|mm| mm.alloc_mapped(count))?;
    Ok(PagesRef::new(pages))
}

/// The kernel's global allocator, serving alignments up to [`MAX_ALIGN`].
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOCATOR: kernel_alloc::kernel::KernelHeap = kernel_alloc::kernel::KernelHeap;
/// ```
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return ptr::null_mut();
        }

        let size = layout.size();
        if let Some(ptr) = HEAP.with(|heap| heap.take_free(size)) {
            return ptr.as_ptr();
        }

        let Some(pages) = Heap::pages_needed(size) else {
            return ptr::null_mut();
        };
        let Some(run) = HEAP_PAGES.with(|source| source.alloc_heap_pages(pages)) else {
            return ptr::null_mut();
        };

        // SAFETY: the source handed out `pages` fresh pages for this request.
        HEAP.with(|heap| unsafe { heap.carve(run, pages, size) })
            .as_ptr()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` came from `alloc`.
        HEAP.with(|heap| unsafe { heap.free(ptr) });
    }
}

//! # Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity map (boot only)       │
//!             │  User space (unused)            │
//! KERNEL_HIGH ├─────────────────────────────────┤ 0xC000_0000
//!             │  Kernel image (boot table)      │
//! KERNEL_HEAP ├─────────────────────────────────┤ 0xC040_0000
//!             │  Kernel pages & heap            │
//!             │  (virtual range manager)        │
//! PT_WINDOW   ├─────────────────────────────────┤ 0xFFC0_0000
//!             │  Page tables (self-map)         │
//!             └─────────────────────────────────┘ 0xFFFF_FFFF
//! ```

use kernel_memory_addresses::VirtualAddress;

/// The size of one page and of one physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Number of entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: u32 = 1024;

/// Bytes covered by one page-directory entry.
pub const BYTES_PER_DIRECTORY_ENTRY: u32 = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Start of the kernel half of every address space.
///
/// The kernel image is linked at `KERNEL_HIGH_VA + physical load address`.
pub const KERNEL_HIGH_VA: u32 = 0xC000_0000;

/// First virtual address handed out by the kernel page allocator.
///
/// The 4 MiB below it are covered by the boot page table that maps the kernel image.
pub const KERNEL_HEAP_VA: u32 = 0xC040_0000;

/// Page-directory slot that maps the directory onto itself.
pub const PAGE_TABLE_WINDOW_SLOT: u32 = ENTRIES_PER_TABLE - 1;

/// Where the page tables of the active address space become visible.
///
/// The table for directory slot `s` lives at `PAGE_TABLE_WINDOW_VA + s * PAGE_SIZE`;
/// the directory itself is the window's last page.
pub const PAGE_TABLE_WINDOW_VA: u32 = PAGE_TABLE_WINDOW_SLOT * BYTES_PER_DIRECTORY_ENTRY;

/// Number of pages between [`KERNEL_HEAP_VA`] and the page-table window.
pub const KERNEL_HEAP_PAGES: u32 = (PAGE_TABLE_WINDOW_VA - KERNEL_HEAP_VA) / PAGE_SIZE;

/// Typed form of [`KERNEL_HEAP_VA`].
pub const KERNEL_HEAP_START: VirtualAddress = VirtualAddress::new(KERNEL_HEAP_VA);

/// Typed form of [`PAGE_TABLE_WINDOW_VA`].
pub const PAGE_TABLE_WINDOW: VirtualAddress = VirtualAddress::new(PAGE_TABLE_WINDOW_VA);

/// Highest page-aligned physical address that still leaves room for one page below 4 GiB.
pub const PHYSICAL_LIMIT: u32 = 0u32.wrapping_sub(PAGE_SIZE);

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(KERNEL_HIGH_VA.is_multiple_of(BYTES_PER_DIRECTORY_ENTRY));
    assert!(KERNEL_HEAP_VA == KERNEL_HIGH_VA + BYTES_PER_DIRECTORY_ENTRY);
    assert!(PAGE_TABLE_WINDOW_VA == 0xFFC0_0000);
    assert!(KERNEL_HEAP_VA < PAGE_TABLE_WINDOW_VA);
    assert!(PHYSICAL_LIMIT == 0xFFFF_F000);
};

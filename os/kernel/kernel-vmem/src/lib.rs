//! # Virtual Memory Support
//!
//! Two-level i386 paging (32-bit, PAE disabled) for the kernel.
//!
//! ## What you get
//! - [`PageEntryBits`], the shared 32-bit layout of directory and table entries.
//! - A 4 KiB-aligned [`PageDirectory`] and [`PageTable`] with typed indices.
//! - [`PageTableRoot`], the driver that maps, unmaps and translates pages and
//!   allocates page tables on demand.
//! - A tiny collaborator interface ([`FrameAlloc`], [`FrameMapper`],
//!   [`PagingControl`]) that keeps the driver testable on the host.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD ──► PDE → PT ──► PTE → 4 KiB page
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | Root of an address space, referenced by CR3. Each entry covers 4 MiB and points to a PT. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical page. |
//!
//! ## The page-table window
//!
//! Page tables live in arbitrary physical frames, but the CPU only lets the
//! kernel touch virtual addresses. Directory slot 1023 therefore points at
//! the directory itself. Through that slot the directory is read as if it
//! were a page table, which makes every page table of the active address
//! space visible at a fixed address:
//!
//! ```text
//! table for slot s  →  0xFFC0_0000 + s * 4 KiB
//! directory itself  →  0xFFFF_F000
//! ```
//!
//! A new page table therefore needs nothing but a physical frame, and never
//! a virtual mapping of its own (see [`table_window_address`]).

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(target_arch = "x86")]
pub mod arch;
mod directory;
mod entry;
mod root;
mod table;

pub use crate::directory::{DirectoryIndex, PageDirectory, PdEntry};
pub use crate::entry::PageEntryBits;
pub use crate::root::PageTableRoot;
pub use crate::table::{PageTable, PtEntry, TableIndex};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Where a page-table frame can be found: its physical address (for the
/// hardware) and a virtual address (for the kernel).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameLocation {
    pub va: VirtualAddress,
    pub pa: PhysicalAddress,
}

/// A frame that holds a page directory or a page table.
///
/// The root keeps these for as long as the table is in use; dropping one
/// gives the frame back to whoever handed it out.
pub trait TableFrame {
    fn location(&self) -> FrameLocation;
}

/// Source of physical 4 KiB frames for page tables.
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    type Frame: TableFrame;

    /// Allocate one *physical* frame for the page table that will be visible
    /// at `window_va` once it is installed.
    fn alloc_table_frame(&mut self, window_va: VirtualAddress) -> Option<Self::Frame>;
}

/// Converts a table frame into a usable reference in the current address space.
///
/// Typical patterns:
/// - **Kernel**: the frame's virtual address (window or kernel image) is dereferenced.
/// - **Tests**: the physical address keys into simulated RAM.
pub trait FrameMapper {
    /// # Safety
    /// - `frame` must be mapped as writable in the current page tables for `&mut T`.
    /// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid for `'a`.
    /// - Type `T` must match the bytes at the frame (no aliasing UB).
    unsafe fn frame_to_mut<'a, T>(&self, frame: FrameLocation) -> &'a mut T;
}

impl<M: FrameMapper + ?Sized> FrameMapper for &M {
    #[inline]
    unsafe fn frame_to_mut<'a, T>(&self, frame: FrameLocation) -> &'a mut T {
        unsafe { (**self).frame_to_mut(frame) }
    }
}

/// The MMU controls a memory manager needs.
pub trait PagingControl {
    /// Make the directory at `directory` the active root (reloads CR3, which
    /// also flushes the TLB).
    ///
    /// # Safety
    /// The directory must map the currently executing code and stack.
    unsafe fn load_root(&self, directory: PhysicalAddress);

    /// Drop all non-global TLB entries.
    ///
    /// # Safety
    /// Privileged instruction; must run at CPL0.
    unsafe fn flush_tlb(&self);

    /// Drop the TLB entry for the page containing `va`.
    ///
    /// # Safety
    /// Privileged instruction; must run at CPL0.
    unsafe fn invalidate_page(&self, va: VirtualAddress);

    /// Make read-only pages read-only for the kernel too (CR0.WP).
    ///
    /// # Safety
    /// Privileged instruction; must run at CPL0. The kernel must not write
    /// to its read-only pages afterwards.
    unsafe fn enforce_write_protect(&self);
}

/// Failure to install a mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames for page tables")]
    OutOfFrames,
}

/// Address at which the page table for `slot` is visible through the window.
///
/// ```rust
/// # use kernel_vmem::{table_window_address, DirectoryIndex};
/// # use kernel_memory_addresses::VirtualAddress;
/// assert_eq!(table_window_address(DirectoryIndex::new(0)), VirtualAddress::new(0xFFC0_0000));
/// assert_eq!(table_window_address(DirectoryIndex::new(769)), VirtualAddress::new(0xFFF0_1000));
/// assert_eq!(table_window_address(DirectoryIndex::WINDOW), VirtualAddress::new(0xFFFF_F000));
/// ```
#[inline]
#[must_use]
pub const fn table_window_address(slot: DirectoryIndex) -> VirtualAddress {
    match info::PAGE_TABLE_WINDOW.checked_add(slot.as_usize() as u32 * info::PAGE_SIZE) {
        Some(va) => va,
        None => panic!("page-table window slot out of range"),
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u32`.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Simulated physical memory for the driver tests.

    use super::*;
    use core::cell::RefCell;
    use std::collections::BTreeMap;

    /// A 4 KiB-aligned raw frame.
    #[repr(C, align(4096))]
    pub struct Aligned4K([u8; 4096]);

    /// Frames keyed by physical address, created zeroed on first touch.
    #[derive(Default)]
    pub struct TestPhys {
        frames: RefCell<BTreeMap<u32, Box<Aligned4K>>>,
    }

    impl TestPhys {
        pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
            let frames = self.frames.borrow();
            let frame = &frames[&(pa.as_u32() & !0xFFF)];
            let at = (pa.as_u32() & 0xFFF) as usize;
            u32::from_le_bytes(frame.0[at..at + 4].try_into().unwrap())
        }
    }

    impl FrameMapper for TestPhys {
        unsafe fn frame_to_mut<'a, T>(&self, frame: FrameLocation) -> &'a mut T {
            assert_eq!(frame.pa.as_u32() & 0xFFF, 0);
            let mut frames = self.frames.borrow_mut();
            let slot = frames
                .entry(frame.pa.as_u32())
                .or_insert_with(|| Box::new(Aligned4K([0; 4096])));
            let ptr: *mut Aligned4K = &raw mut **slot;
            // SAFETY: boxed frames never move; the caller promises `T` matches.
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct TestFrame(pub FrameLocation);

    impl TableFrame for TestFrame {
        fn location(&self) -> FrameLocation {
            self.0
        }
    }

    /// Hands out consecutive frames until `remaining` reaches zero.
    pub struct BumpAlloc {
        pub next: u32,
        pub remaining: usize,
        pub handed_out: Vec<FrameLocation>,
    }

    impl BumpAlloc {
        pub const fn new(start: u32, remaining: usize) -> Self {
            Self {
                next: start,
                remaining,
                handed_out: Vec::new(),
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        type Frame = TestFrame;

        fn alloc_table_frame(&mut self, window_va: VirtualAddress) -> Option<TestFrame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            let loc = FrameLocation {
                va: window_va,
                pa: PhysicalAddress::new(self.next),
            };
            self.next += 4096;
            self.handed_out.push(loc);
            Some(TestFrame(loc))
        }
    }
}

//! # Kernel Memory Allocation
//!
//! This crate provides the memory allocation core of the kernel: free-range
//! bookkeeping for kernel virtual space and physical frames, reference-counted
//! page runs mapped through the page-table driver of `kernel-vmem`, and a
//! small-object heap carved out of those pages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Heap ([`heap`])                     │
//! │    • Boundary-tag chunks, first fit                 │
//! │    • Coalescing of free neighbours                  │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ PageSource (bootstrap page first)
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Memory Manager ([`mm`])                  │
//! │    • Kernel virtual + physical range managers       │
//! │    • Active page-table root (kernel-vmem)           │
//! │    • Refcounted page runs ([`pages`])               │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Address-Range Manager ([`range`])          │
//! │    • Disjoint, maximal free regions                 │
//! │    • AVL by address and by size ([`avl`])           │
//! │    • Fixed record storage, no heap ([`slab`])       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Layout Integration
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity map (until boot ends) │
//! 0xC000_0000 ├─────────────────────────────────┤
//!             │  Kernel image                   │
//! 0xC040_0000 ├─────────────────────────────────┤
//!             │  Virtual range manager          │
//!             │  (page runs, heap pages)        │
//! 0xFFC0_0000 ├─────────────────────────────────┤
//!             │  Page-table window              │
//!             └─────────────────────────────────┘
//! ```
//!
//! Physical frames below 4 GiB reported as available by the bootloader,
//! minus the kernel image, feed the physical range manager.
//!
//! ## Usage Patterns
//!
//! ### Tracking free ranges
//! ```rust
//! use kernel_alloc::range::AddressRangeManager;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mut frames = Box::new(AddressRangeManager::<PhysicalAddress>::new());
//! frames.add_free_range(PhysicalAddress::new(0x1000), 4).unwrap();
//!
//! let a = frames.allocate(2).unwrap();
//! assert_eq!(a, PhysicalAddress::new(0x1000));
//! frames.free(a, 2);
//! assert_eq!(frames.free_pages(), 4);
//! ```
//!
//! ### Kernel bring-up (i386)
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: kernel_alloc::kernel::KernelHeap = kernel_alloc::kernel::KernelHeap;
//!
//! unsafe { kernel_alloc::kernel::init(multiboot, boot_directory, boot_table, &image) };
//! let pages = kernel_alloc::kernel::alloc_pages(4)?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod avl;
pub mod bootstrap;
pub mod heap;
#[cfg(target_arch = "x86")]
pub mod kernel;
pub mod mm;
pub mod pages;
pub mod range;
pub mod slab;

pub use crate::bootstrap::{BootstrapPage, BootstrapPageSource};
pub use crate::heap::{Heap, MAX_ALIGN, PageSource, TaggedSize};
pub use crate::mm::{AllocError, BootPageTables, KernelFrame, KernelImage, MemoryManager};
pub use crate::pages::{Pages, PagesRef, PagesRelease};
pub use crate::range::{AddressRangeManager, RangeError};

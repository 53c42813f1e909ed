//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and the boot interface
//! contracts that govern the kernel's initialization. It is the single source
//! of truth for the address-space split shared by the page-table driver, the
//! memory manager and the early boot code.
//!
//! ## Architecture
//!
//! The crate is organized into two modules:
//!
//! ### Boot Information ([`boot`])
//! Defines the bootloader-to-kernel handoff interface:
//! * **Multiboot Information**: the `#[repr(C)]` structure GRUB hands to the kernel
//! * **Memory Map**: a safe reader over the BIOS memory map entries
//!
//! ### Memory Layout ([`memory`])
//! Establishes the kernel's virtual memory architecture:
//! * **Higher Half Design**: kernel execution at `0xC000_0000` and above
//! * **Kernel Heap Window**: virtual space handed out by the page allocator
//! * **Page-Table Window**: the recursive directory slot exposing all page tables
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   Identity map of the first     │
//!             │   4 MiB (removed after boot)    │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_HIGH_VA
//!             │   Kernel text, rodata, data     │
//! 0xC040_0000 ├─────────────────────────────────┤ KERNEL_HEAP_VA
//!             │   Kernel pages and heap         │
//! 0xFFC0_0000 ├─────────────────────────────────┤ PAGE_TABLE_WINDOW_VA
//!             │   Page tables of the active     │
//!             │   directory (self-mapped)       │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │
//!             │  (BIOS, VGA, DMA buffers)       │
//! 0x0010_0000 ├─────────────────────────────────┤ kernel begin
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤ kernel end
//!             │    Available RAM                │
//!             │  (physical range manager)       │
//!             └─────────────────────────────────┘
//! ```
//!
//! ## Configuration Management
//!
//! All layout constants are `const` values checked by compile-time
//! assertions, so an inconsistent layout fails the build rather than the boot.
//!
//! ## Safety Guarantees
//!
//! The crate is marked `#![deny(unsafe_code)]`: turning the bootloader's
//! physical pointers into slices is the caller's business.
//!
//! ## Usage Patterns
//!
//! ```rust
//! use kernel_info::boot::{MemoryKind, MemoryMap};
//! use kernel_info::memory::{KERNEL_HEAP_PAGES, PAGE_SIZE};
//!
//! let raw: [u8; 24] = [
//!     20, 0, 0, 0, // size
//!     0, 0, 0x10, 0, 0, 0, 0, 0, // base = 1 MiB
//!     0, 0, 0, 1, 0, 0, 0, 0, // len = 16 MiB
//!     1, 0, 0, 0, // available
//! ];
//! let map = MemoryMap::new(&raw);
//! let usable: u64 = map
//!     .iter()
//!     .filter(|r| r.kind == MemoryKind::Available)
//!     .map(|r| r.len)
//!     .sum();
//! assert_eq!(usable, 16 * 1024 * 1024);
//! assert!(KERNEL_HEAP_PAGES * PAGE_SIZE < 1 << 30);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;

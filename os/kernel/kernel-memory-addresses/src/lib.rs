//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses used in i386
//! paging and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values.
//!
//! | Type | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 32-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | Refers to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] | Refers to physical memory or MMIO regions. |
//!
//! Code that is generic over the address kind (such as the free-range
//! managers, which exist once for virtual and once for physical space) is
//! written against [`TypedAddress`].
//!
//! ## Page Sizes
//!
//! The two granularities of 32-bit non-PAE paging are available as marker
//! types that implement [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages (one page-table entry)
//! - [`Size4M`] — 4 MiB (one page-directory entry)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC000_1234);
//! assert_eq!(va.align_down::<Size4K>().as_u32(), 0xC000_1000);
//! assert_eq!(va.align_down::<Size4M>().as_u32(), 0xC000_0000);
//!
//! // Raw values round-trip through the generic interface.
//! let pa = PhysicalAddress::from_raw(0x0010_0000);
//! assert_eq!(pa.into_raw(), 0x0010_0000);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys or for FFI use.
//! - Alignment and offset calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

use core::fmt;

pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::VirtualAddress {}
    impl Sealed for super::PhysicalAddress {}
}

/// An address of a known kind ([`VirtualAddress`] or [`PhysicalAddress`]).
///
/// Allows one allocator implementation to serve both address spaces without
/// letting the two mix.
pub trait TypedAddress:
    sealed::Sealed + Copy + Eq + Ord + fmt::Debug + fmt::Display
{
    fn from_raw(raw: u32) -> Self;
    fn into_raw(self) -> u32;
}

impl TypedAddress for VirtualAddress {
    #[inline]
    fn from_raw(raw: u32) -> Self {
        Self::new(raw)
    }

    #[inline]
    fn into_raw(self) -> u32 {
        self.as_u32()
    }
}

impl TypedAddress for PhysicalAddress {
    #[inline]
    fn from_raw(raw: u32) -> Self {
        Self::new(raw)
    }

    #[inline]
    fn into_raw(self) -> u32 {
        self.as_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x12000);
        assert_eq!(a.align_up::<Size4K>(), Some(MemoryAddress::new(0x13000)));
        assert_eq!(a.offset::<Size4K>(), 0x345);
        assert!(!a.is_aligned::<Size4K>());
        assert!(MemoryAddress::new(0x40_0000).is_aligned::<Size4M>());
    }

    #[test]
    fn align_up_of_aligned_is_identity() {
        let va = VirtualAddress::new(0xC040_0000);
        assert_eq!(va.align_up::<Size4K>(), Some(va));
        assert_eq!(va.align_up::<Size4M>(), Some(va));
    }

    #[test]
    fn align_up_at_top_of_address_space() {
        assert_eq!(VirtualAddress::new(0xFFFF_F001).align_up::<Size4K>(), None);
        assert_eq!(
            PhysicalAddress::new(0xFFFF_F000).align_up::<Size4K>(),
            Some(PhysicalAddress::new(0xFFFF_F000))
        );
    }

    #[test]
    fn checked_add_detects_wrap() {
        assert_eq!(
            PhysicalAddress::new(0xFFFF_F000).checked_add(0x1000),
            None
        );
        assert_eq!(
            PhysicalAddress::new(0xFFFF_E000).checked_add(0x1000),
            Some(PhysicalAddress::new(0xFFFF_F000))
        );
    }

    #[test]
    fn debug_and_display() {
        assert_eq!(format!("{:?}", VirtualAddress::new(0xC000_0000)), "VA(0xC0000000)");
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x00001000)");
        assert_eq!(format!("{}", PhysicalAddress::new(0x1000)), "0x00001000");
    }

    #[test]
    fn typed_roundtrip() {
        fn bump<A: TypedAddress>(a: A) -> A {
            A::from_raw(a.into_raw() + 0x1000)
        }
        assert_eq!(bump(VirtualAddress::new(0x1000)), VirtualAddress::new(0x2000));
        assert_eq!(bump(PhysicalAddress::new(0)), PhysicalAddress::new(0x1000));
    }
}

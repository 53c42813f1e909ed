//! i386 implementations of the paging collaborators.

use crate::{FrameLocation, FrameMapper, PagingControl};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Reaches table frames through their virtual address: the page-table
/// window for tables of the active root, the kernel image or heap for
/// directories.
#[derive(Copy, Clone, Debug, Default)]
pub struct WindowMapper;

impl FrameMapper for WindowMapper {
    #[inline]
    unsafe fn frame_to_mut<'a, T>(&self, frame: FrameLocation) -> &'a mut T {
        unsafe { &mut *frame.va.as_mut_ptr::<T>() }
    }
}

/// CR0, CR3 and `invlpg` on the executing CPU.
#[derive(Copy, Clone, Debug, Default)]
pub struct MmuControl;

impl PagingControl for MmuControl {
    unsafe fn load_root(&self, directory: PhysicalAddress) {
        unsafe { Cr3::from_page_directory(directory, false, false).store_unsafe() }
    }

    unsafe fn flush_tlb(&self) {
        unsafe { Cr3::load_unsafe().store_unsafe() }
    }

    unsafe fn invalidate_page(&self, va: VirtualAddress) {
        unsafe { invalidate_tlb_page(va) }
    }

    unsafe fn enforce_write_protect(&self) {
        unsafe { Cr0::load_unsafe().with_wp_write_protect(true).store_unsafe() }
    }
}

/// Invalidate the TLB entry for the page containing `va`.
///
/// # Safety
/// Privileged instruction; must run at CPL0.
#[inline(always)]
pub unsafe fn invalidate_tlb_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}

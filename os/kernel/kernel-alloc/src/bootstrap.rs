//! # Bootstrap Page
//!
//! The heap needs pages, page runs need descriptors, and descriptors live on
//! the heap. To break the cycle at boot, one page is reserved in the kernel
//! image and handed to the heap before the memory manager can serve anything.
//!
//! [`BootstrapPageSource`] serves the first one-page request from that page
//! while it is unused; everything else goes to the wrapped source.

use crate::heap::{PAGE_SIZE, PageSource};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use log::trace;

/// A page-aligned page of static storage.
#[repr(C, align(4096))]
pub struct BootstrapPage(UnsafeCell<[u8; PAGE_SIZE]>);

// Safety: the contents are only reached through the one `BootstrapPageSource` handing it out.
unsafe impl Sync for BootstrapPage {}

impl Default for BootstrapPage {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapPage {
    #[must_use]
    pub const fn new() -> Self {
        Self(UnsafeCell::new([0; PAGE_SIZE]))
    }

    fn as_non_null(&self) -> NonNull<u8> {
        // SAFETY: `UnsafeCell::get` never returns null.
        unsafe { NonNull::new_unchecked(self.0.get().cast()) }
    }
}

/// A [`PageSource`] that serves the bootstrap page first.
pub struct BootstrapPageSource<S> {
    page: &'static BootstrapPage,
    in_use: bool,
    next: S,
}

impl<S> BootstrapPageSource<S> {
    /// `page` must not be handed to any other source.
    #[must_use]
    pub const fn new(page: &'static BootstrapPage, next: S) -> Self {
        Self {
            page,
            in_use: false,
            next,
        }
    }

    /// Whether the bootstrap page is currently handed out.
    #[inline]
    #[must_use]
    pub const fn in_use(&self) -> bool {
        self.in_use
    }

    /// The source serving everything but the bootstrap page.
    #[inline]
    pub const fn next_mut(&mut self) -> &mut S {
        &mut self.next
    }
}

impl<S: PageSource> PageSource for BootstrapPageSource<S> {
    fn alloc_heap_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        if count == 1 && !self.in_use {
            self.in_use = true;
            trace!("heap starts on the bootstrap page");
            return Some(self.page.as_non_null());
        }
        self.next.alloc_heap_pages(count)
    }

    /// # Panics
    /// If the bootstrap page is released while not handed out, or as part
    /// of a larger run.
    unsafe fn free_heap_pages(&mut self, pages: NonNull<u8>, count: usize) {
        if pages == self.page.as_non_null() {
            assert!(self.in_use, "bootstrap page released twice");
            assert_eq!(count, 1, "bootstrap page released as {count} pages");
            self.in_use = false;
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe { self.next.free_heap_pages(pages, count) }
    }
}

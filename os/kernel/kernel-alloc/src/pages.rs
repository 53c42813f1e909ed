//! # Page Runs
//!
//! A [`Pages`] describes one contiguous run of physical frames mapped at a
//! virtual address. Several subsystems can hold on to the same run, so it
//! is shared through [`PagesRef`], a non-atomic reference-counted handle:
//!
//! ```text
//!  PagesRef ─┐
//!  PagesRef ─┼──► Pages { va, pa, count, refs = 3 }
//!  PagesRef ─┘
//!                     │ last handle dropped (refs = 0)
//!                     ▼
//!              R::release(pages)   → unmap, free PA, free VA
//! ```
//!
//! Descriptors that must outlive every handle (the boot page directory and
//! boot page table) are created with [`PagesRef::pinned`], which holds one
//! extra reference that is never given back.

use alloc::boxed::Box;
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{FrameLocation, TableFrame};

/// A contiguous run of mapped pages.
pub struct Pages {
    va: VirtualAddress,
    pa: PhysicalAddress,
    count: u32,
    refs: Cell<u32>,
}

impl Pages {
    /// A descriptor holding one reference.
    #[must_use]
    pub const fn new(va: VirtualAddress, pa: PhysicalAddress, count: u32) -> Self {
        Self {
            va,
            pa,
            count,
            refs: Cell::new(1),
        }
    }

    #[inline]
    #[must_use]
    pub const fn va(&self) -> VirtualAddress {
        self.va
    }

    #[inline]
    #[must_use]
    pub const fn pa(&self) -> PhysicalAddress {
        self.pa
    }

    /// Number of pages in the run.
    #[inline]
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    /// Give up one reference; returns the remaining count.
    pub(crate) fn unref(&self) -> u32 {
        let refs = self.refs.get();
        assert!(refs > 0, "{self:?} released more often than referenced");
        self.refs.set(refs - 1);
        refs - 1
    }
}

impl fmt::Debug for Pages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pages({:?} -> {:?}, {} pages, refs {})",
            self.va,
            self.pa,
            self.count,
            self.refs.get()
        )
    }
}

impl TableFrame for Pages {
    fn location(&self) -> FrameLocation {
        FrameLocation {
            va: self.va,
            pa: self.pa,
        }
    }
}

/// What happens to a run once its last [`PagesRef`] is gone.
pub trait PagesRelease {
    /// Called with the reference count at zero.
    fn release(pages: Pages);
}

/// Shared handle to a [`Pages`] run.
///
/// Cloning increments the reference count; dropping decrements it and hands
/// the run to `R` when the count reaches zero.
pub struct PagesRef<R: PagesRelease> {
    ptr: NonNull<Pages>,
    _release: PhantomData<(Box<Pages>, R)>,
}

impl<R: PagesRelease> PagesRef<R> {
    /// Take ownership of a freshly described run.
    ///
    /// # Panics
    /// If `pages` does not hold exactly one reference.
    #[must_use]
    pub fn new(pages: Pages) -> Self {
        assert_eq!(pages.ref_count(), 1, "new handle for shared {pages:?}");
        Self {
            ptr: NonNull::from(Box::leak(Box::new(pages))),
            _release: PhantomData,
        }
    }

    /// Like [`new`](Self::new), but the run is never released: one extra
    /// reference is taken and never dropped.
    #[must_use]
    pub fn pinned(pages: Pages) -> Self {
        let this = Self::new(pages);
        core::mem::forget(this.clone());
        this
    }

    /// Current reference count of the run behind `this`.
    #[inline]
    #[must_use]
    pub fn ref_count(this: &Self) -> u32 {
        this.refs.get()
    }

    /// Whether both handles refer to the same run.
    #[inline]
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<R: PagesRelease> Deref for PagesRef<R> {
    type Target = Pages;

    fn deref(&self) -> &Pages {
        // SAFETY: the descriptor lives until the last handle is dropped.
        unsafe { self.ptr.as_ref() }
    }
}

impl<R: PagesRelease> Clone for PagesRef<R> {
    fn clone(&self) -> Self {
        let refs = self.refs.get();
        self.refs.set(
            refs.checked_add(1)
                .unwrap_or_else(|| panic!("reference count of {self:?} overflows")),
        );
        Self {
            ptr: self.ptr,
            _release: PhantomData,
        }
    }
}

impl<R: PagesRelease> Drop for PagesRef<R> {
    fn drop(&mut self) {
        if self.unref() == 0 {
            // SAFETY: the pointer came from `Box::leak` and this was the last handle.
            let pages = unsafe { Box::from_raw(self.ptr.as_ptr()) };
            R::release(*pages);
        }
    }
}

impl<R: PagesRelease> fmt::Debug for PagesRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<R: PagesRelease> TableFrame for PagesRef<R> {
    fn location(&self) -> FrameLocation {
        (**self).location()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        pub static RELEASED: RefCell<Vec<(u32, u32, u32)>> = const { RefCell::new(Vec::new()) };
    }

    /// Records every release in [`RELEASED`] of the current test thread.
    pub struct RecordRelease;

    impl PagesRelease for RecordRelease {
        fn release(pages: Pages) {
            assert_eq!(pages.ref_count(), 0);
            RELEASED.with_borrow_mut(|r| {
                r.push((pages.va().as_u32(), pages.pa().as_u32(), pages.count()));
            });
        }
    }

    pub fn released() -> Vec<(u32, u32, u32)> {
        RELEASED.with_borrow(Clone::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordRelease, released};
    use super::*;

    fn run(va: u32, pa: u32, count: u32) -> Pages {
        Pages::new(VirtualAddress::new(va), PhysicalAddress::new(pa), count)
    }

    #[test]
    fn last_handle_releases() {
        let a = PagesRef::<RecordRelease>::new(run(0xC040_0000, 0x0020_0000, 2));
        let b = a.clone();
        assert_eq!(PagesRef::ref_count(&a), 2);
        assert!(PagesRef::ptr_eq(&a, &b));

        drop(a);
        assert!(released().is_empty());
        assert_eq!(PagesRef::ref_count(&b), 1);

        drop(b);
        assert_eq!(released(), [(0xC040_0000, 0x0020_0000, 2)]);
    }

    #[test]
    fn pinned_run_is_never_released() {
        let a = PagesRef::<RecordRelease>::pinned(run(0xC010_0000, 0x0010_0000, 1));
        assert_eq!(PagesRef::ref_count(&a), 2);
        let b = a.clone();
        drop(a);
        drop(b);
        assert!(released().is_empty());
    }

    #[test]
    fn handle_exposes_frame_location() {
        let a = PagesRef::<RecordRelease>::pinned(run(0xFFF0_1000, 0x0030_0000, 1));
        assert_eq!(
            a.location(),
            FrameLocation {
                va: VirtualAddress::new(0xFFF0_1000),
                pa: PhysicalAddress::new(0x0030_0000),
            }
        );
        assert_eq!(format!("{a:?}"), "Pages(VA(0xFFF01000) -> PA(0x00300000), 1 pages, refs 2)");
    }

    #[test]
    #[should_panic(expected = "new handle for shared")]
    fn wrapping_a_shared_run_panics() {
        let pages = run(0x1000, 0x1000, 1);
        pages.refs.set(2);
        let _ = PagesRef::<RecordRelease>::new(pages);
    }
}

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Interior mutability for kernel-global state in a single execution context.
///
/// Unlike a lock, an `ExclusiveCell` never waits: a second borrow while the
/// first one is alive is a bug (re-entering an allocator from within itself,
/// for example) and panics instead of deadlocking or aliasing.
pub struct ExclusiveCell<T> {
    /// borrow state
    /// * `false`: free
    /// * `true`: borrowed
    borrowed: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: at most one guard exists at any time; only T: Send may cross threads.
unsafe impl<T: Send> Sync for ExclusiveCell<T> {}

impl<T> ExclusiveCell<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Borrow if nobody else does; returns immediately.
    #[inline]
    pub fn try_borrow(&self) -> Option<ExclusiveGuard<'_, T>> {
        if self
            .borrowed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ExclusiveGuard { cell: self })
        } else {
            None
        }
    }

    /// Borrow exclusively.
    ///
    /// # Panics
    /// If the cell is already borrowed.
    #[inline]
    #[track_caller]
    pub fn borrow(&self) -> ExclusiveGuard<'_, T> {
        match self.try_borrow() {
            Some(guard) => guard,
            None => panic!("ExclusiveCell<{}> re-entered", core::any::type_name::<T>()),
        }
    }

    /// Closure convenience, built on the guard.
    ///
    /// # Panics
    /// If the cell is already borrowed.
    #[inline]
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.borrow();
        f(&mut g)
    }

    /// Like [`with`](Self::with), but yields `None` instead of panicking when borrowed.
    #[inline]
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut g = self.try_borrow()?;
        Some(f(&mut g))
    }

    /// Whether a guard is currently alive.
    #[inline]
    pub fn is_borrowed(&self) -> bool {
        self.borrowed.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no borrow possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for ExclusiveCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct ExclusiveGuard<'a, T> {
    cell: &'a ExclusiveCell<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.cell.inner.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.inner.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.borrowed.store(false, Ordering::Release);
    }
}

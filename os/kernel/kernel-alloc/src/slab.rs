//! Fixed-capacity record storage.
//!
//! The range managers must never call into the heap (the heap itself is fed by
//! them), so their region records live in a [`Slab`]: an inline array of `N`
//! slots with a vacant list threaded through the free ones. Records are
//! addressed by [`Handle`]s, which stay valid until the record is removed.

use core::fmt;
use core::ops::{Index, IndexMut};

/// Stable index of an occupied slab slot.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Handle(u32);

impl Handle {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Slot<T> {
    Occupied(T),
    /// Next vacant slot below the high-water mark.
    Vacant(Option<Handle>),
}

pub struct Slab<T, const N: usize> {
    slots: [Slot<T>; N],
    /// Head of the vacant list.
    vacant: Option<Handle>,
    /// Slots at and above this index were never used.
    untouched: usize,
    len: usize,
}

impl<T, const N: usize> Slab<T, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { Slot::Vacant(None) }; N],
            vacant: None,
            untouched: 0,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len == N
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Store `value` and return its handle.
    ///
    /// # Errors
    /// Gives `value` back when every slot is occupied.
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        let handle = if let Some(handle) = self.vacant {
            let Slot::Vacant(next) = self.slots[handle.index()] else {
                unreachable!("vacant list points at occupied slot {handle:?}");
            };
            self.vacant = next;
            handle
        } else if self.untouched < N {
            #[allow(clippy::cast_possible_truncation)]
            let handle = Handle(self.untouched as u32);
            self.untouched += 1;
            handle
        } else {
            return Err(value);
        };

        self.slots[handle.index()] = Slot::Occupied(value);
        self.len += 1;
        Ok(handle)
    }

    /// Take the value out of `handle`'s slot.
    ///
    /// # Panics
    /// If the slot is vacant.
    pub fn remove(&mut self, handle: Handle) -> T {
        let slot = core::mem::replace(&mut self.slots[handle.index()], Slot::Vacant(self.vacant));
        match slot {
            Slot::Occupied(value) => {
                self.vacant = Some(handle);
                self.len -= 1;
                value
            }
            Slot::Vacant(next) => {
                self.slots[handle.index()] = Slot::Vacant(next);
                panic!("removing vacant slab slot {handle:?}");
            }
        }
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index())? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant(_) => None,
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index())? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant(_) => None,
        }
    }
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Index<Handle> for Slab<T, N> {
    type Output = T;

    #[track_caller]
    fn index(&self, handle: Handle) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("stale slab handle {handle:?}"),
        }
    }
}

impl<T, const N: usize> IndexMut<Handle> for Slab<T, N> {
    #[track_caller]
    fn index_mut(&mut self, handle: Handle) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("stale slab handle {handle:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_until_full() {
        let mut slab = Slab::<u32, 3>::new();
        let a = slab.insert(1).unwrap();
        let b = slab.insert(2).unwrap();
        let c = slab.insert(3).unwrap();
        assert!(slab.is_full());
        assert_eq!(slab.insert(4), Err(4));
        assert_eq!((slab[a], slab[b], slab[c]), (1, 2, 3));
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut slab = Slab::<u32, 2>::new();
        let a = slab.insert(10).unwrap();
        let _b = slab.insert(20).unwrap();
        assert_eq!(slab.remove(a), 10);
        assert_eq!(slab.len(), 1);
        assert!(slab.get(a).is_none());

        let c = slab.insert(30).unwrap();
        assert_eq!(c, a);
        assert_eq!(slab[c], 30);
        assert!(slab.insert(40).is_err());
    }

    #[test]
    fn drop_releases_every_value_once() {
        use std::rc::Rc;

        let tracker = Rc::new(());
        {
            let mut slab = Slab::<Rc<()>, 4>::new();
            let a = slab.insert(tracker.clone()).unwrap();
            slab.insert(tracker.clone()).unwrap();
            drop(slab.remove(a));
            slab.insert(tracker.clone()).unwrap();
            assert_eq!(Rc::strong_count(&tracker), 3);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    #[should_panic(expected = "vacant")]
    fn double_remove_panics() {
        let mut slab = Slab::<u8, 1>::new();
        let a = slab.insert(1).unwrap();
        slab.remove(a);
        slab.remove(a);
    }
}

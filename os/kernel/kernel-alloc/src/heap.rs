//! # Boundary-Tag Heap
//!
//! A first-fit allocator for small kernel objects, carved out of whole pages
//! obtained from a [`PageSource`].
//!
//! ## Chunk layout
//!
//! Every chunk is framed by two one-word boundary tags holding the payload
//! size and two flags ([`TaggedSize`]):
//!
//! ```text
//!         ┌────────┬───────────────────────────────┬────────┐
//!         │ Header │ payload (size bytes)          │ Footer │
//!         └────────┴───────────────────────────────┴────────┘
//!                  ^ 16-byte aligned pointer handed out
//! ```
//!
//! * the `used` flag is kept in both tags;
//! * the header's `neighbour` flag says "another chunk ends right before
//!   me", the footer's says "another chunk starts right after me".
//!
//! Free chunks keep a doubly-linked [`FreeNode`] in their payload, which
//! bounds the smallest payload a chunk may have.
//!
//! ## Fresh pages
//!
//! A page run from the source becomes one free chunk spanning all of it:
//!
//! ```text
//! page ┌─────┬────────┬─────────────────────────────────┬────────┐
//!      │ pad │ Header │ payload                         │ Footer │
//!      └─────┴────────┴─────────────────────────────────┴────────┘
//!                     ^ page + 16                        page end ^
//! ```
//!
//! ## Allocation and release
//!
//! Request sizes are rounded so that `header + payload + footer` stays a
//! multiple of [`MAX_ALIGN`]; this keeps every chunk split off the front of
//! another chunk aligned. A chunk larger than needed is split when the rest
//! can still hold a free node, and the rest goes to the front of the free
//! list. Freed chunks merge with free neighbours on both sides.
//!
//! Pages are never given back to the source.

use core::fmt;
use core::ptr::{self, NonNull};

/// Alignment of every pointer returned by the heap.
pub const MAX_ALIGN: usize = 16;

/// Page granularity of the [`PageSource`].
pub const PAGE_SIZE: usize = kernel_info::memory::PAGE_SIZE as usize;

const HEADER: usize = size_of::<TaggedSize>();
const FOOTER: usize = size_of::<TaggedSize>();

/// Gap between the start of a fresh page run and its first header.
const FRESH_PAD: usize = if HEADER > MAX_ALIGN - HEADER {
    HEADER
} else {
    MAX_ALIGN - HEADER
};

/// Smallest payload of any chunk: it must hold a free node once released.
const MIN_PAYLOAD: usize = round_request(size_of::<FreeNode>());

const _: () = {
    assert!(HEADER <= MAX_ALIGN);
    assert!((FRESH_PAD + HEADER).is_multiple_of(MAX_ALIGN));
    assert!(align_of::<FreeNode>() <= MAX_ALIGN);
    assert!(PAGE_SIZE.is_multiple_of(MAX_ALIGN));
};

/// Whole pages handed to the heap.
pub trait PageSource {
    /// `count` contiguous, writable pages; `None` when out of memory.
    fn alloc_heap_pages(&mut self, count: usize) -> Option<NonNull<u8>>;

    /// Give back pages obtained from [`alloc_heap_pages`](Self::alloc_heap_pages).
    ///
    /// # Safety
    /// `pages` and `count` must describe exactly one earlier allocation of
    /// this source, and nothing may use that memory afterwards.
    unsafe fn free_heap_pages(&mut self, pages: NonNull<u8>, count: usize);
}

impl<S: PageSource + ?Sized> PageSource for &mut S {
    fn alloc_heap_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
        (**self).alloc_heap_pages(count)
    }

    unsafe fn free_heap_pages(&mut self, pages: NonNull<u8>, count: usize) {
        unsafe { (**self).free_heap_pages(pages, count) }
    }
}

/// A chunk's payload size with two flag bits packed into the low bits.
///
/// | Bit | Meaning |
/// |:----|:--------|
/// | 0   | neighbour: a chunk precedes (header) / follows (footer) |
/// | 1   | used |
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TaggedSize(usize);

impl TaggedSize {
    const NEIGHBOUR: usize = 1 << 0;
    const USED: usize = 1 << 1;
    const TAGS: usize = Self::NEIGHBOUR | Self::USED;

    /// # Panics
    /// If `size` has one of the two tag bits set.
    #[must_use]
    pub const fn new(size: usize, used: bool, neighbour: bool) -> Self {
        assert!(size & Self::TAGS == 0, "chunk size collides with tag bits");
        let mut bits = size;
        if used {
            bits |= Self::USED;
        }
        if neighbour {
            bits |= Self::NEIGHBOUR;
        }
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        self.0 & !Self::TAGS
    }

    #[inline]
    #[must_use]
    pub const fn used(self) -> bool {
        self.0 & Self::USED != 0
    }

    #[inline]
    #[must_use]
    pub const fn has_neighbour(self) -> bool {
        self.0 & Self::NEIGHBOUR != 0
    }

    #[inline]
    #[must_use]
    pub const fn with_size(self, size: usize) -> Self {
        Self::new(size, self.used(), self.has_neighbour())
    }

    #[inline]
    #[must_use]
    pub const fn with_used(self, used: bool) -> Self {
        Self::new(self.size(), used, self.has_neighbour())
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> usize {
        self.0
    }
}

impl fmt::Debug for TaggedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedSize")
            .field("size", &self.size())
            .field("used", &self.used())
            .field("neighbour", &self.has_neighbour())
            .finish()
    }
}

/// Free-list links stored in the payload of a free chunk.
#[repr(C)]
struct FreeNode {
    prev: *mut FreeNode,
    next: *mut FreeNode,
}

/// Round a payload size so that the following chunk stays aligned.
const fn round_request(size: usize) -> usize {
    let framed = size + HEADER + FOOTER;
    framed.next_multiple_of(MAX_ALIGN) - (HEADER + FOOTER)
}

/// Payload size for a request, or `None` if it cannot be represented.
const fn request_size(size: usize) -> Option<usize> {
    let size = if size < size_of::<FreeNode>() {
        size_of::<FreeNode>()
    } else {
        size
    };
    if size > isize::MAX as usize - PAGE_SIZE {
        return None;
    }
    Some(round_request(size))
}

/// Boundary-tag accessors. All take the address of a header or footer.
mod tag {
    use super::{FOOTER, FreeNode, HEADER, TaggedSize};

    #[inline]
    pub unsafe fn read(at: *mut u8) -> TaggedSize {
        unsafe { at.cast::<TaggedSize>().read() }
    }

    #[inline]
    pub unsafe fn write(at: *mut u8, tag: TaggedSize) {
        unsafe { at.cast::<TaggedSize>().write(tag) }
    }

    #[inline]
    pub unsafe fn payload(header: *mut u8) -> *mut u8 {
        unsafe { header.add(HEADER) }
    }

    #[inline]
    pub unsafe fn header_of_payload(payload: *mut u8) -> *mut u8 {
        unsafe { payload.sub(HEADER) }
    }

    #[inline]
    pub unsafe fn footer(header: *mut u8) -> *mut u8 {
        unsafe { header.add(HEADER + read(header).size()) }
    }

    #[inline]
    pub unsafe fn header_of_footer(footer: *mut u8) -> *mut u8 {
        unsafe { footer.sub(read(footer).size() + HEADER) }
    }

    /// Footer of the chunk ending right before `header`.
    #[inline]
    pub unsafe fn prev_footer(header: *mut u8) -> *mut u8 {
        unsafe {
            debug_assert!(read(header).has_neighbour());
            header.sub(FOOTER)
        }
    }

    /// Header of the chunk starting right after `footer`.
    #[inline]
    pub unsafe fn next_header(footer: *mut u8) -> *mut u8 {
        unsafe {
            debug_assert!(read(footer).has_neighbour());
            footer.add(FOOTER)
        }
    }

    #[inline]
    pub unsafe fn node(header: *mut u8) -> *mut FreeNode {
        unsafe { payload(header).cast() }
    }

    #[inline]
    pub unsafe fn header_of_node(node: *mut FreeNode) -> *mut u8 {
        unsafe { header_of_payload(node.cast()) }
    }
}

/// The heap: a list of free chunks in pages obtained so far.
pub struct Heap {
    /// First free chunk, most recently released first.
    head: *mut FreeNode,
}

// Safety: the chunks are owned by the heap; it is only used from one context at a time.
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Forget every free chunk.
    pub const fn init(&mut self) {
        self.head = ptr::null_mut();
    }

    /// Pages needed for a fresh chunk able to serve `size` bytes.
    #[must_use]
    pub const fn pages_needed(size: usize) -> Option<usize> {
        match request_size(size) {
            Some(size) => Some((FRESH_PAD + HEADER + size + FOOTER).div_ceil(PAGE_SIZE)),
            None => None,
        }
    }

    /// Payload of the chunk a fresh run of `pages` pages turns into.
    #[must_use]
    pub const fn fresh_payload(pages: usize) -> usize {
        pages * PAGE_SIZE - FRESH_PAD - HEADER - FOOTER
    }

    /// Allocate `size` bytes aligned to [`MAX_ALIGN`], growing through `source` if needed.
    pub fn allocate(&mut self, size: usize, source: &mut impl PageSource) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.take_free(size) {
            return Some(ptr);
        }

        let pages = Self::pages_needed(size)?;
        let run = source.alloc_heap_pages(pages)?;
        // SAFETY: the source hands out `pages` writable pages nobody else uses.
        Some(unsafe { self.carve(run, pages, size) })
    }

    /// Serve `size` bytes from the free list only (first fit).
    pub fn take_free(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = request_size(size)?;

        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: every node on the list sits in the payload of a free chunk.
            unsafe {
                let header = tag::header_of_node(node);
                let chunk = tag::read(header);
                assert!(!chunk.used(), "heap corruption: used chunk on the free list");
                if chunk.size() >= size {
                    self.unlink(node);
                    return Some(self.hand_out(header, size));
                }
                node = (*node).next;
            }
        }
        None
    }

    /// Turn a fresh run of `pages` pages into a chunk and allocate `size` bytes from it.
    ///
    /// # Safety
    /// `run` must point to `pages` writable pages that nothing else uses,
    /// with `pages` at least [`pages_needed(size)`](Self::pages_needed).
    ///
    /// # Panics
    /// If `pages` is too small for `size`.
    pub unsafe fn carve(&mut self, run: NonNull<u8>, pages: usize, size: usize) -> NonNull<u8> {
        let needed = Self::pages_needed(size);
        assert!(
            needed.is_some_and(|needed| pages >= needed),
            "{pages} pages cannot serve {size} bytes"
        );
        let size = round_request(size.max(size_of::<FreeNode>()));
        let payload = Self::fresh_payload(pages);

        // SAFETY: the caller hands us the pages; header and footer lie within them.
        unsafe {
            let header = run.as_ptr().add(FRESH_PAD);
            tag::write(header, TaggedSize::new(payload, false, false));
            tag::write(tag::footer(header), TaggedSize::new(payload, false, false));
            self.hand_out(header, size)
        }
    }

    /// Mark the free, unlinked chunk at `header` used, splitting off what is not needed.
    unsafe fn hand_out(&mut self, header: *mut u8, size: usize) -> NonNull<u8> {
        unsafe {
            let chunk = tag::read(header);
            let remain = chunk.size() - size;

            if remain < MIN_PAYLOAD + HEADER + FOOTER {
                tag::write(header, chunk.with_used(true));
                let footer = tag::footer(header);
                tag::write(footer, tag::read(footer).with_used(true));
            } else {
                let old_footer = tag::footer(header);
                let rest = remain - HEADER - FOOTER;

                tag::write(header, TaggedSize::new(size, true, chunk.has_neighbour()));
                let footer = tag::footer(header);
                tag::write(footer, TaggedSize::new(size, true, true));

                let rest_header = tag::next_header(footer);
                tag::write(rest_header, TaggedSize::new(rest, false, true));
                tag::write(old_footer, tag::read(old_footer).with_size(rest).with_used(false));
                self.push_front(tag::node(rest_header));
            }

            let payload = tag::payload(header);
            debug_assert!(payload.addr().is_multiple_of(MAX_ALIGN));
            NonNull::new_unchecked(payload)
        }
    }

    /// Release a chunk, merging it with free neighbours. Null is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or come from this heap and not have been released since.
    ///
    /// # Panics
    /// If the chunk is not marked used (double free or corruption).
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        unsafe {
            let mut header = tag::header_of_payload(ptr);
            let chunk = tag::read(header);
            assert!(chunk.used(), "heap corruption: freeing unused chunk at {ptr:p}");
            let mut footer = tag::footer(header);
            assert!(tag::read(footer).used(), "heap corruption: footer of {ptr:p} not used");

            tag::write(header, chunk.with_used(false));
            tag::write(footer, tag::read(footer).with_used(false));

            if chunk.has_neighbour() {
                let prev_footer = tag::prev_footer(header);
                if !tag::read(prev_footer).used() {
                    let prev_header = tag::header_of_footer(prev_footer);
                    assert!(!tag::read(prev_header).used(), "heap corruption: torn chunk");
                    self.unlink(tag::node(prev_header));

                    let merged = tag::read(prev_header).size() + HEADER + FOOTER + chunk.size();
                    tag::write(prev_header, tag::read(prev_header).with_size(merged));
                    tag::write(footer, tag::read(footer).with_size(merged));
                    header = prev_header;
                }
            }

            if tag::read(footer).has_neighbour() {
                let next_header = tag::next_header(footer);
                if !tag::read(next_header).used() {
                    let next_footer = tag::footer(next_header);
                    assert!(!tag::read(next_footer).used(), "heap corruption: torn chunk");
                    self.unlink(tag::node(next_header));

                    let merged =
                        tag::read(header).size() + HEADER + FOOTER + tag::read(next_header).size();
                    tag::write(header, tag::read(header).with_size(merged));
                    tag::write(next_footer, tag::read(next_footer).with_size(merged));
                    footer = next_footer;
                }
            }

            debug_assert_eq!(tag::footer(header), footer);
            self.push_front(tag::node(header));
        }
    }

    /// Allocate a zeroed array of `count` elements of `size` bytes.
    ///
    /// Returns `None` if `count * size` overflows or memory is exhausted.
    pub fn calloc(
        &mut self,
        count: usize,
        size: usize,
        source: &mut impl PageSource,
    ) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes, source)?;
        // SAFETY: the chunk holds at least `bytes` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Number of chunks on the free list.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        let mut count = 0;
        self.for_each_free(|_| count += 1);
        count
    }

    /// Payload size of the largest free chunk, 0 if there is none.
    #[must_use]
    pub fn largest_free_chunk(&self) -> usize {
        let mut largest = 0;
        self.for_each_free(|size| largest = largest.max(size));
        largest
    }

    fn for_each_free(&self, mut f: impl FnMut(usize)) {
        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: see `take_free`.
            unsafe {
                f(tag::read(tag::header_of_node(node)).size());
                node = (*node).next;
            }
        }
    }

    unsafe fn push_front(&mut self, node: *mut FreeNode) {
        unsafe {
            node.write(FreeNode {
                prev: ptr::null_mut(),
                next: self.head,
            });
            if !self.head.is_null() {
                (*self.head).prev = node;
            }
        }
        self.head = node;
    }

    unsafe fn unlink(&mut self, node: *mut FreeNode) {
        unsafe {
            let FreeNode { prev, next } = node.read();
            if prev.is_null() {
                debug_assert_eq!(self.head, node);
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    /// Page-aligned host memory, released when the source is dropped.
    #[derive(Default)]
    pub struct HostPages {
        pub requests: Vec<usize>,
        pub limit: Option<usize>,
        runs: Vec<(NonNull<u8>, Layout)>,
    }

    impl HostPages {
        pub fn with_limit(pages: usize) -> Self {
            let mut source = Self::default();
            source.limit = Some(pages);
            source
        }

        pub fn pages_handed_out(&self) -> usize {
            self.requests.iter().sum()
        }
    }

    impl PageSource for HostPages {
        fn alloc_heap_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
            if self
                .limit
                .is_some_and(|limit| self.pages_handed_out() + count > limit)
            {
                return None;
            }
            let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
            let run = NonNull::new(unsafe { alloc_zeroed(layout) })?;
            self.requests.push(count);
            self.runs.push((run, layout));
            Some(run)
        }

        unsafe fn free_heap_pages(&mut self, pages: NonNull<u8>, count: usize) {
            let at = self
                .runs
                .iter()
                .position(|&(run, layout)| run == pages && layout.size() == count * PAGE_SIZE)
                .expect("unknown page run");
            let (run, layout) = self.runs.swap_remove(at);
            unsafe { dealloc(run.as_ptr(), layout) };
        }
    }

    impl Drop for HostPages {
        fn drop(&mut self) {
            for (run, layout) in self.runs.drain(..) {
                unsafe { dealloc(run.as_ptr(), layout) };
            }
        }
    }
}

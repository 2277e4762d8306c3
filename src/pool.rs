use std::{
    alloc::{self, Layout},
    marker::PhantomData,
    mem,
    ptr::NonNull,
};

use fixedbitset::FixedBitSet;
use tracing::trace;

use crate::error::{HeapError, Result};

/// A slab of `N` slots for values of type `T`.
///
/// Slots are tracked by two bit vectors:
///
/// ```text
///  slot          0   1   2   3   4   5   6   7
///  allocations   1   1   1   1   0   1   0   0
///  arrays        0   0   1   1   0   0   0   0
///                ^   ^-------^       ^
///           scalar   array of 3      scalar
/// ```
///
/// `allocations` marks live slots. `arrays` marks the continuation slots of a
/// multi-slot allocation; the head of an array has it clear, which is how
/// [`Pool::free`] knows where an array ends.
///
/// The pool hands out uninitialized storage and never drops what callers put
/// in it. A full pool answers `Ok(None)`; falling back to another allocator
/// is up to the caller (see [`crate::FallbackPool`]).
///
/// The slots are a single block taken from the global allocator in
/// [`Pool::new`] and handed back when the pool is dropped. This is the one
/// piece of memory in the crate that does not come from a segment: a pool is
/// independent of any [`crate::MasterHeap`] and may outlive all of them.
pub struct Pool<T, const N: usize> {
    storage: NonNull<T>,
    layout: Layout,
    allocations: FixedBitSet,
    arrays: FixedBitSet,
    /// Lowest free slot when known.
    first_free: Option<usize>,
    live: usize,
    marker: PhantomData<T>,
}

// SAFETY: the pool exclusively owns its storage.
unsafe impl<T: Send, const N: usize> Send for Pool<T, N> {}

impl<T, const N: usize> Pool<T, N> {
    pub fn new() -> Self {
        const {
            assert!(N > 0, "a pool needs at least one slot");
            assert!(mem::size_of::<T>() > 0, "zero sized types need no pool");
        }

        let layout = Layout::array::<T>(N)
            .unwrap_or_else(|_| panic!("pool of {N} slots overflows the address space"));

        // SAFETY: the layout has a non zero size, checked above.
        let storage = unsafe { alloc::alloc(layout) };
        let Some(storage) = NonNull::new(storage.cast::<T>()) else {
            alloc::handle_alloc_error(layout);
        };

        Self {
            storage,
            layout,
            allocations: FixedBitSet::with_capacity(N),
            arrays: FixedBitSet::with_capacity(N),
            first_free: Some(0),
            live: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of live slots, continuation slots included.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.live == N
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Whether `ptr` points into the pool's storage.
    #[inline]
    pub fn is_pool_memory(&self, ptr: *const T) -> bool {
        let base = self.storage.as_ptr() as usize;
        let addr = ptr as usize;

        addr >= base && addr < base + self.layout.size()
    }

    /// Takes the lowest free slot. `Ok(None)` when the pool is full.
    pub fn allocate(&mut self) -> Result<Option<NonNull<T>>> {
        let index = match self.first_free {
            Some(hint) if self.allocations.contains(hint) => {
                self.first_free = None;
                return Err(HeapError::corruption("free slot hint points at a live slot"));
            }
            Some(hint) => hint,
            None => match self.allocations.zeroes().next() {
                Some(index) => {
                    self.first_free = Some(index);
                    index
                }
                None => return Ok(None),
            },
        };

        self.mark(index, 1);
        trace!(index, "pool slot allocated");

        Ok(Some(self.slot(index)))
    }

    /// Takes the lowest run of `count` contiguous free slots. `Ok(None)`
    /// when there is no such run.
    pub fn allocate_array(&mut self, count: usize) -> Result<Option<NonNull<T>>> {
        if count == 0 || count > N {
            return Ok(None);
        }

        let mut start = self.first_free.unwrap_or(0);
        let mut run = 0;

        for index in start..N {
            if self.allocations.contains(index) {
                start = index + 1;
                run = 0;
                continue;
            }

            run += 1;

            if run == count {
                self.mark(start, count);
                trace!(index = start, count, "pool array allocated");

                return Ok(Some(self.slot(start)));
            }
        }

        Ok(None)
    }

    /// Frees the scalar or array allocation starting at `ptr`.
    ///
    /// Fails with [`HeapError::MemoryCorruption`] for pointers outside the
    /// pool or between slots, for continuation slots of an array, and for
    /// slots that are already free.
    pub fn free(&mut self, ptr: NonNull<T>) -> Result<()> {
        let index = self.slot_index(ptr.as_ptr())?;

        if self.arrays.contains(index) {
            return Err(HeapError::corruption("free of an array continuation slot"));
        }

        if !self.allocations.contains(index) {
            return Err(HeapError::corruption("free of a slot that is not allocated"));
        }

        let mut end = index + 1;
        while end < N && self.arrays.contains(end) {
            end += 1;
        }

        self.allocations.set_range(index..end, false);
        self.arrays.set_range(index..end, false);

        self.live -= end - index;
        self.first_free = match self.first_free {
            Some(hint) if hint < index => Some(hint),
            Some(_) => Some(index),
            // Some lower slot may already be free.
            None => None,
        };

        trace!(index, count = end - index, "pool slots freed");

        Ok(())
    }

    /// Marks `count` slots starting at `start` live, the first one as head.
    fn mark(&mut self, start: usize, count: usize) {
        self.allocations.insert_range(start..start + count);
        self.arrays.set(start, false);
        self.arrays.insert_range(start + 1..start + count);

        self.live += count;

        if self.first_free.is_some_and(|hint| hint >= start && hint < start + count) {
            let next = start + count;
            self.first_free = (next < N && !self.allocations.contains(next)).then_some(next);
        }
    }

    #[inline]
    fn slot(&self, index: usize) -> NonNull<T> {
        debug_assert!(index < N);

        // SAFETY: `index` is in bounds of the storage.
        unsafe { self.storage.add(index) }
    }

    fn slot_index(&self, ptr: *const T) -> Result<usize> {
        if !self.is_pool_memory(ptr) {
            return Err(HeapError::corruption("pointer does not belong to the pool"));
        }

        let offset = ptr as usize - self.storage.as_ptr() as usize;

        if offset % mem::size_of::<T>() != 0 {
            return Err(HeapError::corruption("pointer is not at a slot boundary"));
        }

        Ok(offset / mem::size_of::<T>())
    }
}

impl<T, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Pool<T, N> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.storage.as_ptr().cast(), self.layout) }
    }
}

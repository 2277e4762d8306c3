use std::{any, mem, ptr::NonNull};

use tracing::warn;

use crate::{
    error::{HeapError, Result},
    master::SharedHeap,
    pool::Pool,
    utils::WORD_SIZE,
};

/// A [`Pool`] that spills over to the heap.
///
/// Allocations are served from the pool while it has room. Once it is
/// exhausted a warning is logged and the memory comes from the calling
/// processor's heap instead. Frees are routed back by address: pool memory to
/// the pool, anything else to [`crate::MasterHeap::free`].
pub struct FallbackPool<T, const N: usize> {
    pool: Pool<T, N>,
    heap: SharedHeap,
}

impl<T, const N: usize> FallbackPool<T, N> {
    /// Fails with [`HeapError::Alignment`] if `T` needs more than word
    /// alignment, which heap blocks do not guarantee.
    pub fn new(heap: SharedHeap) -> Result<Self> {
        if mem::align_of::<T>() > WORD_SIZE {
            return Err(HeapError::Alignment {
                align: mem::align_of::<T>(),
            });
        }

        Ok(Self {
            pool: Pool::new(),
            heap,
        })
    }

    #[inline]
    pub fn pool(&self) -> &Pool<T, N> {
        &self.pool
    }

    pub fn allocate(&mut self) -> Result<NonNull<T>> {
        if let Some(ptr) = self.pool.allocate()? {
            return Ok(ptr);
        }

        self.spill(1)
    }

    /// Contiguous storage for `count` values. `Ok(None)` when `count` is
    /// zero, without touching the pool or the heap.
    pub fn allocate_array(&mut self, count: usize) -> Result<Option<NonNull<T>>> {
        if count == 0 {
            return Ok(None);
        }

        if let Some(ptr) = self.pool.allocate_array(count)? {
            return Ok(Some(ptr));
        }

        self.spill(count).map(Some)
    }

    pub fn free(&mut self, ptr: NonNull<T>) -> Result<()> {
        if self.pool.is_pool_memory(ptr.as_ptr()) {
            return self.pool.free(ptr);
        }

        self.heap.borrow_mut().free(ptr.cast());

        Ok(())
    }

    fn spill(&mut self, count: usize) -> Result<NonNull<T>> {
        warn!(
            ty = any::type_name::<T>(),
            capacity = N,
            count,
            "pool exhausted, falling back to the heap"
        );

        let size = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or_else(|| HeapError::OutOfMemory {
                requested: usize::MAX,
                capacity: self.heap.borrow().segment_size(),
            })?;

        let ptr = self.heap.borrow_mut().allocate_local(size)?;

        Ok(ptr.cast())
    }
}

//! Reference counted values whose storage is routed through the heap.

use std::{
    cell::Cell,
    fmt,
    marker::PhantomData,
    mem,
    ops::Deref,
    ptr::{self, NonNull},
    rc::Rc,
};

use crate::{
    error::{HeapError, Result},
    master::SharedHeap,
    utils::WORD_SIZE,
};

/// Where the storage of an [`Object`] comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Owned by ordinary Rust ownership, outside the segmented heap. Never
    /// handed to the heap on release.
    StackOwned,
    /// Carved from a heap of a [`crate::MasterHeap`] and freed back through
    /// it when the last reference goes away.
    HeapOwned,
}

struct ObjectBox<T> {
    count: Cell<usize>,
    origin: Origin,
    value: T,
}

/// Shared ownership pointer with an explicit [`Origin`].
///
/// Cloning bumps a counter stored next to the value; the value is dropped
/// and its storage released when the counter reaches zero. Heap owned
/// objects are released through [`crate::MasterHeap::free`], so the last
/// reference may be dropped on any processor.
pub struct Object<T> {
    ptr: NonNull<ObjectBox<T>>,
    heap: Option<SharedHeap>,
    marker: PhantomData<ObjectBox<T>>,
}

impl<T> Object<T> {
    /// Moves `value` into memory from the calling processor's heap.
    pub fn new_in(heap: &SharedHeap, value: T) -> Result<Self> {
        if mem::align_of::<ObjectBox<T>>() > WORD_SIZE {
            return Err(HeapError::Alignment {
                align: mem::align_of::<ObjectBox<T>>(),
            });
        }

        let ptr = heap
            .borrow_mut()
            .allocate_local(mem::size_of::<ObjectBox<T>>())?
            .cast::<ObjectBox<T>>();

        // SAFETY: fresh, word aligned block of the right size.
        unsafe {
            ptr.as_ptr().write(ObjectBox {
                count: Cell::new(1),
                origin: Origin::HeapOwned,
                value,
            });
        }

        Ok(Self {
            ptr,
            heap: Some(Rc::clone(heap)),
            marker: PhantomData,
        })
    }

    /// Wraps `value` without involving any heap.
    pub fn unmanaged(value: T) -> Self {
        let inner = Box::new(ObjectBox {
            count: Cell::new(1),
            origin: Origin::StackOwned,
            value,
        });

        Self {
            ptr: NonNull::from(Box::leak(inner)),
            heap: None,
            marker: PhantomData,
        }
    }

    pub fn origin(this: &Self) -> Origin {
        this.inner().origin
    }

    pub fn strong_count(this: &Self) -> usize {
        this.inner().count.get()
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Whether the storage of this object is live heap memory.
    pub fn is_heap_memory(this: &Self) -> bool {
        this.heap
            .as_ref()
            .is_some_and(|heap| heap.borrow().is_heap_memory(this.ptr.as_ptr().cast()))
    }

    #[inline]
    fn inner(&self) -> &ObjectBox<T> {
        // SAFETY: the box stays alive while any reference exists.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Clone for Object<T> {
    fn clone(&self) -> Self {
        let count = &self.inner().count;
        count.set(count.get() + 1);

        Self {
            ptr: self.ptr,
            heap: self.heap.clone(),
            marker: PhantomData,
        }
    }
}

impl<T> Deref for Object<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T> Drop for Object<T> {
    fn drop(&mut self) {
        let count = &self.inner().count;
        count.set(count.get() - 1);

        if count.get() > 0 {
            return;
        }

        let origin = self.inner().origin;

        match origin {
            Origin::HeapOwned => {
                // SAFETY: last reference; the value is dropped exactly once
                // and its storage is not touched afterwards.
                unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };

                if let Some(heap) = &self.heap {
                    heap.borrow_mut().free(self.ptr.cast());
                }
            }
            Origin::StackOwned => {
                // SAFETY: created by `Box::leak` in `unmanaged`.
                drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("origin", &self.inner().origin)
            .field("count", &self.inner().count.get())
            .field("value", &self.inner().value)
            .finish()
    }
}

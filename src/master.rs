use std::{cell::RefCell, ptr::NonNull, rc::Rc};

use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    config::{ConfigError, HeapConfig},
    error::{HeapError, Result},
    heap::{Heap, HeapId, HeapStats, SegmentSource},
    kernel::{self, Mapping},
    segment::Segment,
    utils::align_word,
};

/// A [`MasterHeap`] shared by the typed consumers of the crate
/// ([`crate::FallbackPool`], [`crate::Object`]) within one thread.
pub type SharedHeap = Rc<RefCell<MasterHeap>>;

/// Maps whole segments straight from the kernel.
///
/// This is the one place where memory enters and leaves the crate; every
/// allocation is later carved out of a segment produced here.
#[derive(Debug, Clone, Copy)]
pub struct SegmentAllocator {
    segment_size: usize,
}

impl SegmentAllocator {
    pub fn new(segment_size: usize) -> Self {
        Self {
            segment_size: align_word(segment_size),
        }
    }
}

impl SegmentSource for SegmentAllocator {
    #[inline]
    fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn allocate_segment(&self) -> Result<Segment> {
        let mapping = Mapping::new(self.segment_size).ok_or(HeapError::Platform {
            len: self.segment_size,
        })?;

        Ok(Segment::new(mapping, self.segment_size))
    }

    fn free_segment(&self, segment: Segment) {
        debug!(capacity = segment.capacity(), blocks = segment.blocks().count(), "returning segment");

        drop(segment);
    }
}

/// Owner of one [`Heap`] per logical processor.
///
/// Build one at startup and pass it to whatever needs to allocate. The number
/// of heaps is fixed at construction.
///
/// ```text
///                      MasterHeap
///          +---------------+---------------+
///          |               |               |
///       Heap 0          Heap 1   ...    Heap n-1
///   [Seg]->[Seg]       [Seg]          [Seg]->[Seg]->[Seg]
/// ```
///
/// A thread running on processor `p` is expected to allocate from heap `p`
/// only (see [`MasterHeap::local_index`]). Frees go through
/// [`MasterHeap::free`], which finds the owning heap by scanning all of them,
/// so memory may be freed from any processor. That scan does not
/// synchronise with anything: sharing a `MasterHeap` between threads needs an
/// external lock around it.
pub struct MasterHeap {
    segments: SegmentAllocator,
    heaps: Vec<Heap>,
}

impl MasterHeap {
    /// One heap per logical processor, default segment size.
    pub fn new() -> Result<Self> {
        Self::from_config(&HeapConfig::default())
    }

    /// `heaps` heaps of `segment_size` byte segments.
    pub fn with_heaps(heaps: usize, segment_size: usize) -> Result<Self> {
        Self::from_config(&HeapConfig::default().with_heaps(heaps).with_segment_size(segment_size))
    }

    pub fn from_config(config: &HeapConfig) -> Result<Self> {
        config.validate().map_err(ConfigError::from)?;

        let segments = SegmentAllocator::new(config.aligned_segment_size());
        let count = config.heaps.unwrap_or_else(kernel::processor_count);

        let heaps = (0..count)
            .map(|index| Heap::new(HeapId::new(index), &segments))
            .collect::<Result<Vec<_>>>()?;

        info!(heaps = count, segment_size = segments.segment_size, "master heap initialised");

        Ok(Self { segments, heaps })
    }

    pub fn into_shared(self) -> SharedHeap {
        Rc::new(RefCell::new(self))
    }

    #[inline]
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segments.segment_size
    }

    pub fn heaps(&self) -> impl Iterator<Item = &Heap> {
        self.heaps.iter()
    }

    pub fn heap(&self, index: usize) -> Result<&Heap> {
        let count = self.heaps.len();

        self.heaps.get(index).ok_or(HeapError::OutOfRange { index, count })
    }

    pub fn heap_mut(&mut self, index: usize) -> Result<&mut Heap> {
        let count = self.heaps.len();

        self.heaps.get_mut(index).ok_or(HeapError::OutOfRange { index, count })
    }

    /// Heap index for the processor the calling thread is running on right
    /// now. Falls back to heap 0 where the platform cannot tell.
    pub fn local_index(&self) -> usize {
        kernel::current_processor().unwrap_or(0) % self.heaps.len()
    }

    /// Allocates `size` bytes from heap `index`.
    pub fn allocate(&mut self, index: usize, size: usize) -> Result<NonNull<u8>> {
        let count = self.heaps.len();
        let segments = &self.segments;

        self.heaps
            .get_mut(index)
            .ok_or(HeapError::OutOfRange { index, count })?
            .allocate(size, segments)
    }

    /// Allocates `size` bytes from the calling processor's heap.
    pub fn allocate_local(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(self.local_index(), size)
    }

    /// Frees `ptr` on whichever heap allocated it, regardless of the
    /// processor this runs on. Unknown pointers are logged and ignored.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        match self.heaps.iter_mut().find(|heap| heap.is_heap_memory(ptr.as_ptr())) {
            Some(heap) => heap.free(ptr),
            None => warn!(ptr = ?ptr, "ignoring free of memory not owned by any heap"),
        }
    }

    /// Heap that allocated `ptr`, if any.
    pub fn owner_of(&self, ptr: *const u8) -> Option<HeapId> {
        self.heaps.iter().find(|heap| heap.is_heap_memory(ptr)).map(Heap::id)
    }

    pub fn is_heap_memory(&self, ptr: *const u8) -> bool {
        self.owner_of(ptr).is_some()
    }

    pub fn stats(&self) -> HeapStats {
        self.heaps.iter().map(Heap::stats).fold(HeapStats::default(), |total, stats| total + stats)
    }
}

impl SegmentSource for MasterHeap {
    #[inline]
    fn segment_size(&self) -> usize {
        self.segments.segment_size()
    }

    fn allocate_segment(&self) -> Result<Segment> {
        self.segments.allocate_segment()
    }

    fn free_segment(&self, segment: Segment) {
        self.segments.free_segment(segment)
    }
}

impl Drop for MasterHeap {
    fn drop(&mut self) {
        debug!(stats = ?self.stats(), "tearing down master heap");

        for heap in self.heaps.drain(..) {
            heap.release(&self.segments);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn one_heap_per_processor_by_default() {
        let master = MasterHeap::new().unwrap();

        assert_eq!(master.heap_count(), num_cpus::get());
        for (index, heap) in master.heaps().enumerate() {
            assert_eq!(heap.id(), HeapId::new(index));
            assert_eq!(heap.segment_count(), 1);
        }
    }

    #[test]
    fn invalid_index_is_out_of_range() {
        let mut master = MasterHeap::with_heaps(2, 4096).unwrap();

        assert!(matches!(
            master.heap(2),
            Err(HeapError::OutOfRange { index: 2, count: 2 })
        ));
        assert!(master.heap_mut(7).is_err());
        assert!(master.allocate(2, 8).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            MasterHeap::with_heaps(0, 4096),
            Err(HeapError::Config(ConfigError::Validation(_)))
        ));
        assert!(matches!(
            MasterHeap::with_heaps(1, 16),
            Err(HeapError::Config(_))
        ));
    }

    #[test]
    fn cross_heap_free_reaches_the_owner() {
        let mut master = MasterHeap::with_heaps(3, 4096).unwrap();

        let a = master.allocate(2, 64).unwrap();
        assert_eq!(master.owner_of(a.as_ptr()), Some(HeapId::new(2)));
        assert!(!master.heap(0).unwrap().is_heap_memory(a.as_ptr()));

        master.free(a);

        assert!(!master.is_heap_memory(a.as_ptr()));
        assert_eq!(master.stats().blocks, 0);
    }

    #[traced_test]
    #[test]
    fn unknown_pointer_free_is_ignored() {
        let mut master = MasterHeap::with_heaps(2, 4096).unwrap();
        let _a = master.allocate(0, 16).unwrap();

        let mut local = 0usize;
        master.free(NonNull::from(&mut local).cast());

        assert_eq!(master.stats().blocks, 1);
        assert!(logs_contain("not owned by any heap"));
    }

    #[test]
    fn local_allocation_lands_on_the_local_heap() {
        let mut master = MasterHeap::with_heaps(4, 4096).unwrap();

        let ptr = master.allocate_local(32).unwrap();

        assert!(master.is_heap_memory(ptr.as_ptr()));
        assert!(master.local_index() < 4);
    }

    #[test]
    fn segment_size_is_word_aligned() {
        let master = MasterHeap::with_heaps(1, 1001).unwrap();

        assert_eq!(master.segment_size() % std::mem::size_of::<usize>(), 0);
        assert_eq!(master.heap(0).unwrap().stats().capacity, master.segment_size());
    }

    #[test]
    fn heaps_grow_independently() {
        let mut master = MasterHeap::with_heaps(2, 1024).unwrap();

        for _ in 0..4 {
            master.allocate(0, 512).unwrap();
        }

        assert_eq!(master.heap(0).unwrap().segment_count(), 4);
        assert_eq!(master.heap(1).unwrap().segment_count(), 1);
    }
}

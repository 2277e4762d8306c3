use std::{
    mem,
    ops::Add,
    ptr::NonNull,
};

use tracing::{debug, trace, warn};

use crate::{
    error::{HeapError, Result},
    segment::Segment,
};

/// Identifies a [`Heap`]. Every block header records the id of the heap that
/// allocated it, which is how ownership of a pointer is established.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    /// Id stored in destroyed block headers. No heap ever has it.
    pub(crate) const VACANT: Self = Self(usize::MAX);

    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

/// Where a heap gets new segments from, and gives them back to.
///
/// [`crate::MasterHeap`] is the implementation used in practice; it is the
/// only piece of the crate that talks to the platform.
pub trait SegmentSource {
    /// Bytes per segment handed out by this source.
    fn segment_size(&self) -> usize;

    fn allocate_segment(&self) -> Result<Segment>;

    fn free_segment(&self, segment: Segment);
}

/// Occupancy figures of a heap, or of several of them added together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub segments: usize,
    pub blocks: usize,
    /// Bytes taken by live blocks, headers included.
    pub used_bytes: usize,
    /// Bytes committed across all segments.
    pub capacity: usize,
}

impl Add for HeapStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            segments: self.segments + other.segments,
            blocks: self.blocks + other.blocks,
            used_bytes: self.used_bytes + other.used_bytes,
            capacity: self.capacity + other.capacity,
        }
    }
}

/// A chain of [`Segment`] serving allocations for one logical processor.
///
/// ```text
/// +---------------------+      +---------------------+      +---------------------+
/// | Segment             |      | Segment             |      | Segment             |
/// | [Block][Block] ...  | ---> | [Block] ... [Block] | ---> | [Block] ...         |
/// +---------------------+      +---------------------+      +---------------------+
/// ```
///
/// Requests go to the first segment with a big enough gap. When none has
/// one, a fresh segment is requested from the [`SegmentSource`] and appended;
/// the chain has no upper bound. Segments are never released one by one,
/// only all together when the heap goes away.
///
/// A heap expects a single writer. Nothing inside locks, and the `&mut self`
/// receivers are the only thing keeping two threads off the same chain.
pub struct Heap {
    id: HeapId,
    /// Chain order is index order.
    segments: Vec<Segment>,
}

impl Heap {
    /// Creates a heap seeded with one segment from `source`.
    pub fn new<S: SegmentSource + ?Sized>(id: HeapId, source: &S) -> Result<Self> {
        let segments = vec![source.allocate_segment()?];

        debug!(heap = id.index(), segment_size = source.segment_size(), "heap created");

        Ok(Self { id, segments })
    }

    #[inline]
    pub fn id(&self) -> HeapId {
        self.id
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segments of the heap in chain order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Allocates `size` bytes, growing the heap with a segment from `source`
    /// when none of the current ones has room.
    ///
    /// The returned memory is word aligned and uninitialized from the
    /// caller's point of view.
    pub fn allocate<S: SegmentSource + ?Sized>(&mut self, size: usize, source: &S) -> Result<NonNull<u8>> {
        let id = self.id;

        for segment in &mut self.segments {
            if let Some(ptr) = segment.allocate(size, id)? {
                trace!(heap = id.index(), size, ptr = ?ptr, "allocated");
                return Ok(ptr);
            }
        }

        let mut segment = source.allocate_segment()?;
        let ptr = segment.allocate(size, id)?;
        self.segments.push(segment);

        debug!(heap = id.index(), segments = self.segments.len(), "heap grew by one segment");

        ptr.ok_or(HeapError::OutOfMemory {
            requested: size,
            capacity: source.segment_size(),
        })
    }

    /// Gives the memory at `ptr` back to the heap.
    ///
    /// Freeing memory this heap does not own is not an error: it is logged
    /// and ignored, leaving every segment untouched.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        if !self.is_heap_memory(ptr.as_ptr()) {
            warn!(heap = self.id.index(), ptr = ?ptr, "ignoring free of memory not owned by this heap");
            return;
        }

        for segment in &mut self.segments {
            if segment.free(ptr) {
                trace!(heap = self.id.index(), ptr = ?ptr, "freed");
                return;
            }
        }

        warn!(heap = self.id.index(), ptr = ?ptr, "no segment claimed memory owned by this heap");
    }

    /// Whether `ptr` is the start of a live allocation made by this heap.
    ///
    /// The segment holding the header is located first, so no header is read
    /// outside memory the heap owns; the header's heap id must then match.
    /// Anything that cannot be proven to belong here answers `false`.
    pub fn is_heap_memory(&self, ptr: *const u8) -> bool {
        self.segments
            .iter()
            .find_map(|segment| segment.owner_of(ptr))
            .is_some_and(|owner| owner == self.id)
    }

    pub fn stats(&self) -> HeapStats {
        self.segments.iter().fold(HeapStats::default(), |stats, segment| {
            stats
                + HeapStats {
                    segments: 1,
                    blocks: segment.blocks().count(),
                    used_bytes: segment.used_bytes(),
                    capacity: segment.capacity(),
                }
        })
    }

    /// Hands every segment back to `source`, consuming the heap.
    pub fn release<S: SegmentSource + ?Sized>(mut self, source: &S) {
        for segment in mem::take(&mut self.segments) {
            source.free_segment(segment);
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.segments.is_empty() {
            debug!(heap = self.id.index(), stats = ?self.stats(), "heap dropped");
        }
    }
}

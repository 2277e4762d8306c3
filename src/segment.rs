use std::ptr::{self, NonNull};

use tracing::trace;

use crate::{
    block::{Block, BlockOffset, BLOCK_HEADER_SIZE},
    error::{HeapError, Result},
    heap::HeapId,
    kernel::Mapping,
    utils::{align_word, WORD_SIZE},
};

/// A fixed size arena of memory holding a chain of [`Block`].
///
/// Segments are handed to a heap by its segment source and never shrink or
/// move. Inside, blocks are laid out in address order and linked through the
/// offsets stored in their headers:
///
/// ```text
///  0                                                              capacity
///  +-------+---------+-------+-----------+------------+---------+   |
///  | Block | content | Block |  content  |    gap     |  Block  |...|
///  +-------+---------+-------+-----------+------------+---------+   |
///  ^ first_block       |                                ^
///                      +------------- next -------------+
/// ```
///
/// Placement is first-fit: the first gap (before the first block, between two
/// neighbours, or after the last one) that can hold a header plus the word
/// aligned request is used.
pub struct Segment {
    /// Memory of the segment. Only the first `capacity` bytes are used.
    memory: Mapping,
    /// End of memory sentinel, as an offset.
    capacity: usize,
    /// Offset of the first block in address order.
    first_block: Option<BlockOffset>,
}

/// Iterator over the live blocks of a [`Segment`] in address order, yielding
/// `(offset, size)` pairs.
pub struct Blocks<'a> {
    segment: &'a Segment,
    current: Option<BlockOffset>,
}

impl Segment {
    /// Wraps a fresh `memory` mapping, using its first `capacity` bytes.
    ///
    /// `capacity` is rounded down to word alignment and clamped to the length
    /// of the mapping.
    pub(crate) fn new(memory: Mapping, capacity: usize) -> Self {
        let capacity = capacity.min(memory.len()) & !(WORD_SIZE - 1);

        Self {
            memory,
            capacity,
            first_block: None,
        }
    }

    /// Total bytes of the segment, headers included.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest request this segment could ever satisfy.
    #[inline]
    pub fn max_request(&self) -> usize {
        self.capacity.saturating_sub(BLOCK_HEADER_SIZE)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first_block.is_none()
    }

    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            segment: self,
            current: self.first_block,
        }
    }

    /// Bytes taken by live blocks, headers included.
    pub fn used_bytes(&self) -> usize {
        self.blocks().map(|(_, size)| BLOCK_HEADER_SIZE + size).sum()
    }

    /// Tries to carve `size` bytes out of this segment for `heap`.
    ///
    /// Returns `Ok(None)` when no gap is big enough right now, and
    /// [`HeapError::OutOfMemory`] when no segment of this capacity could ever
    /// hold the request.
    pub fn allocate(&mut self, size: usize, heap: HeapId) -> Result<Option<NonNull<u8>>> {
        if size > self.max_request() {
            return Err(HeapError::OutOfMemory {
                requested: size,
                capacity: self.max_request(),
            });
        }

        let size = align_word(size);
        let needed = BLOCK_HEADER_SIZE + size;

        let Some(first) = self.first_block else {
            return Ok(Some(self.place(0, size, heap, None, None)));
        };

        // Room in front of the current head.
        if first >= needed {
            return Ok(Some(self.place(0, size, heap, None, Some(first))));
        }

        let mut current = first;

        loop {
            let block = self.read(current);
            let start = align_word(block.end(current));
            let limit = block.next().unwrap_or(self.capacity);

            if limit >= start && limit - start >= needed {
                return Ok(Some(self.place(start, size, heap, Some(current), block.next())));
            }

            match block.next() {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
    }

    /// Releases the block whose content starts at `ptr`.
    ///
    /// Returns `false`, touching nothing, if `ptr` does not point to the
    /// content of a block linked into this segment.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let Some(offset) = self.block_offset(ptr.as_ptr()) else {
            return false;
        };

        let block = self.read(offset);

        if !self.is_linked(offset, &block) {
            return false;
        }

        match block.previous() {
            Some(previous) => {
                let mut header = self.read(previous);
                header.set_next(block.next());
                self.write(previous, header);
            }
            None => self.first_block = block.next(),
        }

        if let Some(next) = block.next() {
            let mut header = self.read(next);
            header.set_previous(block.previous());
            self.write(next, header);
        }

        // The header was built in place, so it is torn down in place too.
        self.write(offset, Block::vacant());

        trace!(offset, size = block.size(), "freed block");

        true
    }

    /// Pure address range check against `[memory, sentinel)`. It says
    /// nothing about whether a live block sits at `ptr`.
    #[inline]
    pub fn is_in_segment(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        let addr = ptr as usize;

        addr >= base && addr < base + self.capacity
    }

    /// Heap recorded in the header of the live block whose content starts at
    /// `ptr`, if there is one.
    pub(crate) fn owner_of(&self, ptr: *const u8) -> Option<HeapId> {
        let offset = self.block_offset(ptr)?;
        let block = self.read(offset);

        self.is_linked(offset, &block).then(|| block.heap())
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.memory.as_ptr().as_ptr()
    }

    /// Recovers the header offset from a content pointer, refusing anything
    /// that could not be a header of this segment.
    fn block_offset(&self, ptr: *const u8) -> Option<BlockOffset> {
        let data = (ptr as usize).checked_sub(self.base() as usize)?;
        let offset = data.checked_sub(BLOCK_HEADER_SIZE)?;

        if !self.is_in_segment(self.base().wrapping_add(offset)) || !self.is_header_offset(offset) {
            return None;
        }

        Some(offset)
    }

    #[inline]
    fn is_header_offset(&self, offset: BlockOffset) -> bool {
        offset % WORD_SIZE == 0 && offset + BLOCK_HEADER_SIZE <= self.capacity
    }

    /// A header is trusted only if its neighbours agree that it is linked
    /// between them and it fits inside the segment.
    ///
    /// `offset` must satisfy `is_header_offset`. Every field of
    /// `block` may be garbage.
    fn is_linked(&self, offset: BlockOffset, block: &Block) -> bool {
        if block.heap() == HeapId::VACANT
            || block.size() > self.capacity - Block::data_offset(offset)
        {
            return false;
        }

        let previous_agrees = match block.previous() {
            Some(previous) => {
                previous < offset
                    && self.is_header_offset(previous)
                    && self.read(previous).next() == Some(offset)
            }
            None => self.first_block == Some(offset),
        };

        let next_agrees = match block.next() {
            Some(next) => {
                next > offset
                    && self.is_header_offset(next)
                    && self.read(next).previous() == Some(offset)
            }
            None => true,
        };

        previous_agrees && next_agrees
    }

    /// Builds a block header in place at `offset` and splices it between
    /// `previous` and `next`.
    fn place(
        &mut self,
        offset: BlockOffset,
        size: usize,
        heap: HeapId,
        previous: Option<BlockOffset>,
        next: Option<BlockOffset>,
    ) -> NonNull<u8> {
        debug_assert!(offset + BLOCK_HEADER_SIZE + size <= self.capacity);

        self.write(offset, Block::new(size, heap, previous, next));

        match previous {
            Some(previous) => {
                let mut header = self.read(previous);
                header.set_next(Some(offset));
                self.write(previous, header);
            }
            None => self.first_block = Some(offset),
        }

        if let Some(next) = next {
            let mut header = self.read(next);
            header.set_previous(Some(offset));
            self.write(next, header);
        }

        trace!(offset, size, heap = heap.index(), "placed block");

        // SAFETY: the content offset lies inside the mapping, which is non null.
        unsafe { NonNull::new_unchecked(self.base().add(Block::data_offset(offset))) }
    }

    #[inline]
    fn read(&self, offset: BlockOffset) -> Block {
        assert!(self.is_header_offset(offset), "block offset {offset} out of bounds");

        // SAFETY: bounds and alignment checked above; the mapping is zero
        // initialised so every word is readable.
        unsafe { ptr::read(self.base().add(offset).cast::<Block>()) }
    }

    #[inline]
    fn write(&mut self, offset: BlockOffset, block: Block) {
        assert!(self.is_header_offset(offset), "block offset {offset} out of bounds");

        // SAFETY: see `read`.
        unsafe { ptr::write(self.base().add(offset).cast::<Block>(), block) }
    }
}

impl Iterator for Blocks<'_> {
    type Item = (BlockOffset, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.current?;
        let block = self.segment.read(offset);
        self.current = block.next();

        Some((offset, block.size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP: HeapId = HeapId::new(0);

    fn segment(capacity: usize) -> Segment {
        Segment::new(Mapping::new(capacity).expect("mmap failed"), capacity)
    }

    fn offset_of(segment: &Segment, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - segment.base() as usize
    }

    fn allocate(segment: &mut Segment, size: usize) -> NonNull<u8> {
        segment.allocate(size, HEAP).unwrap().expect("segment full")
    }

    #[test]
    fn first_block_goes_at_the_start() {
        let mut segment = segment(1000);
        let ptr = allocate(&mut segment, 100);

        assert_eq!(offset_of(&segment, ptr), BLOCK_HEADER_SIZE);
        assert_eq!(segment.blocks().collect::<Vec<_>>(), vec![(0, align_word(100))]);
    }

    #[test]
    fn blocks_are_placed_back_to_back() {
        let mut segment = segment(1000);
        let a = allocate(&mut segment, 100);
        let b = allocate(&mut segment, 200);

        let end_of_a = offset_of(&segment, a) + align_word(100);
        assert_eq!(offset_of(&segment, b), end_of_a + BLOCK_HEADER_SIZE);
    }

    #[test]
    fn freed_gap_is_reused_first_fit() {
        let mut segment = segment(1000);
        let a = allocate(&mut segment, 100);
        let _b = allocate(&mut segment, 200);

        assert!(segment.free(a));

        let c = allocate(&mut segment, 100);
        assert_eq!(a, c);
    }

    #[test]
    fn request_larger_than_freed_gap_goes_to_the_tail() {
        let mut segment = segment(1000);
        let a = allocate(&mut segment, 100);
        let b = allocate(&mut segment, 200);

        assert!(segment.free(a));

        // 150 bytes plus a header do not fit in the 136 bytes left by `a`.
        let c = allocate(&mut segment, 150);
        assert!(offset_of(&segment, c) > offset_of(&segment, b));
    }

    #[test]
    fn gap_between_blocks_is_used() {
        let mut segment = segment(1000);
        let _a = allocate(&mut segment, 64);
        let b = allocate(&mut segment, 64);
        let _c = allocate(&mut segment, 64);

        assert!(segment.free(b));

        let d = allocate(&mut segment, 32);
        assert_eq!(b, d);
        assert_eq!(segment.blocks().count(), 3);
    }

    #[test]
    fn full_segment_reports_no_room() {
        let mut segment = segment(1000);
        let _a = allocate(&mut segment, 900);

        assert!(segment.allocate(100, HEAP).unwrap().is_none());
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let mut segment = segment(1000);

        let err = segment.allocate(1000 - BLOCK_HEADER_SIZE + 1, HEAP).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { .. }));

        // Exactly the capacity minus one header fits an empty segment.
        assert!(segment.allocate(1000 - BLOCK_HEADER_SIZE, HEAP).unwrap().is_some());
    }

    #[test]
    fn oversized_request_is_out_of_memory_even_when_full() {
        let mut segment = segment(1000);
        let _a = allocate(&mut segment, 500);

        assert!(matches!(
            segment.allocate(usize::MAX, HEAP),
            Err(HeapError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn foreign_pointer_is_not_claimed() {
        let mut segment = segment(1000);
        let _a = allocate(&mut segment, 100);
        let before = segment.blocks().collect::<Vec<_>>();

        let mut local = 0u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();

        assert!(!segment.is_in_segment(foreign.as_ptr()));
        assert!(!segment.free(foreign));
        assert_eq!(before, segment.blocks().collect::<Vec<_>>());
    }

    #[test]
    fn double_free_is_refused() {
        let mut segment = segment(1000);
        let a = allocate(&mut segment, 100);
        let _b = allocate(&mut segment, 100);

        assert!(segment.free(a));
        assert!(!segment.free(a));
        assert_eq!(segment.blocks().count(), 1);
    }

    #[test]
    fn interior_pointer_is_refused() {
        let mut segment = segment(1000);
        let a = allocate(&mut segment, 100);

        let interior = unsafe { NonNull::new_unchecked(a.as_ptr().add(WORD_SIZE)) };
        assert!(segment.is_in_segment(interior.as_ptr()));
        assert!(!segment.free(interior));
        assert!(segment.free(a));
        assert!(segment.is_empty());
    }

    #[test]
    fn oversized_fake_header_is_not_trusted() {
        let mut segment = segment(1000);
        let a = allocate(&mut segment, 200);

        for size in [usize::MAX, usize::MAX - BLOCK_HEADER_SIZE, 1000] {
            unsafe { a.cast::<[usize; 4]>().write([0, 0, size, 0]) };
            let fake = unsafe { a.add(BLOCK_HEADER_SIZE) };

            assert_eq!(segment.owner_of(fake.as_ptr()), None);
            assert!(!segment.free(fake));
        }

        assert!(segment.free(a));
    }

    #[test]
    fn owner_is_recorded_per_block() {
        let mut segment = segment(1000);
        let a = segment.allocate(8, HeapId::new(3)).unwrap().unwrap();

        assert_eq!(segment.owner_of(a.as_ptr()), Some(HeapId::new(3)));
        assert!(segment.free(a));
        assert_eq!(segment.owner_of(a.as_ptr()), None);
    }

    #[test]
    fn used_bytes_counts_headers() {
        let mut segment = segment(1000);
        let _a = allocate(&mut segment, 10);
        let _b = allocate(&mut segment, 20);

        assert_eq!(
            segment.used_bytes(),
            2 * BLOCK_HEADER_SIZE + align_word(10) + align_word(20)
        );
    }
}

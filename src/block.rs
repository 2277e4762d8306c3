use std::mem;

use crate::heap::HeapId;

/// Header size of a block, in bytes. Four machine words, so 32 bytes on
/// 64-bit targets.
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Offset of a block header from the start of its segment's memory.
pub(crate) type BlockOffset = usize;

/// Marker stored in a link field when there is no neighbour.
const NIL: usize = usize::MAX;

/// This is the structure of a block. The fields of the block are its metadata,
/// content is placed right after this header.
///
/// ```text
/// +---------------------+ <------+
/// |      previous       |        |
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+        | -> Header
/// |        size         |        |
/// +---------------------+        |
/// |        heap         |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// Links are offsets of the sibling headers inside the same segment rather
/// than pointers, so a corrupted header can at worst name an offset the
/// segment refuses to follow. Every field is exactly one word wide, which
/// keeps the content that follows a word aligned header word aligned as well.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    previous: usize,
    next: usize,
    /// Usable bytes following the header, already word aligned.
    size: usize,
    /// Heap which the block belongs to.
    heap: HeapId,
}

impl Block {
    pub fn new(
        size: usize,
        heap: HeapId,
        previous: Option<BlockOffset>,
        next: Option<BlockOffset>,
    ) -> Self {
        Self {
            previous: previous.unwrap_or(NIL),
            next: next.unwrap_or(NIL),
            size,
            heap,
        }
    }

    /// Header left behind once a block has been destroyed. It belongs to no
    /// heap, so ownership checks on a stale pointer fail.
    pub const fn vacant() -> Self {
        Self {
            previous: NIL,
            next: NIL,
            size: 0,
            heap: HeapId::VACANT,
        }
    }

    #[inline]
    pub fn previous(&self) -> Option<BlockOffset> {
        (self.previous != NIL).then_some(self.previous)
    }

    #[inline]
    pub fn next(&self) -> Option<BlockOffset> {
        (self.next != NIL).then_some(self.next)
    }

    #[inline]
    pub fn set_previous(&mut self, previous: Option<BlockOffset>) {
        self.previous = previous.unwrap_or(NIL);
    }

    #[inline]
    pub fn set_next(&mut self, next: Option<BlockOffset>) {
        self.next = next.unwrap_or(NIL);
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn heap(&self) -> HeapId {
        self.heap
    }

    /// Offset of the content of the block at `offset`.
    #[inline]
    pub const fn data_offset(offset: BlockOffset) -> usize {
        offset + BLOCK_HEADER_SIZE
    }

    /// Offset one past the last content byte of the block at `offset`.
    #[inline]
    pub fn end(&self, offset: BlockOffset) -> usize {
        Self::data_offset(offset) + self.size
    }
}

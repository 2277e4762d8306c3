//! Helper functions for the allocator that don't particularly belong to any
//! concrete module of the crate.

use std::mem;

/// Natural word size of the machine. Every block header and every payload
/// handed out by a [`crate::segment::Segment`] is aligned to this.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// It aligns `to_be_aligned` using `aligment`.
///
/// This is used to round segment lengths to a multiple of
/// [`crate::kernel::page_size`] and block payloads to a multiple of
/// [`WORD_SIZE`], because headers placed right after a payload have to be
/// aligned too.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Shorthand for word alignment, the only alignment segments deal with.
#[inline]
pub const fn align_word(size: usize) -> usize {
    align(size, WORD_SIZE)
}

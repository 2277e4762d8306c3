//! A segmented, per-processor heap and a bitmap slab pool.
//!
//! Memory is obtained from the kernel in fixed size [`Segment`]s, and
//! nowhere else. Every allocation is a block, a small header followed by the
//! caller's bytes, carved out of a segment with a first-fit search:
//!
//! ```text
//!                                 MasterHeap
//!                  +-------------------+-------------------+
//!                  |                                       |
//!               Heap 0                                  Heap 1
//! +-----------------------------------+   +-----------------------------------+
//! | +-------+----+-------+---------+  |   | +-------+-----------+             |
//! | | Block | .. | Block | ...     |  |   | | Block | ...       |    ...      |
//! | +-------+----+-------+---------+  |   | +-------+-----------+             |
//! |   Segment          --->  Segment  |   |   Segment                         |
//! +-----------------------------------+   +-----------------------------------+
//! ```
//!
//! A [`MasterHeap`] owns one [`Heap`] per logical processor. It is an
//! explicit context object: build it once and hand it to whatever needs to
//! allocate. [`Pool`] is independent of all that and serves fixed size slots
//! of a single type; [`FallbackPool`] puts the two together.
//!
//! ```no_run
//! use segheap::MasterHeap;
//!
//! let mut master = MasterHeap::with_heaps(2, 64 * 1024)?;
//!
//! let ptr = master.allocate(0, 128)?;
//! unsafe { ptr.as_ptr().write_bytes(0, 128) };
//! master.free(ptr);
//! # Ok::<(), segheap::HeapError>(())
//! ```
//!
//! Nothing in here locks. A heap is meant to be used from the processor it
//! belongs to, and sharing a `MasterHeap` across threads needs an external
//! lock.

mod block;
mod fallback;
mod heap;
mod kernel;
mod master;
mod object;
mod pool;
mod segment;
mod utils;

pub mod config;
pub mod error;

pub use block::BLOCK_HEADER_SIZE;
pub use config::HeapConfig;
pub use error::{HeapError, Result};
pub use fallback::FallbackPool;
pub use heap::{Heap, HeapId, HeapStats, SegmentSource};
pub use master::{MasterHeap, SegmentAllocator, SharedHeap};
pub use object::{Object, Origin};
pub use pool::Pool;
pub use segment::{Blocks, Segment};
pub use utils::WORD_SIZE;

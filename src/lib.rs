//! # tagalloc - A Boundary-Tag Heap Allocator
//!
//! This crate provides a general purpose allocator with `allocate`, `free` and
//! `resize` over a single heap region that only ever grows, obtained from an
//! `sbrk`-like primitive.
//!
//! ## Overview
//!
//! The heap is a sequence of blocks bounded by two sentinels. Every block
//! carries its size and allocation bit twice, in a header and in a footer, so
//! both physical neighbours of any block can be inspected in constant time.
//! Free blocks are additionally threaded onto one doubly linked free list that
//! starts at the prologue and ends at the epilogue:
//!
//! ```text
//!   Heap Layout:
//!
//!   offset 0
//!   ┌──────────┬─────────┬───────────┬─────────┬──────────┬──────────┐
//!   │ prologue │ block A │  block B  │ block C │ block D  │ epilogue │
//!   │ [24:a]   │ [48:a]  │  [160:f]  │ [32:a]  │ [4096:f] │ [0:a]    │
//!   └──────────┴─────────┴───────────┴─────────┴──────────┴──────────┘
//!        │                    ▲  │                ▲  │         ▲
//!        └────────────────────┘  └────────────────┘  └─────────┘
//!                        free list (next links)
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Block layout, boundary tags, offsets
//!   ├── config     - Tunable parameters
//!   ├── error      - AllocError
//!   ├── heap       - Heap: bootstrap, allocate, free, resize, coalescing
//!   ├── check      - Consistency checker, statistics, block walks
//!   └── source     - HeapSource, SbrkHeap, ArenaHeap
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagalloc::{ArenaHeap, Heap};
//!
//! let arena = ArenaHeap::with_capacity(1 << 20).unwrap();
//! let mut heap = Heap::init(arena).unwrap();
//!
//! let ptr = heap.allocate(64).unwrap();
//! unsafe {
//!   ptr.as_ptr().write_bytes(0xAB, 64);
//!
//!   let ptr = heap.resize(ptr, 128).unwrap();
//!   assert_eq!(*ptr.as_ptr(), 0xAB);
//!
//!   heap.free(ptr);
//! }
//!
//! assert!(heap.check_heap(false).is_consistent());
//! ```
//!
//! ## How It Works
//!
//! Requests are rounded up to a block size: payload plus 16 bytes of tags,
//! aligned to 8, at least 32 bytes. Blocks whose payload is at most
//! [`SMALL_THRESHOLD`] bytes are *small*, everything else is *large*:
//!
//! ```text
//!                     small                          large
//!   free list scan    from the prologue, forwards    from the epilogue, backwards
//!   split             allocate the front part        allocate the back part
//!   free inserts at   the head of the list           the tail of the list
//! ```
//!
//! Small allocations therefore collect at low addresses and large ones at high
//! addresses. When nothing fits, the heap grows by at least
//! `CHUNK_SIZE * GROWTH_FACTOR` bytes. Freed blocks and fresh heap extensions
//! are merged with free neighbours at once, so two free blocks are never
//! adjacent.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: No synchronization primitives
//! - **Grow-only**: Memory is never returned to the heap source
//! - **8-byte alignment**: Payloads are aligned to 8 bytes, no more
//! - **Unchecked free**: `free` trusts its caller; use `try_free` to validate
//!
//! ## Safety
//!
//! Freeing and resizing take raw pointers and are `unsafe`: passing anything
//! but a live allocation of the same heap is undefined behaviour.

pub mod align;
mod block;
mod check;
mod config;
mod error;
mod heap;
mod source;

pub use block::{ALIGNMENT, BlockRef, MIN_BLOCK_SIZE, OVERHEAD, Tag};
pub use check::{BlockInfo, HeapReport, HeapStats, Violation};
pub use config::{CHUNK_SIZE, Config, GROWTH_FACTOR, SMALL_THRESHOLD};
pub use error::{AllocError, AllocResult};
pub use heap::Heap;
pub use source::{ArenaHeap, HeapSource, SbrkHeap};

//! Block layout.
//!
//! Every block starts with an 8-byte header slot and ends with an 8-byte
//! footer slot. Both hold the same [`Tag`]: the block size in the upper bits
//! and the allocation flag in bit 0. While a block is free the two words
//! after the header are its free-list links.
//!
//! ```text
//!   offset 0        8          16         24            size-8     size
//!   ┌──────────────┬──────────┬──────────┬─── ... ─────┬──────────┐
//!   │ header (tag) │ next     │ prev     │             │ footer   │
//!   └──────────────┴──────────┴──────────┴─── ... ─────┴──────────┘
//!                  ▲
//!                  └── payload starts here once allocated
//! ```
//!
//! Blocks are named by their byte offset from the start of the heap, never by
//! address, so every location below is plain offset arithmetic.

use std::fmt;

use crate::align;

/// Alignment of every block boundary and every payload.
pub const ALIGNMENT: usize = 8;
/// Size of one heap word, the unit heap growth is requested in.
pub const WORD_SIZE: usize = 8;
pub const HEADER_SIZE: usize = 8;
pub const FOOTER_SIZE: usize = 8;
/// Bytes of a block that never belong to the payload.
pub const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;
pub const LINK_SIZE: usize = 8;
/// Smallest block that can sit in the free list: tags plus both links.
pub const MIN_BLOCK_SIZE: usize = OVERHEAD + 2 * LINK_SIZE;
/// Size of a sentinel block: a header and both links, without a footer.
pub const SENTINEL_SIZE: usize = HEADER_SIZE + 2 * LINK_SIZE;
/// Largest size a tag can encode. Also bounds the whole heap.
pub const MAX_BLOCK_SIZE: usize = u32::MAX as usize & !(ALIGNMENT - 1);

const ALLOCATED_BIT: u32 = 1;
const SIZE_MASK: u32 = !(ALIGNMENT as u32 - 1);

/// Offset of a block header from the start of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(usize);

impl BlockRef {
  /// The prologue sentinel always sits at the very start of the heap.
  pub const PROLOGUE: BlockRef = BlockRef(0);
  /// First block after the prologue. Its predecessor has no footer.
  pub const FIRST: BlockRef = BlockRef(SENTINEL_SIZE);
  /// Link value meaning "no block".
  pub(crate) const NIL: BlockRef = BlockRef(usize::MAX);

  pub(crate) const fn new(offset: usize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0
  }

  pub(crate) const fn is_nil(self) -> bool {
    self.0 == usize::MAX
  }

  /// Offset of the first payload byte.
  pub const fn payload(self) -> usize {
    self.0 + HEADER_SIZE
  }

  pub(crate) const fn from_payload(payload: usize) -> Self {
    Self(payload - HEADER_SIZE)
  }

  pub(crate) const fn next_link(self) -> usize {
    self.0 + HEADER_SIZE
  }

  pub(crate) const fn prev_link(self) -> usize {
    self.0 + HEADER_SIZE + LINK_SIZE
  }

  pub(crate) const fn footer(
    self,
    size: usize,
  ) -> usize {
    self.0 + size - FOOTER_SIZE
  }

  /// Footer slot of the physically preceding block.
  pub(crate) const fn preceding_footer(self) -> usize {
    self.0 - FOOTER_SIZE
  }

  /// The block physically following one of `size` bytes.
  pub(crate) const fn advance(
    self,
    size: usize,
  ) -> Self {
    Self(self.0 + size)
  }
}

impl fmt::Display for BlockRef {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    if self.is_nil() {
      f.write_str("nil")
    } else {
      write!(f, "+{:#x}", self.0)
    }
  }
}

/// Boundary tag stored in both the header and the footer of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag(u32);

impl Tag {
  pub fn new(
    size: usize,
    allocated: bool,
  ) -> Self {
    debug_assert!(size % ALIGNMENT == 0, "unaligned block size {size}");
    debug_assert!(size <= MAX_BLOCK_SIZE, "block size {size} overflows a tag");
    Self(size as u32 | allocated as u32)
  }

  pub(crate) const fn from_raw(raw: u32) -> Self {
    Self(raw)
  }

  pub(crate) const fn raw(self) -> u32 {
    self.0
  }

  pub const fn size(self) -> usize {
    (self.0 & SIZE_MASK) as usize
  }

  pub const fn is_allocated(self) -> bool {
    self.0 & ALLOCATED_BIT != 0
  }
}

impl fmt::Display for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "[{}:{}]", self.size(), if self.is_allocated() { 'a' } else { 'f' })
  }
}

/// Block size needed to serve a `payload` byte request, or `None` when the
/// request cannot be encoded in a tag.
pub fn adjusted_size(payload: usize) -> Option<usize> {
  if payload > MAX_BLOCK_SIZE - OVERHEAD {
    return None;
  }
  Some(align!(payload + OVERHEAD).max(MIN_BLOCK_SIZE))
}

//! The allocator context: bootstrap, allocation, deallocation, resize,
//! placement, coalescing and heap growth over one [`HeapSource`].

use std::{iter, ptr, ptr::NonNull};

use crate::{
  AllocError, AllocResult, Config, HeapSource,
  block::{
    ALIGNMENT, BlockRef, HEADER_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, SENTINEL_SIZE, Tag, WORD_SIZE,
    adjusted_size,
  },
};

const NIL_LINK: u64 = u64::MAX;

/// A boundary-tag heap with an explicit, doubly linked free list.
///
/// Small requests are served from the front of the free list and placed at
/// the low end of the block they land in; large requests are searched from
/// the back and placed at the high end. This keeps small and large live
/// allocations apart in the address space.
///
/// A `Heap` is single-threaded: every operation takes `&mut self` and runs to
/// completion.
pub struct Heap<S: HeapSource> {
  source: S,
  base: NonNull<u8>,
  len: usize,
  epilogue: BlockRef,
  config: Config,
}

impl<S: HeapSource> Heap<S> {
  /// Bootstraps a heap with the default [`Config`].
  pub fn init(source: S) -> AllocResult<Self> {
    Self::with_config(source, Config::default())
  }

  /// Requests the first chunk from `source` and lays out the prologue, one
  /// free block spanning the rest of the chunk, and the epilogue.
  pub fn with_config(
    mut source: S,
    config: Config,
  ) -> AllocResult<Self> {
    config.validate()?;

    let chunk = config.chunk_size;
    let base = source.extend(chunk).ok_or(AllocError::InitFailed { requested: chunk })?;
    if base.as_ptr() as usize % ALIGNMENT != 0 {
      return Err(AllocError::MisalignedBase(base.as_ptr() as usize));
    }

    let first = BlockRef::FIRST;
    let first_size = chunk - 2 * SENTINEL_SIZE;
    let epilogue = first.advance(first_size);

    let mut heap = Self {
      source,
      base,
      len: chunk,
      epilogue,
      config,
    };

    heap.set_header(BlockRef::PROLOGUE, Tag::new(SENTINEL_SIZE, true));
    heap.set_prev(BlockRef::PROLOGUE, BlockRef::NIL);
    heap.write_tags(first, Tag::new(first_size, false));
    heap.set_header(epilogue, Tag::new(0, true));
    heap.set_next(epilogue, BlockRef::NIL);
    heap.link(BlockRef::PROLOGUE, first);
    heap.link(first, epilogue);

    log::debug!("heap initialised at {:p}: {} bytes, first block {} bytes", base, chunk, first_size);

    Ok(heap)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Total bytes obtained from the heap source so far.
  pub fn heap_size(&self) -> usize {
    self.len
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn into_source(self) -> S {
    self.source
  }

  /// Allocates a block with room for at least `size` payload bytes.
  ///
  /// Returns `None` for a zero-size request and when the heap cannot grow.
  /// The returned pointer is 8-byte aligned.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    match self.try_allocate(size) {
      Ok(address) => Some(address),
      Err(AllocError::ZeroSize) => None,
      Err(err) => {
        log::warn!("allocate({}) failed: {}", size, err);
        None
      }
    }
  }

  /// Like [`Heap::allocate`], but tells a zero-size request apart from
  /// exhaustion.
  pub fn try_allocate(
    &mut self,
    size: usize,
  ) -> AllocResult<NonNull<u8>> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let asize = adjusted_size(size).ok_or(AllocError::TooLarge { requested: size })?;

    let block = match self.find_fit(asize) {
      Some(block) => block,
      None => {
        let bytes = self.config.growth_size(asize);
        self.extend_heap(bytes / WORD_SIZE)?
      }
    };

    let block = self.place(block, asize);
    let address = self.payload_ptr(block);

    log::trace!("allocate({}) -> {:p} (block {}, {} bytes)", size, address, block, asize);

    Ok(address)
  }

  /// Returns a block to the free list and merges it with free neighbours.
  ///
  /// # Safety
  ///
  /// `address` must have been returned by [`Heap::allocate`] or
  /// [`Heap::resize`] on this heap and not freed since. Nothing is checked;
  /// see [`Heap::try_free`] for a validating variant.
  pub unsafe fn free(
    &mut self,
    address: NonNull<u8>,
  ) {
    let block = self.block_of(address);
    let size = self.header(block).size();

    self.write_tags(block, Tag::new(size, false));

    if self.config.is_small(size) {
      let first = self.next(BlockRef::PROLOGUE);
      self.link(BlockRef::PROLOGUE, block);
      self.link(block, first);
    } else {
      let last = self.prev(self.epilogue);
      self.link(last, block);
      self.link(block, self.epilogue);
    }

    let merged = self.coalesce(block);

    log::trace!("free({:p}) block {} ({} bytes) -> free block {}", address, block, size, merged);
  }

  /// Frees `address` after checking that it names a live allocation.
  ///
  /// The check reads the boundary tags around the pointer: it rejects
  /// pointers outside the heap, misaligned pointers, blocks not marked
  /// allocated (such as a double free) and blocks whose header and footer
  /// disagree. A pointer into the middle of a payload whose bytes happen to
  /// look like a valid tag pair is not detected.
  pub fn try_free(
    &mut self,
    address: NonNull<u8>,
  ) -> AllocResult<()> {
    self.live_block(address)?;
    unsafe { self.free(address) };
    Ok(())
  }

  /// Moves an allocation into a block with room for `new_size` bytes.
  ///
  /// Always allocates a new block, copies `min(capacity, new_size)` bytes and
  /// frees the old one. On failure the original allocation is left intact.
  ///
  /// # Safety
  ///
  /// `address` must be a live allocation of this heap. On success it is
  /// invalidated.
  pub unsafe fn resize(
    &mut self,
    address: NonNull<u8>,
    new_size: usize,
  ) -> AllocResult<NonNull<u8>> {
    let capacity = unsafe { self.usable_size(address) };

    let moved = self.try_allocate(new_size).inspect_err(|err| {
      log::warn!("resize({:p}, {}) failed: {}", address, new_size, err);
    })?;

    unsafe {
      ptr::copy_nonoverlapping(address.as_ptr(), moved.as_ptr(), capacity.min(new_size));
      self.free(address);
    }

    log::trace!("resize({:p}, {}) -> {:p}", address, new_size, moved);

    Ok(moved)
  }

  /// Payload bytes available behind a live allocation.
  ///
  /// # Safety
  ///
  /// `address` must be a live allocation of this heap.
  pub unsafe fn usable_size(
    &self,
    address: NonNull<u8>,
  ) -> usize {
    self.header(self.block_of(address)).size() - OVERHEAD
  }

  /// Free-list members, front to back.
  pub(crate) fn free_blocks_forward(&self) -> impl Iterator<Item = BlockRef> + '_ {
    iter::successors(Some(self.next(BlockRef::PROLOGUE)), move |&block| Some(self.next(block)))
      .take_while(move |&block| block != self.epilogue)
  }

  /// Free-list members, back to front.
  pub(crate) fn free_blocks_backward(&self) -> impl Iterator<Item = BlockRef> + '_ {
    iter::successors(Some(self.prev(self.epilogue)), move |&block| Some(self.prev(block)))
      .take_while(|&block| block != BlockRef::PROLOGUE)
  }

  /// First fit. Small requests scan from the head of the list, large ones
  /// from the tail.
  fn find_fit(
    &self,
    asize: usize,
  ) -> Option<BlockRef> {
    let fits = |block: &BlockRef| {
      let tag = self.header(*block);
      !tag.is_allocated() && tag.size() >= asize
    };

    if self.config.is_small(asize) {
      self.free_blocks_forward().find(fits)
    } else {
      self.free_blocks_backward().find(fits)
    }
  }

  /// Carves an `asize` allocation out of the free `block` and returns the
  /// allocated part.
  fn place(
    &mut self,
    block: BlockRef,
    asize: usize,
  ) -> BlockRef {
    let size = self.header(block).size();
    let remainder = size - asize;

    if remainder < MIN_BLOCK_SIZE {
      // the splinter is absorbed into the allocation
      self.unlink(block);
      self.write_tags(block, Tag::new(size, true));
      return block;
    }

    if self.config.is_small(asize) {
      let rest = block.advance(asize);
      let (prev, next) = (self.prev(block), self.next(block));

      self.write_tags(block, Tag::new(asize, true));
      self.write_tags(rest, Tag::new(remainder, false));
      self.link(prev, rest);
      self.link(rest, next);

      log::trace!("place: split {} into {} + free {}", size, asize, remainder);
      block
    } else {
      // the free front keeps the list position it already has
      let allocated = block.advance(remainder);

      self.write_tags(block, Tag::new(remainder, false));
      self.write_tags(allocated, Tag::new(asize, true));

      log::trace!("place: split {} into free {} + {}", size, remainder, asize);
      allocated
    }
  }

  /// Merges the free `block` with its free physical neighbours and returns
  /// the resulting block. The result is not moved in the free list.
  fn coalesce(
    &mut self,
    block: BlockRef,
  ) -> BlockRef {
    let size = self.header(block).size();

    let next = block.advance(size);
    let next_tag = self.header(next);

    // the prologue has no footer to look at
    let prev_tag = if block == BlockRef::FIRST {
      None
    } else {
      Some(self.tag_at(block.preceding_footer())).filter(|tag| !tag.is_allocated())
    };

    match (prev_tag, next_tag.is_allocated()) {
      (None, true) => block,
      (None, false) => {
        self.unlink(next);
        self.write_tags(block, Tag::new(size + next_tag.size(), false));
        block
      }
      (Some(prev_tag), true) => {
        let prev = BlockRef::new(block.offset() - prev_tag.size());
        self.unlink(block);
        self.write_tags(prev, Tag::new(prev_tag.size() + size, false));
        prev
      }
      (Some(prev_tag), false) => {
        let prev = BlockRef::new(block.offset() - prev_tag.size());
        self.unlink(block);
        self.unlink(next);
        self.write_tags(prev, Tag::new(prev_tag.size() + size + next_tag.size(), false));
        prev
      }
    }
  }

  /// Grows the heap by `words` words. The old epilogue becomes the header of
  /// the new free block, which is then coalesced with its predecessor.
  fn extend_heap(
    &mut self,
    words: usize,
  ) -> AllocResult<BlockRef> {
    let bytes = words.saturating_mul(WORD_SIZE);
    debug_assert!(bytes >= MIN_BLOCK_SIZE);

    if self.len.checked_add(bytes).is_none_or(|len| len > MAX_BLOCK_SIZE) {
      return Err(AllocError::Exhausted { requested: bytes });
    }

    let start = self.source.extend(bytes).ok_or(AllocError::Exhausted { requested: bytes })?;
    let expected = self.base.as_ptr() as usize + self.len;
    if start.as_ptr() as usize != expected {
      return Err(AllocError::NonContiguous {
        expected,
        found: start.as_ptr() as usize,
      });
    }
    self.len += bytes;

    // keeps the old epilogue's prev link, so the block lands at the list tail
    let block = self.epilogue;
    let epilogue = block.advance(bytes);

    self.write_tags(block, Tag::new(bytes, false));
    self.set_header(epilogue, Tag::new(0, true));
    self.set_next(epilogue, BlockRef::NIL);
    self.link(block, epilogue);
    self.epilogue = epilogue;

    log::debug!("heap grown by {} bytes to {} bytes", bytes, self.len);

    Ok(self.coalesce(block))
  }

  /// Resolves `address` to an allocated block, validating its tags.
  fn live_block(
    &self,
    address: NonNull<u8>,
  ) -> AllocResult<BlockRef> {
    let invalid = AllocError::InvalidPointer(address.as_ptr() as usize);
    let offset = (address.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);

    if offset < BlockRef::FIRST.payload() || offset >= self.epilogue.offset() || offset % ALIGNMENT != 0 {
      return Err(invalid);
    }

    let block = BlockRef::from_payload(offset);
    let tag = self.header(block);
    if !tag.is_allocated() || tag.size() < MIN_BLOCK_SIZE || tag.size() > self.epilogue.offset() - block.offset()
    {
      return Err(invalid);
    }
    if self.tag_at(block.footer(tag.size())) != tag {
      return Err(invalid);
    }

    Ok(block)
  }

  pub(crate) fn epilogue(&self) -> BlockRef {
    self.epilogue
  }

  pub(crate) fn address_of(
    &self,
    offset: usize,
  ) -> usize {
    self.base.as_ptr() as usize + offset
  }

  fn payload_ptr(
    &self,
    block: BlockRef,
  ) -> NonNull<u8> {
    unsafe { self.base.add(block.payload()) }
  }

  fn block_of(
    &self,
    address: NonNull<u8>,
  ) -> BlockRef {
    BlockRef::from_payload(address.as_ptr() as usize - self.base.as_ptr() as usize)
  }

  /// Splices `block` out of the free list.
  fn unlink(
    &mut self,
    block: BlockRef,
  ) {
    let (prev, next) = (self.prev(block), self.next(block));
    self.link(prev, next);
  }

  fn link(
    &mut self,
    from: BlockRef,
    to: BlockRef,
  ) {
    self.set_next(from, to);
    self.set_prev(to, from);
  }

  pub(crate) fn header(
    &self,
    block: BlockRef,
  ) -> Tag {
    self.tag_at(block.offset())
  }

  /// Tag in the footer slot implied by the header's size.
  pub(crate) fn footer(
    &self,
    block: BlockRef,
  ) -> Tag {
    self.tag_at(block.footer(self.header(block).size()))
  }

  pub(crate) fn next(
    &self,
    block: BlockRef,
  ) -> BlockRef {
    self.link_at(block.next_link())
  }

  pub(crate) fn prev(
    &self,
    block: BlockRef,
  ) -> BlockRef {
    self.link_at(block.prev_link())
  }

  fn set_header(
    &mut self,
    block: BlockRef,
    tag: Tag,
  ) {
    self.store_u32(block.offset(), tag.raw());
  }

  fn write_tags(
    &mut self,
    block: BlockRef,
    tag: Tag,
  ) {
    self.set_header(block, tag);
    self.store_u32(block.footer(tag.size()), tag.raw());
  }

  fn set_next(
    &mut self,
    block: BlockRef,
    next: BlockRef,
  ) {
    self.store_link(block.next_link(), next);
  }

  fn set_prev(
    &mut self,
    block: BlockRef,
    prev: BlockRef,
  ) {
    self.store_link(block.prev_link(), prev);
  }

  pub(crate) fn tag_at(
    &self,
    offset: usize,
  ) -> Tag {
    Tag::from_raw(self.load_u32(offset))
  }

  fn link_at(
    &self,
    offset: usize,
  ) -> BlockRef {
    match self.load_u64(offset) {
      NIL_LINK => BlockRef::NIL,
      link => BlockRef::new(link as usize),
    }
  }

  fn store_link(
    &mut self,
    offset: usize,
    block: BlockRef,
  ) {
    let raw = if block.is_nil() { NIL_LINK } else { block.offset() as u64 };
    self.store_u64(offset, raw);
  }

  // Every offset below is 8-aligned and inside [0, len); the base is 8-aligned.

  fn load_u32(
    &self,
    offset: usize,
  ) -> u32 {
    debug_assert!(offset % ALIGNMENT == 0 && offset + HEADER_SIZE <= self.len, "tag read at {offset:#x}");
    unsafe { self.base.as_ptr().add(offset).cast::<u32>().read() }
  }

  fn store_u32(
    &mut self,
    offset: usize,
    value: u32,
  ) {
    debug_assert!(offset % ALIGNMENT == 0 && offset + HEADER_SIZE <= self.len, "tag write at {offset:#x}");
    unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(value) }
  }

  fn load_u64(
    &self,
    offset: usize,
  ) -> u64 {
    debug_assert!(offset % ALIGNMENT == 0 && offset + WORD_SIZE <= self.len, "link read at {offset:#x}");
    unsafe { self.base.as_ptr().add(offset).cast::<u64>().read() }
  }

  fn store_u64(
    &mut self,
    offset: usize,
    value: u64,
  ) {
    debug_assert!(offset % ALIGNMENT == 0 && offset + WORD_SIZE <= self.len, "link write at {offset:#x}");
    unsafe { self.base.as_ptr().add(offset).cast::<u64>().write(value) }
  }
}

//! Heap sources: where the managed region comes from.

use std::{
  alloc::{self, Layout},
  ptr::NonNull,
};

use libc::{c_void, intptr_t, sbrk};

use crate::{AllocError, AllocResult, align_to, block::ALIGNMENT};

/// The heap-growth primitive.
///
/// # Safety
///
/// A successful `extend(bytes)` must return a pointer to `bytes` writable
/// bytes that stay valid, and are not touched by anyone else, for as long as
/// the source is alive. Memory is never handed back.
pub unsafe trait HeapSource {
  /// Grows the region by `bytes` at its high end and returns the start of
  /// the new span, or `None` when no more memory is available.
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Option<NonNull<u8>>;
}

/// Grows the process data segment with `sbrk(2)`.
///
/// Only one `SbrkHeap` should be live per process, and nothing else in the
/// process may move the program break while it is in use.
#[derive(Debug, Default)]
pub struct SbrkHeap {
  aligned: bool,
}

impl SbrkHeap {
  pub fn new() -> Self {
    Self::default()
  }

  /// Pads the current break up to the block alignment.
  unsafe fn align_break(&mut self) -> Option<()> {
    let current = unsafe { sbrk(0) } as usize;
    let padding = align_to!(current, ALIGNMENT) - current;
    if padding != 0 && unsafe { sbrk(padding as intptr_t) } == usize::MAX as *mut c_void {
      return None;
    }
    self.aligned = true;
    Some(())
  }
}

unsafe impl HeapSource for SbrkHeap {
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Option<NonNull<u8>> {
    let increment = intptr_t::try_from(bytes).ok()?;

    unsafe {
      if !self.aligned {
        self.align_break()?;
      }

      let address = sbrk(increment);

      if address == usize::MAX as *mut c_void {
        log::debug!("sbrk({}) failed", bytes);
        return None;
      }

      NonNull::new(address.cast())
    }
  }
}

/// A fixed-capacity, page-aligned region reserved up front.
///
/// Hands out consecutive slices of the region and fails once it is used up,
/// which makes exhaustion reproducible.
#[derive(Debug)]
pub struct ArenaHeap {
  start: NonNull<u8>,
  layout: Layout,
  brk: usize,
}

impl ArenaHeap {
  pub const PAGE_SIZE: usize = 4096;

  pub fn with_capacity(capacity: usize) -> AllocResult<Self> {
    let unavailable = AllocError::ArenaUnavailable { capacity };
    let size = capacity.max(1).checked_add(Self::PAGE_SIZE - 1).ok_or(unavailable.clone())?;
    let layout = Layout::from_size_align(size & !(Self::PAGE_SIZE - 1), Self::PAGE_SIZE)
      .map_err(|_| unavailable.clone())?;

    let start = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(unavailable)?;

    Ok(Self { start, layout, brk: 0 })
  }

  pub fn capacity(&self) -> usize {
    self.layout.size()
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    self.brk
  }
}

unsafe impl HeapSource for ArenaHeap {
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Option<NonNull<u8>> {
    if bytes > self.capacity() - self.brk {
      log::debug!(
        "arena exhausted: requested {} bytes, {} of {} in use",
        bytes,
        self.brk,
        self.capacity()
      );
      return None;
    }

    let address = unsafe { self.start.add(self.brk) };
    self.brk += bytes;
    Some(address)
  }
}

impl Drop for ArenaHeap {
  fn drop(&mut self) {
    unsafe { alloc::dealloc(self.start.as_ptr(), self.layout) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_arena_hands_out_consecutive_spans() {
    let mut arena = ArenaHeap::with_capacity(8192).unwrap();
    assert_eq!(arena.capacity(), 8192);
    assert_eq!(arena.start.as_ptr() as usize % ArenaHeap::PAGE_SIZE, 0);

    let first = arena.extend(4096).unwrap();
    let second = arena.extend(1024).unwrap();
    assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 4096);
    assert_eq!(arena.used(), 5120);
  }

  #[test]
  fn test_arena_fails_past_capacity() {
    let mut arena = ArenaHeap::with_capacity(4096).unwrap();
    assert!(arena.extend(4097).is_none());
    assert!(arena.extend(4096).is_some());
    assert!(arena.extend(8).is_none());
    assert_eq!(arena.used(), 4096);
  }

  #[test]
  fn test_arena_rounds_capacity_to_pages() {
    let arena = ArenaHeap::with_capacity(100).unwrap();
    assert_eq!(arena.capacity(), ArenaHeap::PAGE_SIZE);
  }
}

//! Heap inspection: the consistency checker, statistics and block walks.
//!
//! Nothing here mutates the heap. The checker reports what it finds and
//! leaves it to the host to decide whether a violation is fatal.

use std::{collections::BTreeSet, fmt, iter};

use thiserror::Error;

use crate::{
  Heap, HeapSource,
  block::{ALIGNMENT, BlockRef, MIN_BLOCK_SIZE, SENTINEL_SIZE, Tag},
};

/// An invariant the checker found broken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  #[error("bad prologue header {0}")]
  BadPrologue(Tag),

  #[error("bad epilogue header {tag} at {block}")]
  BadEpilogue { block: BlockRef, tag: Tag },

  #[error("payload of block {0} is not aligned")]
  Misaligned(BlockRef),

  #[error("header {header} does not match footer {footer} at {block}")]
  TagMismatch { block: BlockRef, header: Tag, footer: Tag },

  #[error("block {block} has impossible size {size}, heap walk stopped")]
  BadSize { block: BlockRef, size: usize },

  #[error("free block {0} follows another free block")]
  AdjacentFree(BlockRef),

  #[error("block {0} is in the free list but marked allocated")]
  ListedNotFree(BlockRef),

  #[error("free block {0} is missing from the free list")]
  FreeNotListed(BlockRef),

  #[error("free list link {block} -> {next} has no matching back link")]
  BrokenLink { block: BlockRef, next: BlockRef },

  #[error("free list points outside the heap: {0}")]
  ListOutOfBounds(BlockRef),

  #[error("free list revisits block {0}")]
  ListCycle(BlockRef),

  #[error("free list is {forward} blocks long forwards but {backward} backwards")]
  ListLengthMismatch { forward: usize, backward: usize },
}

/// Block counts and byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_size: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

impl HeapStats {
  fn record(
    &mut self,
    tag: Tag,
  ) {
    if tag.is_allocated() {
      self.allocated_blocks += 1;
      self.allocated_bytes += tag.size();
    } else {
      self.free_blocks += 1;
      self.free_bytes += tag.size();
      self.largest_free = self.largest_free.max(tag.size());
    }
  }
}

/// What [`Heap::check_heap`] found.
#[derive(Debug, Clone, Default)]
pub struct HeapReport {
  pub violations: Vec<Violation>,
  pub stats: HeapStats,
  /// Block-by-block listing, filled only by a verbose check.
  pub dump: Vec<String>,
}

impl HeapReport {
  pub fn is_consistent(&self) -> bool {
    self.violations.is_empty()
  }
}

impl fmt::Display for HeapReport {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let stats = &self.stats;
    writeln!(
      f,
      "heap: {} bytes, {} allocated blocks ({} bytes), {} free blocks ({} bytes, largest {})",
      stats.heap_size,
      stats.allocated_blocks,
      stats.allocated_bytes,
      stats.free_blocks,
      stats.free_bytes,
      stats.largest_free
    )?;
    for line in &self.dump {
      writeln!(f, "  {line}")?;
    }
    for violation in &self.violations {
      writeln!(f, "  error: {violation}")?;
    }
    Ok(())
  }
}

/// Snapshot of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub block: BlockRef,
  /// Address of the block header.
  pub address: usize,
  pub size: usize,
  pub allocated: bool,
  /// Free-list neighbours; only present while the block is free.
  pub links: Option<(BlockRef, BlockRef)>,
}

impl fmt::Display for BlockInfo {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{:#x}: header: {}", self.address, Tag::new(self.size, self.allocated))?;
    match self.links {
      Some((prev, next)) => write!(f, " prev: {prev} next: {next}"),
      None => Ok(()),
    }
  }
}

impl<S: HeapSource> Heap<S> {
  /// Walks the heap and validates its invariants.
  ///
  /// The physical walk checks the sentinels, payload alignment, matching
  /// boundary tags and that no two neighbours are both free. The free list is
  /// then walked in both directions and compared with the free blocks seen
  /// physically. With `verbose` every block is listed in
  /// [`HeapReport::dump`] and also logged at info level, so the listing is
  /// available whether or not a logger is installed.
  pub fn check_heap(
    &self,
    verbose: bool,
  ) -> HeapReport {
    let mut report = HeapReport::default();
    report.stats.heap_size = self.heap_size();

    let physical_free = self.check_blocks(verbose, &mut report);
    self.check_free_list(&physical_free, &mut report.violations);

    for violation in &report.violations {
      log::warn!("heap check: {}", violation);
    }

    report
  }

  /// Counts blocks and bytes without validating anything.
  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      heap_size: self.heap_size(),
      ..HeapStats::default()
    };
    for block in self.block_refs() {
      stats.record(self.header(block));
    }
    stats
  }

  /// Every block between the sentinels, in address order.
  ///
  /// Assumes a consistent heap; run [`Heap::check_heap`] first when in doubt.
  pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
    self.block_refs().map(move |block| self.block_info(block))
  }

  /// Members of the free list, from the prologue side to the epilogue side.
  pub fn free_list(&self) -> impl Iterator<Item = BlockInfo> + '_ {
    self.free_blocks_forward().map(move |block| self.block_info(block))
  }

  fn block_refs(&self) -> impl Iterator<Item = BlockRef> + '_ {
    let end = self.epilogue();
    iter::successors(Some(BlockRef::FIRST), move |&block| Some(block.advance(self.header(block).size())))
      .take_while(move |&block| block != end)
  }

  fn block_info(
    &self,
    block: BlockRef,
  ) -> BlockInfo {
    let tag = self.header(block);
    BlockInfo {
      block,
      address: self.address_of(block.offset()),
      size: tag.size(),
      allocated: tag.is_allocated(),
      links: (!tag.is_allocated()).then(|| (self.prev(block), self.next(block))),
    }
  }

  /// Physical walk. Returns the free blocks it passed.
  fn check_blocks(
    &self,
    verbose: bool,
    report: &mut HeapReport,
  ) -> BTreeSet<BlockRef> {
    let violations = &mut report.violations;
    let dump = &mut report.dump;
    let mut print = |line: String| {
      log::info!("{}", line);
      dump.push(line);
    };
    let end = self.epilogue();

    let prologue = self.header(BlockRef::PROLOGUE);
    if verbose {
      print(format!("heap ({:#x}):", self.address_of(0)));
      print(format!("{:#x}: prologue {}", self.address_of(0), prologue));
    }
    if prologue.size() != SENTINEL_SIZE || !prologue.is_allocated() {
      violations.push(Violation::BadPrologue(prologue));
    }

    let mut free = BTreeSet::new();
    let mut previous_free = false;
    let mut block = BlockRef::FIRST;

    while block != end {
      let header = self.header(block);
      let size = header.size();
      if size < MIN_BLOCK_SIZE || size > end.offset() - block.offset() {
        violations.push(Violation::BadSize { block, size });
        break;
      }

      let footer = self.footer(block);
      if verbose {
        print(format!("{} footer: {}", self.block_info(block), footer));
      }

      if self.address_of(block.payload()) % ALIGNMENT != 0 {
        violations.push(Violation::Misaligned(block));
      }
      if footer != header {
        violations.push(Violation::TagMismatch { block, header, footer });
      }

      report.stats.record(header);
      if !header.is_allocated() {
        if previous_free {
          violations.push(Violation::AdjacentFree(block));
        }
        free.insert(block);
      }
      previous_free = !header.is_allocated();

      block = block.advance(size);
    }

    let tag = self.header(end);
    if verbose {
      print(format!("{:#x}: EOL", self.address_of(end.offset())));
    }
    if tag.size() != 0 || !tag.is_allocated() {
      violations.push(Violation::BadEpilogue { block: end, tag });
    }

    free
  }

  /// Walks the free list both ways and compares it with the physical walk.
  fn check_free_list(
    &self,
    physical_free: &BTreeSet<BlockRef>,
    violations: &mut Vec<Violation>,
  ) {
    let end = self.epilogue();
    let limit = self.heap_size() / MIN_BLOCK_SIZE;
    let in_heap = |block: BlockRef| {
      !block.is_nil() && block >= BlockRef::FIRST && block < end && block.offset() % ALIGNMENT == 0
    };

    let mut listed = BTreeSet::new();
    let mut current = BlockRef::PROLOGUE;
    loop {
      let next = self.next(current);
      if next != end && !in_heap(next) {
        violations.push(Violation::ListOutOfBounds(next));
        break;
      }
      if self.prev(next) != current {
        violations.push(Violation::BrokenLink { block: current, next });
      }
      if next == end {
        break;
      }
      if !listed.insert(next) || listed.len() > limit {
        violations.push(Violation::ListCycle(next));
        break;
      }
      if self.header(next).is_allocated() {
        violations.push(Violation::ListedNotFree(next));
      }
      current = next;
    }

    let mut backward = 0;
    let mut current = end;
    loop {
      let prev = self.prev(current);
      if prev == BlockRef::PROLOGUE {
        break;
      }
      if !in_heap(prev) || backward > limit {
        break;
      }
      backward += 1;
      current = prev;
    }

    if listed.len() != backward {
      violations.push(Violation::ListLengthMismatch {
        forward: listed.len(),
        backward,
      });
    }

    for &block in physical_free.difference(&listed) {
      violations.push(Violation::FreeNotListed(block));
    }
  }
}

#[cfg(test)]
mod tests {
  use std::ptr::NonNull;

  use super::*;
  use crate::{ArenaHeap, CHUNK_SIZE, OVERHEAD};

  fn heap() -> Heap<ArenaHeap> {
    Heap::init(ArenaHeap::with_capacity(1 << 20).unwrap()).unwrap()
  }

  unsafe fn write_tag(
    at: *mut u8,
    tag: Tag,
  ) {
    unsafe { at.cast::<u32>().write(tag.raw()) }
  }

  unsafe fn set_tags(
    heap: &Heap<ArenaHeap>,
    address: NonNull<u8>,
    allocated: bool,
  ) {
    unsafe {
      let size = heap.usable_size(address) + OVERHEAD;
      let tag = Tag::new(size, allocated);
      write_tag(address.as_ptr().sub(8), tag);
      write_tag(address.as_ptr().add(size - OVERHEAD), tag);
    }
  }

  #[test]
  fn test_fresh_heap_is_consistent() {
    let heap = heap();
    let report = heap.check_heap(true);

    assert!(report.is_consistent(), "{report}");
    assert_eq!(report.stats, HeapStats {
      heap_size: CHUNK_SIZE,
      allocated_blocks: 0,
      allocated_bytes: 0,
      free_blocks: 1,
      free_bytes: CHUNK_SIZE - 48,
      largest_free: CHUNK_SIZE - 48,
    });
    assert_eq!(heap.stats(), report.stats);
  }

  #[test]
  fn test_verbose_check_lists_every_block() {
    let mut heap = heap();
    let _a = heap.allocate(16).unwrap();

    let quiet = heap.check_heap(false);
    assert!(quiet.dump.is_empty());

    let report = heap.check_heap(true);
    assert_eq!(report.dump.len(), 2 + heap.blocks().count() + 1);
    assert!(report.dump[1].ends_with("prologue [24:a]"));
    assert!(report.dump[2].ends_with("header: [32:a] footer: [32:a]"));
    assert!(report.dump[3].contains("header: [65456:f] prev: +0x0 next: +0xffe8 footer: [65456:f]"));
    assert!(report.dump[4].ends_with(": EOL"));
    assert!(report.to_string().contains("EOL"));
  }

  #[test]
  fn test_stats_track_allocations() {
    let mut heap = heap();
    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(500).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 2);
    assert_eq!(stats.allocated_bytes, 32 + 520);
    assert_eq!(stats.free_bytes, CHUNK_SIZE - 48 - 32 - 520);

    // merges with the free space behind it
    unsafe { heap.free(a) };
    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free, CHUNK_SIZE - 48 - 520);
  }

  #[test]
  fn test_detects_footer_mismatch() {
    let mut heap = heap();
    let address = heap.allocate(64).unwrap();

    unsafe { write_tag(address.as_ptr().add(64), Tag::new(4096, true)) };

    let report = heap.check_heap(false);
    assert!(report.violations.contains(&Violation::TagMismatch {
      block: BlockRef::FIRST,
      header: Tag::new(80, true),
      footer: Tag::new(4096, true),
    }));
  }

  #[test]
  fn test_detects_unlisted_and_adjacent_free_blocks() {
    let mut heap = heap();
    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    let _guard = heap.allocate(16).unwrap();

    unsafe {
      set_tags(&heap, a, false);
      set_tags(&heap, b, false);
    }

    let second = BlockRef::FIRST.advance(32);
    let report = heap.check_heap(false);
    assert!(report.violations.contains(&Violation::AdjacentFree(second)));
    assert!(report.violations.contains(&Violation::FreeNotListed(BlockRef::FIRST)));
    assert!(report.violations.contains(&Violation::FreeNotListed(second)));
    assert!(report.to_string().contains("error:"));
  }

  #[test]
  fn test_detects_allocated_block_in_free_list() {
    let heap = heap();
    let first = heap.blocks().next().unwrap();

    unsafe { write_tag(first.address as *mut u8, Tag::new(first.size, true)) };

    let report = heap.check_heap(false);
    assert!(report.violations.contains(&Violation::ListedNotFree(BlockRef::FIRST)));
  }

  #[test]
  fn test_detects_bad_sentinels() {
    let heap = heap();
    let first = heap.blocks().next().unwrap();
    let base = first.address - BlockRef::FIRST.offset();

    unsafe {
      write_tag(base as *mut u8, Tag::new(0, true));
      write_tag((base + heap.epilogue().offset()) as *mut u8, Tag::new(0, false));
    }

    let report = heap.check_heap(false);
    assert!(report.violations.contains(&Violation::BadPrologue(Tag::new(0, true))));
    assert!(report.violations.contains(&Violation::BadEpilogue {
      block: heap.epilogue(),
      tag: Tag::new(0, false),
    }));
  }

  #[test]
  fn test_block_info_display() {
    let mut heap = heap();
    let _a = heap.allocate(16).unwrap();

    let blocks: Vec<BlockInfo> = heap.blocks().collect();
    assert!(blocks[0].to_string().ends_with("header: [32:a]"));
    assert!(blocks[1].to_string().contains("header: [65456:f] prev: +0x0 next: +0xffe8"));
  }
}

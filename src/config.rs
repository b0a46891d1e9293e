//! Tunable allocator parameters.

use crate::{
  AllocError, AllocResult,
  block::{ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, SENTINEL_SIZE},
};

/// Bytes requested from the heap source at bootstrap.
pub const CHUNK_SIZE: usize = 1 << 16;
/// Growth requests are at least this many chunks.
pub const GROWTH_FACTOR: usize = 6;
/// Payload size (in bytes) up to which a block counts as small.
pub const SMALL_THRESHOLD: usize = 100;

/// Allocator parameters.
///
/// `small_threshold` decides, for both search and placement, whether a block
/// is treated as small (served from the low end of the heap, inserted at the
/// head of the free list) or large (high end, tail of the list). Any value is
/// correct: `0` sends everything down the large path and `usize::MAX`
/// everything down the small one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub chunk_size: usize,
  pub growth_factor: usize,
  pub small_threshold: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}

impl Config {
  pub const fn new() -> Self {
    Self {
      chunk_size: CHUNK_SIZE,
      growth_factor: GROWTH_FACTOR,
      small_threshold: SMALL_THRESHOLD,
    }
  }

  pub const fn with_chunk_size(
    mut self,
    chunk_size: usize,
  ) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  pub const fn with_growth_factor(
    mut self,
    growth_factor: usize,
  ) -> Self {
    self.growth_factor = growth_factor;
    self
  }

  pub const fn with_small_threshold(
    mut self,
    small_threshold: usize,
  ) -> Self {
    self.small_threshold = small_threshold;
    self
  }

  pub fn validate(&self) -> AllocResult<()> {
    if self.chunk_size % ALIGNMENT != 0 {
      return Err(AllocError::InvalidConfig("chunk size must be a multiple of 8"));
    }
    if self.chunk_size < 2 * SENTINEL_SIZE + MIN_BLOCK_SIZE {
      return Err(AllocError::InvalidConfig("chunk size cannot hold both sentinels and a block"));
    }
    if self.chunk_size > MAX_BLOCK_SIZE {
      return Err(AllocError::InvalidConfig("chunk size exceeds the largest encodable block"));
    }
    if self.growth_factor == 0 {
      return Err(AllocError::InvalidConfig("growth factor must be at least 1"));
    }
    Ok(())
  }

  /// Whether a block of `block_size` bytes takes the small-object path.
  pub(crate) fn is_small(
    &self,
    block_size: usize,
  ) -> bool {
    block_size - OVERHEAD <= self.small_threshold
  }

  /// Bytes to grow the heap by when no free block fits `asize`.
  pub(crate) fn growth_size(
    &self,
    asize: usize,
  ) -> usize {
    asize.max(self.chunk_size.saturating_mul(self.growth_factor))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    let config = Config::default();
    assert_eq!(config.chunk_size, 65536);
    assert_eq!(config.growth_factor, 6);
    assert_eq!(config.small_threshold, 100);
    assert_eq!(config.validate(), Ok(()));
  }

  #[test]
  fn test_rejects_bad_chunks() {
    assert!(Config::new().with_chunk_size(4100).validate().is_err());
    assert!(Config::new().with_chunk_size(72).validate().is_err());
    assert!(Config::new().with_chunk_size(80).validate().is_ok());
    assert!(Config::new().with_growth_factor(0).validate().is_err());
  }

  #[test]
  fn test_small_path_boundary() {
    let config = Config::default();
    assert!(config.is_small(116));
    assert!(!config.is_small(124));

    let never = Config::new().with_small_threshold(0);
    assert!(!never.is_small(MIN_BLOCK_SIZE));

    let always = Config::new().with_small_threshold(usize::MAX);
    assert!(always.is_small(MAX_BLOCK_SIZE));
  }

  #[test]
  fn test_growth_size() {
    let config = Config::default();
    assert_eq!(config.growth_size(64), 6 * CHUNK_SIZE);
    assert_eq!(config.growth_size(10 * CHUNK_SIZE), 10 * CHUNK_SIZE);
  }
}

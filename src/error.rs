use thiserror::Error;

/// Result alias used by every fallible heap operation.
pub type AllocResult<T> = Result<T, AllocError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
  #[error("heap source could not provide the initial {requested} byte chunk")]
  InitFailed { requested: usize },

  #[error("heap exhausted: could not grow by {requested} bytes")]
  Exhausted { requested: usize },

  #[error("request of {requested} bytes exceeds the largest encodable block")]
  TooLarge { requested: usize },

  #[error("heap source returned 0x{found:x}, expected the heap end at 0x{expected:x}")]
  NonContiguous { expected: usize, found: usize },

  #[error("heap base 0x{0:x} is not 8-byte aligned")]
  MisalignedBase(usize),

  #[error("zero-size request")]
  ZeroSize,

  #[error("pointer 0x{0:x} does not address a live allocation")]
  InvalidPointer(usize),

  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),

  #[error("arena of {capacity} bytes could not be reserved")]
  ArenaUnavailable { capacity: usize },
}

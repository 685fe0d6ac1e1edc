use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("arena size {size} is below the minimum of {min} bytes")]
  ArenaTooSmall { size: usize, min: usize },
  #[error("arena size {size} is not a multiple of {granularity}")]
  Misaligned { size: usize, granularity: usize },
  #[error("chunk limit {max} is smaller than the arena size {arena}")]
  ChunkLimitBelowArena { max: usize, arena: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("zero-size allocation request")]
  ZeroSize,
  #[error("allocation size overflows the address space")]
  Overflow,
  #[error("out of memory")]
  OutOfMemory,
  #[error("alignment {align} is not a power of two the heap can serve")]
  Alignment { align: usize },
  #[error("invalid heap configuration: {0}")]
  Config(#[from] ConfigError),
}

/// Misuse detected while returning a block. The process-wide entry points
/// treat both variants as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FreeError {
  #[error("double free detected at {addr:#x}")]
  DoubleFree { addr: usize },
  #[error("pointer {addr:#x} was not allocated by this heap")]
  InvalidPointer { addr: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReallocError {
  #[error(transparent)]
  Alloc(#[from] AllocError),
  #[error(transparent)]
  Free(#[from] FreeError),
}

/// Structural damage found by [`Heap::check`](crate::Heap::check). Addresses
/// are absolute header addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityError {
  #[error("cycle detected in free list {bucket} at {block:#x}")]
  Cycle { bucket: usize, block: usize },
  #[error("free list {bucket}: node {block:#x} has a link outside the heap")]
  OutOfBounds { bucket: usize, block: usize },
  #[error("free list {bucket}: node {block:#x} has inconsistent prev/next links")]
  BrokenLink { bucket: usize, block: usize },
  #[error("free list {bucket}: block {block:#x} of size {size} does not belong there")]
  Misfiled {
    bucket: usize,
    block: usize,
    size: usize,
  },
  #[error("chunk {chunk:#x} does not start with a fencepost")]
  BadFencepost { chunk: usize },
  #[error("invalid header at {block:#x}")]
  BadHeader { block: usize },
  #[error("block {block:#x} has size {size} but its right neighbor records {left_size}")]
  TagMismatch {
    block: usize,
    size: usize,
    left_size: usize,
  },
  #[error("adjacent free blocks at {block:#x}")]
  AdjacentFree { block: usize },
  #[error("{walked} free blocks in chunks but {listed} in free lists")]
  Unlisted { walked: usize, listed: usize },
}

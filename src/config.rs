use crate::block::{HEADER_SIZE, MIN_BLOCK_SIZE};
use crate::error::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Allocation granularity. Every block size, and every payload address, is a
/// multiple of it.
pub const MIN_ALLOCATION: usize = 8;

/// Number of free-list buckets. Bucket 0 is never populated; the last bucket
/// is the catch-all for every size above the exact classes.
pub const N_LISTS: usize = 59;

/// Default number of bytes requested from the chunk source per growth step.
pub const ARENA_SIZE: usize = 4096;

/// Capacity of the chunk registry walked by the verifier.
pub const MAX_OS_CHUNKS: usize = 1024;

/// Default upper bound for a single grown chunk.
pub const MAX_CHUNK_SIZE: usize = 64 << 20; // 64MB

/// Address space reserved for the process-wide heap.
pub const GLOBAL_RESERVE: usize = 1 << 30; // 1GB

/// Smallest arena that still holds two fenceposts and one free block.
pub const MIN_ARENA_SIZE: usize = 2 * HEADER_SIZE + MIN_BLOCK_SIZE;

/// Largest payload alignment the heap serves, and what the C entry points
/// guarantee (`max_align_t` on 64-bit targets).
pub const MAX_HEAP_ALIGN: usize = HEADER_SIZE;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(MIN_ALLOCATION.is_power_of_two());
const _: () = assert!(HEADER_SIZE % MIN_ALLOCATION == 0);
const _: () = assert!(MIN_BLOCK_SIZE % MIN_ALLOCATION == 0);
const _: () = assert!(ARENA_SIZE % MIN_ALLOCATION == 0);
const _: () = assert!(ARENA_SIZE >= MIN_ARENA_SIZE);
const _: () = assert!(MAX_CHUNK_SIZE >= ARENA_SIZE);
const _: () = assert!(N_LISTS >= 3);
const _: () = assert!(MAX_HEAP_ALIGN.is_power_of_two() && MAX_HEAP_ALIGN >= MIN_ALLOCATION);

// =============================================================================
// HeapConfig
// =============================================================================

/// Growth parameters of one heap instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Bytes requested from the chunk source per growth step. Larger requests
  /// grow by the smallest multiple of this that fits them.
  pub arena_size: usize,
  /// Requests that would need a bigger chunk fail with `OutOfMemory`.
  pub max_chunk_size: usize,
}

impl HeapConfig {
  pub const fn new() -> Self {
    Self {
      arena_size: ARENA_SIZE,
      max_chunk_size: MAX_CHUNK_SIZE,
    }
  }

  pub const fn with_arena_size(mut self, arena_size: usize) -> Self {
    self.arena_size = arena_size;
    self
  }

  pub const fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
    self.max_chunk_size = max_chunk_size;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.arena_size < MIN_ARENA_SIZE {
      return Err(ConfigError::ArenaTooSmall {
        size: self.arena_size,
        min: MIN_ARENA_SIZE,
      });
    }
    if self.arena_size % MIN_ALLOCATION != 0 {
      return Err(ConfigError::Misaligned {
        size: self.arena_size,
        granularity: MIN_ALLOCATION,
      });
    }
    if self.max_chunk_size < self.arena_size {
      return Err(ConfigError::ChunkLimitBelowArena {
        max: self.max_chunk_size,
        arena: self.arena_size,
      });
    }
    Ok(())
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}

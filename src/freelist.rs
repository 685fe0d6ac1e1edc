//! Segregated free lists.
//!
//! `N_LISTS` circular doubly-linked lists, each anchored by a sentinel node
//! stored at the base of the region. Buckets `1..N_LISTS - 1` hold exactly one
//! block size each; the last bucket holds everything larger, unordered.

use crate::{
  block::{Block, HEADER_SIZE, MIN_BLOCK_SIZE, Region, State},
  config::{MIN_ALLOCATION, N_LISTS},
};

/// Bucket that takes every block too large for an exact class.
pub(crate) const CATCH_ALL: usize = N_LISTS - 1;

/// Bytes reserved at the base of the region for the sentinels.
pub(crate) const SENTINELS_SIZE: usize = N_LISTS * MIN_BLOCK_SIZE;

/// Bucket holding free blocks of `size` bytes (header included).
#[inline]
pub(crate) const fn bucket_index(size: usize) -> usize {
  let class = (size.saturating_sub(HEADER_SIZE) / MIN_ALLOCATION).saturating_sub(1);
  if class < 1 {
    1
  } else if class > CATCH_ALL {
    CATCH_ALL
  } else {
    class
  }
}

impl Region {
  #[inline]
  pub(crate) const fn sentinel(&self, bucket: usize) -> Block {
    debug_assert!(bucket < N_LISTS);
    Block(bucket * MIN_BLOCK_SIZE)
  }

  /// Makes every bucket empty. `[0, SENTINELS_SIZE)` must be writable.
  pub(crate) fn init_sentinels(&self) {
    for bucket in 0..N_LISTS {
      let sentinel = self.sentinel(bucket);
      self.set_size_and_state(sentinel, MIN_BLOCK_SIZE, State::Fencepost);
      self.set_left_size(sentinel, 0);
      self.set_next(sentinel, sentinel);
      self.set_prev(sentinel, sentinel);
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self, bucket: usize) -> bool {
    let sentinel = self.sentinel(bucket);
    self.next(sentinel) == sentinel
  }

  /// Pushes `block` at the head of the bucket for its current size.
  pub(crate) fn insert(&self, block: Block) {
    let sentinel = self.sentinel(bucket_index(self.size(block)));
    let head = self.next(sentinel);
    self.set_next(block, head);
    self.set_prev(block, sentinel);
    self.set_prev(head, block);
    self.set_next(sentinel, block);
  }

  pub(crate) fn unlink(&self, block: Block) {
    let prev = self.prev(block);
    let next = self.next(block);
    self.set_next(prev, next);
    self.set_prev(next, prev);
    self.clear_links(block);
  }

  /// Puts `block` in the list position `old` occupies. `old` stops being a
  /// member without its links being touched.
  pub(crate) fn splice(&self, block: Block, old: Block) {
    let prev = self.prev(old);
    let next = self.next(old);
    self.set_next(block, next);
    self.set_prev(block, prev);
    self.set_next(prev, block);
    self.set_prev(next, block);
  }

  /// Moves a listed block whose size changed to the bucket it now belongs to.
  pub(crate) fn relist(&self, block: Block, old_bucket: usize) {
    if bucket_index(self.size(block)) != old_bucket {
      self.unlink(block);
      self.insert(block);
    }
  }
}

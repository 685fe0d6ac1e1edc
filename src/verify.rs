//! Out-of-band consistency checks.
//!
//! Nothing here runs on the allocation path. Every offset read from a header
//! is bounds-checked before it is followed, so a damaged heap produces an
//! [`IntegrityError`] instead of a wild read.

use crate::{
  block::{Block, State},
  config::N_LISTS,
  error::IntegrityError,
  freelist::bucket_index,
  heap::Heap,
  os::ChunkSource,
};

impl<S: ChunkSource> Heap<S> {
  /// Runs every check and reports the first failure.
  pub fn check(&self) -> Result<(), IntegrityError> {
    self.detect_cycles()?;
    let listed = self.verify_pointers()?;
    let walked = self.verify_tags()?;
    if self.unregistered == 0 && walked != listed {
      return Err(IntegrityError::Unlisted { walked, listed });
    }
    Ok(())
  }

  /// [`check`](Self::check), logging the failure.
  pub fn verify(&self) -> bool {
    match self.check() {
      Ok(()) => true,
      Err(err) => {
        log::error!("heap verification failed: {err}");
        false
      }
    }
  }

  /// Follows `next` from `node`, refusing links that leave the region.
  fn checked_next(&self, bucket: usize, node: Block) -> Result<Block, IntegrityError> {
    let next = self.region.next(node);
    if self.region.is_node(next.0) {
      Ok(next)
    } else {
      Err(IntegrityError::OutOfBounds {
        bucket,
        block: self.region.addr(node),
      })
    }
  }

  /// Floyd's tortoise and hare on every bucket. A healthy list returns to its
  /// sentinel; a damaged one loops somewhere else.
  fn detect_cycles(&self) -> Result<(), IntegrityError> {
    'buckets: for bucket in 0..N_LISTS {
      let sentinel = self.region.sentinel(bucket);
      let mut slow = sentinel;
      let mut fast = sentinel;
      loop {
        for _ in 0..2 {
          fast = self.checked_next(bucket, fast)?;
          if fast == sentinel {
            continue 'buckets;
          }
        }
        slow = self.checked_next(bucket, slow)?;
        if slow == fast {
          return Err(IntegrityError::Cycle {
            bucket,
            block: self.region.addr(slow),
          });
        }
      }
    }
    Ok(())
  }

  /// Link symmetry and filing of every listed node. Returns the number of
  /// listed blocks. Assumes [`detect_cycles`](Self::detect_cycles) passed.
  fn verify_pointers(&self) -> Result<usize, IntegrityError> {
    let region = &self.region;
    let mut listed = 0;

    for bucket in 0..N_LISTS {
      let sentinel = region.sentinel(bucket);
      let mut cur = self.checked_next(bucket, sentinel)?;

      while cur != sentinel {
        let block = region.addr(cur);
        let next = self.checked_next(bucket, cur)?;
        let prev = region.prev(cur);
        if !region.is_node(prev.0) {
          return Err(IntegrityError::OutOfBounds { bucket, block });
        }
        if region.prev(next) != cur || region.next(prev) != cur {
          return Err(IntegrityError::BrokenLink { bucket, block });
        }

        let size = region.size(cur);
        if !region.is_header(cur.0)
          || region.state(cur) != Some(State::Free)
          || bucket_index(size) != bucket
          || bucket == 0
        {
          return Err(IntegrityError::Misfiled {
            bucket,
            block,
            size,
          });
        }

        listed += 1;
        cur = next;
      }
    }

    Ok(listed)
  }

  /// Walks every registered chunk from fencepost to fencepost. Returns the
  /// number of free blocks seen.
  fn verify_tags(&self) -> Result<usize, IntegrityError> {
    let region = &self.region;
    let mut free = 0;

    for &chunk in &self.chunks[..self.chunk_count] {
      if region.state(chunk) != Some(State::Fencepost) {
        return Err(IntegrityError::BadFencepost {
          chunk: region.addr(chunk),
        });
      }

      let mut cur = chunk;
      loop {
        let block = region.addr(cur);
        let Some(right) = region.checked_right(cur) else {
          return Err(IntegrityError::BadHeader { block });
        };
        let Some(right_state) = region.state(right) else {
          return Err(IntegrityError::BadHeader {
            block: region.addr(right),
          });
        };

        let size = region.size(cur);
        let left_size = region.left_size(right);
        if size != left_size {
          return Err(IntegrityError::TagMismatch {
            block,
            size,
            left_size,
          });
        }

        let free_here = region.state(cur) == Some(State::Free);
        if free_here {
          free += 1;
          if right_state == State::Free {
            return Err(IntegrityError::AdjacentFree { block });
          }
        }

        if right_state == State::Fencepost {
          break;
        }
        cur = right;
      }
    }

    Ok(free)
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    block::{Block, HEADER_SIZE, State},
    config::{ARENA_SIZE, HeapConfig},
    error::IntegrityError,
    freelist::CATCH_ALL,
    heap::{
      Heap,
      tests::{Gapped, heap},
    },
  };

  fn header(heap: &Heap, ptr: core::ptr::NonNull<u8>) -> Block {
    Block(ptr.as_ptr() as usize - HEADER_SIZE - heap.region.base())
  }

  #[test]
  fn busy_heap_passes() {
    let mut heap = heap();
    let ptrs: Vec<_> = (1..40).map(|i| heap.allocate(i * 13).unwrap()).collect();
    assert_eq!(heap.check(), Ok(()));
    for ptr in ptrs.into_iter().step_by(2) {
      unsafe { heap.deallocate(ptr.as_ptr()).unwrap() };
    }
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn separate_chunks_are_walked() {
    let mut heap = Heap::new(Gapped::new(1 << 20, 4096), HeapConfig::default()).unwrap();
    for _ in 0..3 {
      heap.allocate(ARENA_SIZE - 4 * HEADER_SIZE).unwrap();
    }
    assert_eq!(heap.chunk_count, 3);
    assert_eq!(heap.check(), Ok(()));
  }

  #[test]
  fn mismatched_boundary_tag_is_reported() {
    let mut heap = heap();
    let ptr = heap.allocate(64).unwrap();
    let block = header(&heap, ptr);
    let right = heap.region.right(block);
    heap.region.set_left_size(right, 8);

    assert!(matches!(
      heap.check(),
      Err(IntegrityError::TagMismatch { left_size: 8, .. })
    ));
    assert!(!heap.verify());
  }

  #[test]
  fn broken_link_is_reported() {
    let mut heap = heap();
    let a = heap.allocate(600).unwrap();
    let _gap = heap.allocate(8).unwrap();
    unsafe { heap.deallocate(a.as_ptr()).unwrap() };

    // Two nodes in the catch-all; make the second one's prev skip the first.
    let region = heap.region;
    let sentinel = region.sentinel(CATCH_ALL);
    let second = region.next(region.next(sentinel));
    region.set_prev(second, sentinel);

    assert!(matches!(
      heap.check(),
      Err(IntegrityError::BrokenLink { bucket: CATCH_ALL, .. })
    ));
  }

  #[test]
  fn cycle_is_reported() {
    let mut heap = heap();
    let a = heap.allocate(600).unwrap();
    let _gap = heap.allocate(8).unwrap();
    unsafe { heap.deallocate(a.as_ptr()).unwrap() };

    let region = heap.region;
    let sentinel = region.sentinel(CATCH_ALL);
    let first = region.next(sentinel);
    let second = region.next(first);
    region.set_next(second, first);

    assert!(matches!(
      heap.check(),
      Err(IntegrityError::Cycle { bucket: CATCH_ALL, .. })
    ));
  }

  #[test]
  fn self_loop_is_reported() {
    let heap = heap();
    let region = heap.region;
    let sentinel = region.sentinel(CATCH_ALL);
    let only = region.next(sentinel);
    region.set_next(only, only);

    assert!(matches!(heap.check(), Err(IntegrityError::Cycle { .. })));
  }

  #[test]
  fn wild_link_is_reported_not_followed() {
    let heap = heap();
    let region = heap.region;
    let sentinel = region.sentinel(CATCH_ALL);
    let only = region.next(sentinel);
    region.set_next(only, Block(usize::MAX / 2));

    assert!(matches!(
      heap.check(),
      Err(IntegrityError::OutOfBounds { bucket: CATCH_ALL, .. })
    ));
  }

  #[test]
  fn allocated_block_in_a_list_is_misfiled() {
    let heap = heap();
    let region = heap.region;
    let only = region.next(region.sentinel(CATCH_ALL));
    region.set_state(only, State::Allocated);

    assert!(matches!(heap.check(), Err(IntegrityError::Misfiled { .. })));
  }

  #[test]
  fn uncoalesced_neighbors_are_reported() {
    let mut heap = heap();
    let ptr = heap.allocate(64).unwrap();
    // Flip the state behind the heap's back: two free neighbors, one unlisted.
    let block = header(&heap, ptr);
    heap.region.set_state(block, State::Free);

    assert!(matches!(heap.check(), Err(IntegrityError::AdjacentFree { .. })));
  }

  #[test]
  fn unlisted_free_block_is_reported() {
    let mut heap = heap();
    let _above = heap.allocate(64).unwrap();
    let mid = heap.allocate(64).unwrap();
    let _below = heap.allocate(64).unwrap();
    let block = header(&heap, mid);
    heap.region.set_state(block, State::Free);

    assert_eq!(
      heap.check(),
      Err(IntegrityError::Unlisted {
        walked: 2,
        listed: 1
      })
    );
  }

  #[test]
  fn missing_fencepost_is_reported() {
    let heap = heap();
    let chunk = heap.chunks[0];
    heap.region.set_state(chunk, State::Free);

    assert!(matches!(heap.check(), Err(IntegrityError::BadFencepost { .. })));
  }
}

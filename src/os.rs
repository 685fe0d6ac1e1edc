//! Where chunks come from.

use core::ptr::{NonNull, null_mut};

use crate::{config::MIN_ALLOCATION, error::AllocError};

// =============================================================================
// Platform
// =============================================================================

pub(crate) unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

pub(crate) fn page_size() -> usize {
  match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    n if n > 0 => n as usize,
    _ => 4096,
  }
}

// =============================================================================
// ChunkSource
// =============================================================================

/// A heap-growth facility.
///
/// # Safety
///
/// Every extent returned by `grow` must be `size` bytes of writable memory,
/// aligned to `MIN_ALLOCATION`, that nothing else uses for as long as the
/// source lives. Extents never overlap, and every extent lies above the first
/// one handed out. Consecutive calls may return adjacent extents; the heap
/// notices and merges them.
pub unsafe trait ChunkSource {
  /// Extends the heap by `size` bytes. `None` means the system refused.
  fn grow(&mut self, size: usize) -> Option<NonNull<u8>>;
}

// =============================================================================
// Reserved
// =============================================================================

/// One up-front reservation of address space handed out front to back, like a
/// program break that cannot collide with anybody else's.
///
/// Pages are committed lazily by the kernel (`MAP_NORESERVE`), so a large
/// reservation costs nothing until it is touched. Unmapped on drop.
pub struct Reserved {
  base: NonNull<u8>,
  capacity: usize,
  brk: usize,
}

unsafe impl Send for Reserved {}

impl Reserved {
  /// Reserves at least `capacity` bytes, rounded up to whole pages.
  pub fn new(capacity: usize) -> Result<Self, AllocError> {
    let page = page_size();
    let capacity = capacity
      .checked_add(page - 1)
      .ok_or(AllocError::Overflow)?
      & !(page - 1);
    let base = NonNull::new(unsafe { os_mmap(capacity) }).ok_or(AllocError::OutOfMemory)?;
    Ok(Self {
      base,
      capacity,
      brk: 0,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    self.brk
  }
}

unsafe impl ChunkSource for Reserved {
  fn grow(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size % MIN_ALLOCATION != 0 || size > self.capacity - self.brk {
      return None;
    }
    let extent = unsafe { self.base.add(self.brk) };
    self.brk += size;
    Some(extent)
  }
}

impl Drop for Reserved {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
  }
}

// =============================================================================
// Sbrk
// =============================================================================

/// The process break, moved with `sbrk(2)`.
///
/// Only one heap may grow the break at a time, and nothing else in the
/// process should shrink it.
#[derive(Debug, Default)]
pub struct Sbrk;

impl Sbrk {
  pub const fn new() -> Self {
    Self
  }

  fn bump(increment: usize) -> Option<*mut u8> {
    let increment = libc::intptr_t::try_from(increment).ok()?;
    let address = unsafe { libc::sbrk(increment) };
    if address == usize::MAX as *mut libc::c_void {
      None
    } else {
      Some(address.cast())
    }
  }
}

unsafe impl ChunkSource for Sbrk {
  fn grow(&mut self, size: usize) -> Option<NonNull<u8>> {
    let brk = Self::bump(0)? as usize;
    let pad = brk.next_multiple_of(MIN_ALLOCATION) - brk;
    if pad != 0 {
      Self::bump(pad)?;
    }
    // Another break user may have moved it since the pad was applied.
    NonNull::new(Self::bump(size)?).filter(|ptr| ptr.as_ptr() as usize % MIN_ALLOCATION == 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{HeapConfig, MAX_HEAP_ALIGN},
    heap::Heap,
  };

  #[test]
  fn reserved_hands_out_adjacent_extents() {
    let mut source = Reserved::new(3 * 4096).unwrap();
    assert!(source.capacity() >= 3 * 4096);

    let a = source.grow(4096).unwrap();
    let b = source.grow(4096).unwrap();
    assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 4096);
    assert_eq!(a.as_ptr() as usize % MIN_ALLOCATION, 0);
    assert_eq!(source.used(), 8192);

    // Fresh pages are writable and zeroed.
    unsafe {
      assert_eq!(*b.as_ptr(), 0);
      b.as_ptr().write_bytes(0xAB, 4096);
    }
  }

  #[test]
  fn reserved_refuses_past_capacity() {
    let mut source = Reserved::new(4096).unwrap();
    let capacity = source.capacity();
    assert!(source.grow(capacity + MIN_ALLOCATION).is_none());
    assert!(source.grow(capacity).is_some());
    assert!(source.grow(MIN_ALLOCATION).is_none());
  }

  #[test]
  fn reserved_refuses_unaligned_sizes() {
    let mut source = Reserved::new(4096).unwrap();
    assert!(source.grow(13).is_none());
    assert_eq!(source.used(), 0);
  }

  #[test]
  fn heap_grows_with_the_program_break() {
    // The break is shared with libc, so extents need not be contiguous and
    // only integrity is asserted, not chunk counts.
    let mut heap = Heap::new(Sbrk::new(), HeapConfig::default()).unwrap();
    let sizes = [24, 600, 3000, 5000, 70_000];
    let ptrs: Vec<_> = sizes
      .iter()
      .map(|&size| {
        let ptr = heap.allocate(size).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x7E, size) };
        ptr
      })
      .collect();
    let aligned = heap.allocate_aligned(40, MAX_HEAP_ALIGN).unwrap();
    assert_eq!(aligned.as_ptr() as usize % MAX_HEAP_ALIGN, 0);
    assert!(heap.verify());
    assert_eq!(heap.stats().allocated_blocks, sizes.len() + 1);

    for ptr in ptrs.into_iter().chain([aligned]) {
      unsafe { heap.deallocate(ptr.as_ptr()).unwrap() };
    }
    assert!(heap.verify());
    assert_eq!(heap.stats().allocated_blocks, 0);
  }
}

//! Mutual exclusion around heap state.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  ptr::NonNull,
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{
  error::{AllocError, FreeError, IntegrityError, ReallocError},
  heap::{Heap, HeapStats},
  os::{ChunkSource, Reserved},
};

/// Spins before handing the CPU back to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 64;

// =============================================================================
// Locked
// =============================================================================

/// A test-and-test-and-set spin lock owning its data.
///
/// Nothing in it allocates, so it can guard the process-wide heap. Not
/// reentrant: locking twice from one thread deadlocks.
pub struct Locked<T> {
  locked: AtomicBool,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}
unsafe impl<T: Send> Send for Locked<T> {}

impl<T> Locked<T> {
  pub const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub fn lock(&self) -> LockedGuard<'_, T> {
    let mut spins = 0u32;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          spins = 0;
          std::thread::yield_now();
        }
      }
    }
    LockedGuard { lock: self }
  }

  #[inline]
  pub fn try_lock(&self) -> Option<LockedGuard<'_, T>> {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()
      .map(|_| LockedGuard { lock: self })
  }

  pub fn into_inner(self) -> T {
    self.value.into_inner()
  }
}

/// Releases the lock when dropped.
pub struct LockedGuard<'a, T> {
  lock: &'a Locked<T>,
}

impl<T> Deref for LockedGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.lock.value.get() }
  }
}

impl<T> DerefMut for LockedGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.value.get() }
  }
}

impl<T> Drop for LockedGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// SharedHeap
// =============================================================================

/// A [`Heap`] usable from many threads at once. Every operation holds the
/// lock for its whole duration.
pub struct SharedHeap<S: ChunkSource = Reserved> {
  heap: Locked<Heap<S>>,
}

impl<S: ChunkSource + Send> SharedHeap<S> {
  pub fn new(heap: Heap<S>) -> Self {
    Self {
      heap: Locked::new(heap),
    }
  }

  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.heap.lock().allocate(size)
  }

  pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    self.heap.lock().allocate_aligned(size, align)
  }

  pub fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.heap.lock().zero_allocate(count, size)
  }

  /// # Safety
  ///
  /// See [`Heap::deallocate`].
  pub unsafe fn deallocate(&self, ptr: *mut u8) -> Result<(), FreeError> {
    unsafe { self.heap.lock().deallocate(ptr) }
  }

  /// # Safety
  ///
  /// See [`Heap::reallocate`].
  pub unsafe fn reallocate(
    &self,
    ptr: *mut u8,
    new_size: usize,
  ) -> Result<NonNull<u8>, ReallocError> {
    unsafe { self.heap.lock().reallocate(ptr, new_size) }
  }

  /// # Safety
  ///
  /// See [`Heap::usable_size`].
  pub unsafe fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    unsafe { self.heap.lock().usable_size(ptr) }
  }

  pub fn check(&self) -> Result<(), IntegrityError> {
    self.heap.lock().check()
  }

  pub fn verify(&self) -> bool {
    self.heap.lock().verify()
  }

  pub fn stats(&self) -> HeapStats {
    self.heap.lock().stats()
  }

  /// Runs `f` with the heap locked.
  pub fn with<R>(&self, f: impl FnOnce(&Heap<S>) -> R) -> R {
    f(&self.heap.lock())
  }

  pub fn into_inner(self) -> Heap<S> {
    self.heap.into_inner()
  }
}

#![allow(clippy::missing_safety_doc)]

//! A boundary-tag, segregated-fit heap allocator.
//!
//! [`Heap`] is one self-contained allocator instance over a [`ChunkSource`].
//! The free functions at the crate root and [`Allocator`] share a single
//! process-wide heap behind a spin lock.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  mem::{offset_of, size_of},
  ptr::{self, NonNull, null_mut},
};

mod block;
mod config;
mod error;
mod freelist;
mod heap;
mod os;
mod sync;
mod verify;

pub use block::{HEADER_SIZE, MIN_BLOCK_SIZE, State};
pub use config::{
  ARENA_SIZE, GLOBAL_RESERVE, HeapConfig, MAX_CHUNK_SIZE, MAX_HEAP_ALIGN, MAX_OS_CHUNKS,
  MIN_ALLOCATION, MIN_ARENA_SIZE, N_LISTS,
};
pub use error::{AllocError, ConfigError, FreeError, IntegrityError, ReallocError};
pub use heap::{BlockInfo, Blocks, Heap, HeapStats};
pub use os::{ChunkSource, Reserved, Sbrk};
pub use sync::{Locked, LockedGuard, SharedHeap};

use os::{os_mmap, os_munmap, page_size};

// =============================================================================
// Process-wide heap
// =============================================================================

#[cfg(not(feature = "sbrk"))]
type GlobalSource = Reserved;
#[cfg(feature = "sbrk")]
type GlobalSource = Sbrk;

#[cfg(not(feature = "sbrk"))]
fn global_source() -> Result<GlobalSource, AllocError> {
  Reserved::new(GLOBAL_RESERVE)
}

#[cfg(feature = "sbrk")]
fn global_source() -> Result<GlobalSource, AllocError> {
  Ok(Sbrk::new())
}

static HEAP: Locked<Option<Heap<GlobalSource>>> = Locked::new(None);

thread_local! {
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on the process-wide heap, creating it on first use.
///
/// Returns `None` when the heap cannot be created, or when this thread is
/// already inside the heap (a logger allocating from under the lock).
fn with_heap<R>(f: impl FnOnce(&mut Heap<GlobalSource>) -> R) -> Option<R> {
  // TLS may already be destroyed during thread exit; run unguarded then.
  let guarded = match IN_ALLOC.try_with(|flag| flag.replace(true)) {
    Ok(true) => return None,
    Ok(false) => true,
    Err(_) => false,
  };

  let result = {
    let mut slot = HEAP.lock();
    if slot.is_none() {
      match global_source().and_then(|source| Heap::new(source, HeapConfig::default())) {
        Ok(heap) => *slot = Some(heap),
        Err(err) => log::error!("cannot create the process-wide heap: {err}"),
      }
    }
    slot.as_mut().map(f)
  };

  if guarded {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
  result
}

#[cold]
fn fatal(err: &FreeError) -> ! {
  log::error!("{err}");
  eprintln!("fencepost: {err}");
  std::process::abort()
}

/// Allocates `size` bytes from the process-wide heap. Null when `size` is 0
/// or memory is exhausted.
pub fn allocate(size: usize) -> *mut u8 {
  match with_heap(|heap| heap.allocate(size)) {
    Some(Ok(ptr)) => ptr.as_ptr(),
    _ => null_mut(),
  }
}

/// `allocate(count * size)` with the payload zeroed. Null on overflow.
pub fn zero_allocate(count: usize, size: usize) -> *mut u8 {
  match with_heap(|heap| heap.zero_allocate(count, size)) {
    Some(Ok(ptr)) => ptr.as_ptr(),
    _ => null_mut(),
  }
}

/// Returns `ptr` to the process-wide heap. Null is a no-op; a double free or
/// a foreign pointer aborts the process.
///
/// # Safety
///
/// Nothing may use `ptr` afterwards.
pub unsafe fn deallocate(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  if let Some(Err(err)) = with_heap(|heap| unsafe { heap.deallocate(ptr) }) {
    fatal(&err);
  }
}

/// Moves `ptr` to a block of `new_size` bytes, keeping the common prefix.
/// Null allocates; `new_size == 0` frees and returns null. On exhaustion the
/// old block stays valid and null is returned.
///
/// # Safety
///
/// `ptr` must be null or live in the process-wide heap. Misuse aborts.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
  if new_size == 0 {
    unsafe { deallocate(ptr) };
    return null_mut();
  }
  match with_heap(|heap| unsafe { heap.reallocate(ptr, new_size) }) {
    Some(Ok(new)) => new.as_ptr(),
    Some(Err(ReallocError::Free(err))) => fatal(&err),
    _ => null_mut(),
  }
}

/// Payload bytes behind a live pointer this crate handed out, whether from
/// the heap or a direct mapping; 0 for null or an unknown pointer.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of this crate.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  if let Some(prefix) = unsafe { direct_prefix(ptr.cast_mut()) } {
    let prefix = unsafe { prefix.as_ref() };
    return prefix.base as usize + prefix.len - ptr as usize;
  }
  with_heap(|heap| unsafe { heap.usable_size(ptr) })
    .flatten()
    .unwrap_or(0)
}

/// Runs every integrity check on the process-wide heap, logging the failure.
pub fn verify() -> bool {
  with_heap(|heap| heap.verify()).unwrap_or(false)
}

/// Counters of the process-wide heap.
pub fn stats() -> Option<HeapStats> {
  with_heap(|heap| heap.stats())
}

// =============================================================================
// Direct mappings
// =============================================================================

/// Sits right below every directly mapped pointer. `magic` occupies the
/// slot of a block header's size word and carries state bits no header has.
#[repr(C)]
struct DirectPrefix {
  base: *mut u8,
  len: usize,
  magic: usize,
  _reserved: usize,
}

const DIRECT_PREFIX: usize = size_of::<DirectPrefix>();
const DIRECT_MAGIC: usize = 0xD1EC_7007;

const _: () = assert!(offset_of!(DirectPrefix, magic) + HEADER_SIZE == DIRECT_PREFIX);
const _: () = assert!(DIRECT_MAGIC & (MIN_ALLOCATION - 1) == MIN_ALLOCATION - 1);

/// Maps `size` bytes aligned to `align` straight from the OS, for requests
/// the heap does not serve.
unsafe fn direct_map(size: usize, align: usize) -> *mut u8 {
  let align = align.max(MIN_ALLOCATION);
  let Some(len) = size
    .checked_add(DIRECT_PREFIX + align - 1)
    .and_then(|n| n.checked_next_multiple_of(page_size()))
  else {
    return null_mut();
  };

  let base = unsafe { os_mmap(len) };
  if base.is_null() {
    return null_mut();
  }

  let offset = (base as usize + DIRECT_PREFIX).next_multiple_of(align) - base as usize;
  unsafe {
    let ptr = base.add(offset);
    ptr.sub(DIRECT_PREFIX).cast::<DirectPrefix>().write(DirectPrefix {
      base,
      len,
      magic: DIRECT_MAGIC,
      _reserved: 0,
    });
    ptr
  }
}

/// The prefix of `ptr` if it came from [`direct_map`].
unsafe fn direct_prefix(ptr: *mut u8) -> Option<NonNull<DirectPrefix>> {
  let prefix = unsafe { ptr.sub(DIRECT_PREFIX).cast::<DirectPrefix>() };
  if unsafe { (*prefix).magic } == DIRECT_MAGIC {
    NonNull::new(prefix)
  } else {
    None
  }
}

/// Unmaps `ptr` if it came from [`direct_map`].
unsafe fn direct_unmap(ptr: *mut u8) -> bool {
  let Some(prefix) = (unsafe { direct_prefix(ptr) }) else {
    return false;
  };
  let DirectPrefix { base, len, .. } = unsafe { prefix.read() };
  unsafe { os_munmap(base, len) };
  true
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The process-wide heap as a Rust global allocator.
///
/// Layouts aligned to at most `MAX_HEAP_ALIGN` come from the heap. Larger
/// alignments, requests the heap cannot satisfy, and allocations made from
/// under the heap lock are mapped directly.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);

    if layout.align() <= MAX_HEAP_ALIGN
      && let Some(Ok(ptr)) = with_heap(|heap| heap.allocate_aligned(size, layout.align()))
    {
      return ptr.as_ptr();
    }

    unsafe { direct_map(size, layout.align()) }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if ptr.is_null() || unsafe { direct_unmap(ptr) } {
      return;
    }
    // A block released from under the heap lock is leaked.
    if let Some(Err(err)) = with_heap(|heap| unsafe { heap.deallocate(ptr) }) {
      fatal(&err);
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  if size == 0 {
    return null_mut();
  }
  unsafe { Allocator.alloc(Layout::from_size_align_unchecked(size, MAX_HEAP_ALIGN)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { Allocator.dealloc(ptr, Layout::from_size_align_unchecked(1, 1)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  match nmemb.checked_mul(size) {
    Some(total) if total > 0 => unsafe {
      Allocator.alloc_zeroed(Layout::from_size_align_unchecked(total, MAX_HEAP_ALIGN))
    },
    _ => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { malloc(size) };
  }
  if size == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }

  let new_ptr = unsafe { malloc(size) };
  if !new_ptr.is_null() {
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr, usable_size(ptr).min(size));
      free(ptr);
    }
  }
  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = unsafe { Allocator.alloc(Layout::from_size_align_unchecked(size.max(1), alignment)) };
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  if !alignment.is_power_of_two() {
    return null_mut();
  }
  unsafe { Allocator.alloc(Layout::from_size_align_unchecked(size.max(1), alignment)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  unsafe { aligned_alloc(alignment, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { usable_size(ptr) }
}

//! The exported C allocator symbols. With the feature enabled they interpose
//! the system allocator, so this whole binary, harness included, runs on
//! them.
#![cfg(feature = "c_api")]

use std::{ptr, thread};

use fencepost::{
  MAX_HEAP_ALIGN, aligned_alloc, calloc, free, malloc, malloc_usable_size, memalign, posix_memalign,
  realloc,
};

#[test]
fn malloc_returns_max_aligned_memory() {
  let mut live = Vec::new();
  for size in (1..3000).step_by(41) {
    let ptr = unsafe { malloc(size) };
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % MAX_HEAP_ALIGN, 0, "size {size}");
    unsafe {
      ptr.write_bytes(0x5C, size);
      assert!(malloc_usable_size(ptr) >= size);
    }
    live.push(ptr);
  }
  for ptr in live {
    unsafe { free(ptr) };
  }
  unsafe {
    assert!(malloc(0).is_null());
    free(ptr::null_mut());
    assert_eq!(malloc_usable_size(ptr::null_mut()), 0);
  }
  assert!(fencepost::verify());
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
  unsafe {
    let dirty = malloc(1024);
    dirty.write_bytes(0xAA, 1024);
    free(dirty);

    let ptr = calloc(128, 8);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % MAX_HEAP_ALIGN, 0);
    let bytes = std::slice::from_raw_parts(ptr, 1024);
    assert!(bytes.iter().all(|&byte| byte == 0));
    free(ptr);

    assert!(calloc(usize::MAX, 2).is_null());
    assert!(calloc(0, 8).is_null());
  }
}

#[test]
fn realloc_copies_the_common_prefix() {
  unsafe {
    let ptr = realloc(ptr::null_mut(), 48);
    assert!(!ptr.is_null());
    for i in 0..48 {
      ptr.add(i).write(i as u8);
    }

    // Growing copies only what the old block held.
    let grown = realloc(ptr, 5000);
    assert!(!grown.is_null());
    assert_eq!(grown as usize % MAX_HEAP_ALIGN, 0);
    for i in 0..48 {
      assert_eq!(grown.add(i).read(), i as u8);
    }

    let shrunk = realloc(grown, 20);
    for i in 0..20 {
      assert_eq!(shrunk.add(i).read(), i as u8);
    }

    assert!(realloc(shrunk, 0).is_null());
  }
  assert!(fencepost::verify());
}

#[test]
fn posix_memalign_honors_the_alignment() {
  for align in [8, 16, 64, 4096] {
    let mut ptr = ptr::null_mut();
    assert_eq!(unsafe { posix_memalign(&mut ptr, align, 200) }, 0);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % align, 0);
    unsafe {
      ptr.write_bytes(0x33, 200);
      assert!(malloc_usable_size(ptr) >= 200);
      free(ptr);
    }
  }

  let mut ptr = ptr::null_mut();
  assert_eq!(unsafe { posix_memalign(&mut ptr, 24, 8) }, libc::EINVAL);
  assert_eq!(unsafe { posix_memalign(&mut ptr, 2, 8) }, libc::EINVAL);
  assert!(ptr.is_null());
}

#[test]
fn aligned_alloc_and_memalign_agree() {
  for align in [1, 16, 32, 256] {
    unsafe {
      let a = aligned_alloc(align, 96);
      let b = memalign(align, 96);
      assert_eq!(a as usize % align, 0);
      assert_eq!(b as usize % align, 0);
      assert_ne!(a, b);
      free(a);
      free(b);
    }
  }
  assert!(unsafe { aligned_alloc(48, 96) }.is_null());
  assert!(fencepost::verify());
}

#[test]
fn threads_use_the_exports_concurrently() {
  let handles: Vec<_> = (0..4u8)
    .map(|id| {
      thread::spawn(move || {
        for round in 0..500usize {
          let size = 1 + (round * 29 + id as usize) % 900;
          unsafe {
            let ptr = malloc(size);
            assert_eq!(ptr as usize % MAX_HEAP_ALIGN, 0);
            ptr.write_bytes(id, size);
            let ptr = realloc(ptr, size * 2);
            assert!(std::slice::from_raw_parts(ptr, size).iter().all(|&b| b == id));
            free(ptr);
          }
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }
  assert!(fencepost::verify());
}

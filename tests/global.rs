//! The process-wide heap through its free functions. Tests share one heap and
//! run concurrently, so nothing here asserts exact counters.

use std::{
  env,
  process::{Command, Output},
  thread,
};

use fencepost::{MAX_CHUNK_SIZE, MIN_ALLOCATION};

const CHILD_ENV: &str = "FENCEPOST_CHILD";

/// Re-runs `test` alone in a child process with [`CHILD_ENV`] set.
fn run_child(test: &str) -> Output {
  Command::new(env::current_exe().unwrap())
    .args(["--exact", test, "--nocapture", "--test-threads=1"])
    .env(CHILD_ENV, test)
    .output()
    .unwrap()
}

fn in_child(test: &str) -> bool {
  env::var(CHILD_ENV).is_ok_and(|name| name == test)
}

#[test]
fn allocations_are_aligned_and_writable() {
  let mut ptrs = Vec::new();
  for size in (1..2000).step_by(37) {
    let ptr = fencepost::allocate(size);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % MIN_ALLOCATION, 0);
    unsafe {
      ptr.write_bytes(0xC3, size);
      assert!(fencepost::usable_size(ptr) >= size);
    }
    ptrs.push(ptr);
  }
  for ptr in ptrs {
    unsafe { fencepost::deallocate(ptr) };
  }
  assert!(fencepost::verify());
}

#[test]
fn degenerate_requests_return_null() {
  assert!(fencepost::allocate(0).is_null());
  assert!(fencepost::zero_allocate(0, 16).is_null());
  assert!(fencepost::zero_allocate(usize::MAX, 2).is_null());
  assert!(fencepost::allocate(MAX_CHUNK_SIZE).is_null());
  assert_eq!(unsafe { fencepost::usable_size(std::ptr::null()) }, 0);
  unsafe { fencepost::deallocate(std::ptr::null_mut()) };
}

#[test]
fn zero_allocate_clears_the_payload() {
  let dirty = fencepost::allocate(512);
  unsafe {
    dirty.write_bytes(0xFF, 512);
    fencepost::deallocate(dirty);
  }

  let ptr = fencepost::zero_allocate(64, 8);
  assert!(!ptr.is_null());
  let bytes = unsafe { std::slice::from_raw_parts(ptr, 512) };
  assert!(bytes.iter().all(|&byte| byte == 0));
  unsafe { fencepost::deallocate(ptr) };
}

#[test]
fn reallocate_keeps_the_common_prefix() {
  unsafe {
    let ptr = fencepost::reallocate(std::ptr::null_mut(), 64);
    assert!(!ptr.is_null());
    for i in 0..64 {
      ptr.add(i).write(i as u8);
    }

    let grown = fencepost::reallocate(ptr, 4000);
    assert!(!grown.is_null());
    for i in 0..64 {
      assert_eq!(grown.add(i).read(), i as u8);
    }

    let shrunk = fencepost::reallocate(grown, 16);
    for i in 0..16 {
      assert_eq!(shrunk.add(i).read(), i as u8);
    }

    assert!(fencepost::reallocate(shrunk, 0).is_null());
  }
  assert!(fencepost::verify());
}

#[test]
fn threads_share_the_process_heap() {
  let handles: Vec<_> = (0..8u8)
    .map(|id| {
      thread::spawn(move || {
        let mut live = Vec::new();
        for round in 0..500usize {
          let size = 1 + (round * 53 + id as usize) % 1500;
          let ptr = fencepost::allocate(size);
          assert!(!ptr.is_null());
          unsafe { ptr.write_bytes(id, size) };
          live.push((ptr, size));
          if round % 3 == 0 {
            let (ptr, size) = live.swap_remove(round % live.len());
            let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
            assert!(bytes.iter().all(|&byte| byte == id));
            unsafe { fencepost::deallocate(ptr) };
          }
        }
        for (ptr, _) in live {
          unsafe { fencepost::deallocate(ptr) };
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  assert!(fencepost::verify());
  assert!(fencepost::stats().is_some_and(|stats| stats.chunks >= 1));
}

#[test]
fn double_free_aborts() {
  if in_child("double_free_aborts") {
    let ptr = fencepost::allocate(32);
    unsafe {
      fencepost::deallocate(ptr);
      fencepost::deallocate(ptr);
    }
    return;
  }

  let output = run_child("double_free_aborts");
  assert!(!output.status.success());
  assert!(String::from_utf8_lossy(&output.stderr).contains("double free"));
}

#[test]
fn foreign_pointer_aborts() {
  if in_child("foreign_pointer_aborts") {
    let mut local = [0u64; 8];
    unsafe { fencepost::deallocate(local.as_mut_ptr().add(4).cast()) };
    return;
  }

  let output = run_child("foreign_pointer_aborts");
  assert!(!output.status.success());
  assert!(String::from_utf8_lossy(&output.stderr).contains("not allocated by this heap"));
}

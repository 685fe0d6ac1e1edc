use core::{
  fmt,
  ptr::{self, NonNull},
};

use crate::{
  block::{Block, HEADER_SIZE, MIN_BLOCK_SIZE, Region, State, block_size_for},
  config::{HeapConfig, MAX_HEAP_ALIGN, MAX_OS_CHUNKS, MIN_ALLOCATION, N_LISTS},
  error::{AllocError, FreeError, ReallocError},
  freelist::{CATCH_ALL, SENTINELS_SIZE, bucket_index},
  os::{ChunkSource, Reserved},
};

// =============================================================================
// Heap
// =============================================================================

/// A boundary-tag heap over the chunks of one [`ChunkSource`].
///
/// Not synchronized; wrap it in a [`SharedHeap`](crate::SharedHeap) to share
/// it between threads.
pub struct Heap<S: ChunkSource = Reserved> {
  pub(crate) source: S,
  pub(crate) config: HeapConfig,
  pub(crate) region: Region,
  /// Right fencepost of the most recently obtained extent.
  pub(crate) last_fencepost: Option<Block>,
  /// Left fenceposts of independent chunks, for the verifier.
  pub(crate) chunks: [Block; MAX_OS_CHUNKS],
  pub(crate) chunk_count: usize,
  /// Chunks that did not fit in `chunks`.
  pub(crate) unregistered: usize,
  /// Bytes obtained for chunks.
  pub(crate) heap_bytes: usize,
}

unsafe impl<S: ChunkSource + Send> Send for Heap<S> {}

/// Counters returned by [`Heap::stats`].
///
/// Free counters come from the free lists and cover every chunk. Allocated
/// counters come from walking the chunk registry, so they leave out the
/// `unregistered_chunks` that did not fit in it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Every independent chunk, registered or not.
  pub chunks: usize,
  pub unregistered_chunks: usize,
  pub heap_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
}

/// One header as seen by [`Heap::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Address of the header. The payload of an allocated block starts
  /// `HEADER_SIZE` bytes later.
  pub addr: usize,
  /// Distance of the header from the heap base.
  pub offset: usize,
  pub size: usize,
  pub left_size: usize,
  pub state: State,
}

impl BlockInfo {
  /// One past the last byte of the block.
  pub fn end(&self) -> usize {
    self.addr + self.size
  }
}

impl fmt::Display for BlockInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{:#x} +{}] {} size={} left_size={}",
      self.addr, self.offset, self.state, self.size, self.left_size
    )
  }
}

impl<S: ChunkSource> Heap<S> {
  /// Builds a heap with its first chunk already in place.
  pub fn new(mut source: S, config: HeapConfig) -> Result<Self, AllocError> {
    config.validate()?;

    let base = source.grow(SENTINELS_SIZE).ok_or(AllocError::OutOfMemory)?;
    if base.as_ptr() as usize % MIN_ALLOCATION != 0 {
      return Err(AllocError::OutOfMemory);
    }

    let region = Region::new(base, SENTINELS_SIZE);
    region.init_sentinels();

    let mut heap = Self {
      source,
      config,
      region,
      last_fencepost: None,
      chunks: [Block(0); MAX_OS_CHUNKS],
      chunk_count: 0,
      unregistered: 0,
      heap_bytes: 0,
    };
    heap.grow(config.arena_size)?;
    Ok(heap)
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Whether `ptr` falls inside memory this heap has obtained for chunks.
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    let base = self.region.base();
    addr >= base + self.region.floor() && addr < base + self.region.top()
  }

  // ===========================================================================
  // Arena Manager
  // ===========================================================================

  /// Obtains `size` more bytes and makes them one free block.
  fn grow(&mut self, size: usize) -> Result<(), AllocError> {
    let Some(extent) = self.source.grow(size) else {
      log::warn!("chunk source refused {size} bytes");
      return Err(AllocError::OutOfMemory);
    };

    let start = (extent.as_ptr() as usize)
      .checked_sub(self.region.base())
      .filter(|&start| start >= self.region.floor() && start % MIN_ALLOCATION == 0);
    let Some(start) = start else {
      log::warn!("extent {:p} lies below the heap base", extent);
      return Err(AllocError::OutOfMemory);
    };

    let end = start + size;
    self.region.raise_top(end);
    self.heap_bytes += size;

    let region = self.region;
    let right_fencepost = Block(end - HEADER_SIZE);
    let previous = self
      .last_fencepost
      .filter(|fencepost| fencepost.0 + HEADER_SIZE == start);

    match previous {
      Some(old_fencepost) => {
        // The old right fencepost becomes the header of the new free block,
        // which runs up to the new right fencepost.
        let block = old_fencepost;
        region.zero(block.0 + HEADER_SIZE, size - HEADER_SIZE);
        region.set_size_and_state(block, size, State::Free);
        init_fencepost(&region, right_fencepost, size);

        let left = region.left(block);
        if region.state(left) == Some(State::Free) {
          let old_bucket = bucket_index(region.size(left));
          let merged = region.size(left) + size;
          region.set_size(left, merged);
          region.set_left_size(right_fencepost, merged);
          region.zero(block.0, HEADER_SIZE);
          region.relist(left, old_bucket);
        } else {
          region.insert(block);
        }
        log::debug!("extended last chunk by {size} bytes at {:p}", extent);
      }
      None => {
        let left_fencepost = Block(start);
        let block = Block(start + HEADER_SIZE);
        let block_size = size - 2 * HEADER_SIZE;
        init_fencepost(&region, left_fencepost, HEADER_SIZE);
        region.set_size_and_state(block, block_size, State::Free);
        region.set_left_size(block, HEADER_SIZE);
        init_fencepost(&region, right_fencepost, block_size);
        region.insert(block);
        self.register_chunk(left_fencepost);
        log::debug!("obtained new {size} byte chunk at {:p}", extent);
      }
    }

    self.last_fencepost = Some(right_fencepost);
    Ok(())
  }

  fn register_chunk(&mut self, left_fencepost: Block) {
    if self.chunk_count < MAX_OS_CHUNKS {
      self.chunks[self.chunk_count] = left_fencepost;
      self.chunk_count += 1;
    } else {
      self.unregistered += 1;
      log::warn!(
        "chunk registry full; chunk at {:#x} will not be verified",
        self.region.addr(left_fencepost)
      );
    }
  }

  /// Size of the chunk to request so that `need` fits in its free block.
  fn chunk_size_for(&self, need: usize) -> Result<usize, AllocError> {
    let chunk = need
      .checked_add(2 * HEADER_SIZE)
      .and_then(|n| n.checked_next_multiple_of(self.config.arena_size))
      .ok_or(AllocError::Overflow)?;
    if chunk > self.config.max_chunk_size {
      log::warn!(
        "{need} byte block needs a {chunk} byte chunk, above the {} byte limit",
        self.config.max_chunk_size
      );
      return Err(AllocError::OutOfMemory);
    }
    Ok(chunk)
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Returns a payload of at least `size` bytes, aligned to `MIN_ALLOCATION`.
  /// Contents are unspecified.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.allocate_aligned(size, MIN_ALLOCATION)
  }

  /// [`allocate`](Self::allocate) with the payload aligned to `align`, a power
  /// of two no larger than `MAX_HEAP_ALIGN`.
  ///
  /// The split point is moved down until the header, and with it the payload,
  /// lands on `align`. Block sizes stay multiples of `MIN_ALLOCATION`.
  pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }
    if !align.is_power_of_two() || align > MAX_HEAP_ALIGN {
      return Err(AllocError::Alignment { align });
    }
    let align = align.max(MIN_ALLOCATION);
    let need = block_size_for(size).ok_or(AllocError::Overflow)?;
    // A fresh block must fit the request at any offset.
    let slack = if align > MIN_ALLOCATION {
      align + MIN_BLOCK_SIZE
    } else {
      0
    };

    let mut grown = false;
    loop {
      if let Some((block, take)) = self.find_fit(need, align) {
        return Ok(self.place(block, take));
      }
      if grown {
        return Err(AllocError::OutOfMemory);
      }
      let chunk = self.chunk_size_for(need.checked_add(slack).ok_or(AllocError::Overflow)?)?;
      self.grow(chunk)?;
      grown = true;
    }
  }

  /// Same as `allocate(count * size)`, with the payload zeroed.
  pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let total = count.checked_mul(size).ok_or(AllocError::Overflow)?;
    let ptr = self.allocate(total)?;
    unsafe { ptr.as_ptr().write_bytes(0, total) };
    Ok(ptr)
  }

  /// First block that can hold `need` bytes on `align`, with the number of
  /// bytes to take from it.
  fn find_fit(&self, need: usize, align: usize) -> Option<(Block, usize)> {
    let region = &self.region;
    for bucket in bucket_index(need)..N_LISTS {
      let sentinel = region.sentinel(bucket);
      if bucket != CATCH_ALL && align == MIN_ALLOCATION {
        // Every member of an exact bucket has the same, sufficient size.
        if !region.is_empty(bucket) {
          return Some((region.next(sentinel), need));
        }
        continue;
      }

      let mut cur = region.next(sentinel);
      while cur != sentinel {
        if let Some(take) = self.fit(cur, need, align) {
          return Some((cur, take));
        }
        cur = region.next(cur);
      }
    }
    None
  }

  /// Bytes to carve from the tail of free `block` so the handed-out header
  /// lands on `align`.
  fn fit(&self, block: Block, need: usize, align: usize) -> Option<usize> {
    let size = self.region.size(block);
    if size < need {
      return None;
    }
    let start = self.region.addr(block);
    let take = need + (start + size - need) % align;
    if take <= size && size - take >= MIN_BLOCK_SIZE {
      return Some(take);
    }
    // No room to split: the whole block goes, so it must start aligned.
    (start % align == 0).then_some(size)
  }

  /// Carves `need` bytes out of the free `block` and marks them allocated.
  fn place(&mut self, block: Block, need: usize) -> NonNull<u8> {
    let region = self.region;
    let size = region.size(block);
    let leftover = size - need;

    if leftover < MIN_BLOCK_SIZE {
      region.unlink(block);
      region.set_state(block, State::Allocated);
      return region.payload(block);
    }

    // Hand out the tail; the head stays free where it is.
    let old_bucket = bucket_index(size);
    let right = region.right(block);
    let tail = Block(block.0 + leftover);

    region.set_size(block, leftover);
    region.set_size_and_state(tail, need, State::Allocated);
    region.set_left_size(tail, leftover);
    region.clear_links(tail);
    region.set_left_size(right, need);
    region.relist(block, old_bucket);

    region.payload(tail)
  }

  // ===========================================================================
  // Deallocation
  // ===========================================================================

  /// Returns the block behind `ptr` to the heap. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a pointer this heap handed out. The check for
  /// already-freed and foreign pointers is best effort: it reads the header
  /// word in front of `ptr` when `ptr` lies inside the heap.
  pub unsafe fn deallocate(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
    let Some(ptr) = NonNull::new(ptr) else {
      return Ok(());
    };
    let block = self.allocated_block(ptr)?;
    self.release(block);
    Ok(())
  }

  /// Moves the payload to a new block of `new_size` bytes, preserving the
  /// first `min(old usable size, new_size)` bytes. Null allocates. On failure
  /// the old block is left untouched.
  ///
  /// # Safety
  ///
  /// Same contract as [`deallocate`](Self::deallocate).
  pub unsafe fn reallocate(
    &mut self,
    ptr: *mut u8,
    new_size: usize,
  ) -> Result<NonNull<u8>, ReallocError> {
    let Some(old) = NonNull::new(ptr) else {
      return Ok(self.allocate(new_size)?);
    };
    if new_size == 0 {
      return Err(AllocError::ZeroSize.into());
    }

    let block = self.allocated_block(old)?;
    let usable = self.region.size(block) - HEADER_SIZE;
    let new = self.allocate(new_size)?;
    unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), usable.min(new_size)) };
    self.release(block);
    Ok(new)
  }

  /// Payload bytes available behind an allocated `ptr`.
  ///
  /// # Safety
  ///
  /// Same contract as [`deallocate`](Self::deallocate).
  pub unsafe fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    let block = self.allocated_block(NonNull::new(ptr.cast_mut())?).ok()?;
    Some(self.region.size(block) - HEADER_SIZE)
  }

  fn allocated_block(&self, ptr: NonNull<u8>) -> Result<Block, FreeError> {
    let addr = ptr.as_ptr() as usize;
    let invalid = FreeError::InvalidPointer { addr };
    let block = self.region.block_of(ptr).ok_or(invalid)?;

    match self.region.state(block) {
      Some(State::Allocated) => {}
      Some(State::Free) => return Err(FreeError::DoubleFree { addr }),
      _ => return Err(invalid),
    }
    if self.region.size(block) < MIN_BLOCK_SIZE || self.region.checked_right(block).is_none() {
      return Err(invalid);
    }
    Ok(block)
  }

  /// Frees an allocated block, merging it with whichever neighbors are free.
  fn release(&mut self, block: Block) {
    let region = self.region;
    let size = region.size(block);
    let left = region.left(block);
    let right = region.right(block);
    let left_free = region.state(left) == Some(State::Free);
    let right_free = region.state(right) == Some(State::Free);

    match (left_free, right_free) {
      (false, false) => {
        region.set_state(block, State::Free);
        region.zero(block.0 + HEADER_SIZE, size - HEADER_SIZE);
        region.insert(block);
      }
      (true, false) => {
        let old_bucket = bucket_index(region.size(left));
        let merged = region.size(left) + size;
        region.set_size(left, merged);
        region.set_left_size(right, merged);
        region.zero(block.0, size);
        region.relist(left, old_bucket);
      }
      (false, true) => {
        let right_size = region.size(right);
        let old_bucket = bucket_index(right_size);
        let merged = size + right_size;
        region.zero(block.0 + HEADER_SIZE, size - HEADER_SIZE);
        region.splice(block, right);
        region.set_size_and_state(block, merged, State::Free);
        region.set_left_size(region.right(block), merged);
        region.zero(right.0, right_size);
        region.relist(block, old_bucket);
      }
      (true, true) => {
        let right_size = region.size(right);
        let beyond = region.right(right);
        let old_bucket = bucket_index(region.size(left));
        let merged = region.size(left) + size + right_size;
        region.unlink(right);
        region.set_size(left, merged);
        region.set_left_size(beyond, merged);
        region.zero(block.0, size + right_size);
        region.relist(left, old_bucket);
      }
    }
  }

  // ===========================================================================
  // Diagnostics
  // ===========================================================================

  /// Every header of every registered chunk, in address order, fenceposts
  /// included.
  pub fn blocks(&self) -> Blocks<'_, S> {
    Blocks {
      heap: self,
      chunk: 0,
      cur: None,
    }
  }

  /// Walks the free lists and the chunks. Call [`check`](Self::check) first
  /// on a heap that may be damaged.
  pub fn stats(&self) -> HeapStats {
    let region = &self.region;
    let mut stats = HeapStats {
      chunks: self.chunk_count + self.unregistered,
      unregistered_chunks: self.unregistered,
      heap_bytes: self.heap_bytes,
      ..HeapStats::default()
    };

    for bucket in 0..N_LISTS {
      let sentinel = region.sentinel(bucket);
      let mut cur = region.next(sentinel);
      while cur != sentinel {
        stats.free_blocks += 1;
        stats.free_bytes += region.size(cur);
        cur = region.next(cur);
      }
    }

    for info in self.blocks().filter(|info| info.state == State::Allocated) {
      stats.allocated_blocks += 1;
      stats.allocated_bytes += info.size;
    }

    stats
  }
}

impl<S: ChunkSource> fmt::Debug for Heap<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Heap")
      .field("base", &(self.region.base() as *const u8))
      .field("top", &self.region.top())
      .field("chunks", &self.chunk_count)
      .field("heap_bytes", &self.heap_bytes)
      .field("config", &self.config)
      .finish()
  }
}

fn init_fencepost(region: &Region, fencepost: Block, left_size: usize) {
  region.set_size_and_state(fencepost, HEADER_SIZE, State::Fencepost);
  region.set_left_size(fencepost, left_size);
}

// =============================================================================
// Blocks
// =============================================================================

/// Iterator returned by [`Heap::blocks`].
pub struct Blocks<'a, S: ChunkSource> {
  heap: &'a Heap<S>,
  chunk: usize,
  cur: Option<Block>,
}

impl<S: ChunkSource> Iterator for Blocks<'_, S> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let region = self.heap.region;
    loop {
      let (block, opening) = match self.cur.take() {
        Some(block) => (block, false),
        None => {
          let block = *self.heap.chunks[..self.heap.chunk_count].get(self.chunk)?;
          self.chunk += 1;
          (block, true)
        }
      };

      // An undecodable header ends the walk of its chunk.
      let Some(state) = region.state(block) else {
        continue;
      };
      let closing = state == State::Fencepost && !opening;
      if !closing {
        self.cur = region.checked_right(block);
      }

      return Some(BlockInfo {
        addr: region.addr(block),
        offset: block.0,
        size: region.size(block),
        left_size: region.left_size(block),
        state,
      });
    }
  }
}

//! Boundary-tag block headers.
//!
//! Every block in a chunk, free or allocated, starts with a [`Header`]. The
//! first word packs the block size with its [`State`], the second word is the
//! size of the block immediately to the left. Together they give O(1) access
//! to both neighbors from nothing but an address.
//!
//! ```text
//!   allocated:  [ size|state | left_size | payload ........................ ]
//!   free:       [ size|state | left_size | next | prev | zeroed ........... ]
//!   fencepost:  [ HEADER_SIZE|FENCEPOST | left_size ]
//! ```
//!
//! Free-list links are byte offsets from the heap base rather than pointers,
//! so a [`Block`] is just an offset and every header lives inside memory the
//! heap obtained from its chunk source.

use core::{fmt, mem::size_of, ptr::NonNull};

use crate::config::MIN_ALLOCATION;

// =============================================================================
// Layout
// =============================================================================

#[repr(C)]
pub(crate) struct Header {
  size_state: usize,
  left_size: usize,
  next: usize,
  prev: usize,
}

/// Overhead of an allocated block: the payload starts this far after its
/// header. Also the full size of a fencepost.
pub const HEADER_SIZE: usize = 2 * size_of::<usize>();

/// Smallest block the heap creates: a header with room for both links.
pub const MIN_BLOCK_SIZE: usize = size_of::<Header>();

const LINKS_SIZE: usize = MIN_BLOCK_SIZE - HEADER_SIZE;
const STATE_MASK: usize = MIN_ALLOCATION - 1;

const _: () = assert!(core::mem::offset_of!(Header, next) == HEADER_SIZE);

/// Lifecycle state stored in the low bits of the size word.
#[repr(usize)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
  Free = 0,
  Allocated = 1,
  Fencepost = 2,
}

impl State {
  #[inline]
  const fn from_bits(bits: usize) -> Option<Self> {
    match bits {
      0 => Some(Self::Free),
      1 => Some(Self::Allocated),
      2 => Some(Self::Fencepost),
      _ => None,
    }
  }
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Free => "free",
      Self::Allocated => "allocated",
      Self::Fencepost => "fencepost",
    })
  }
}

/// Full block size for a payload request of `request` bytes, or `None` if the
/// arithmetic overflows.
#[inline]
pub(crate) const fn block_size_for(request: usize) -> Option<usize> {
  let Some(padded) = request.checked_add(MIN_ALLOCATION - 1) else {
    return None;
  };
  let rounded = padded & !(MIN_ALLOCATION - 1);
  if rounded <= LINKS_SIZE {
    Some(MIN_BLOCK_SIZE)
  } else {
    rounded.checked_add(HEADER_SIZE)
  }
}

/// Offset of a header from the heap base.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(pub(crate) usize);

// =============================================================================
// Region
// =============================================================================

/// The span of memory a heap has obtained so far.
///
/// `[0, floor)` holds the free-list sentinels, `[floor, top)` holds chunks.
/// Accessors taking a [`Block`] require it to name a live header inside the
/// region; the `is_*` predicates exist to establish that for untrusted offsets.
#[derive(Clone, Copy)]
pub(crate) struct Region {
  base: NonNull<u8>,
  floor: usize,
  top: usize,
}

impl Region {
  pub(crate) const fn new(base: NonNull<u8>, floor: usize) -> Self {
    Self {
      base,
      floor,
      top: floor,
    }
  }

  #[inline]
  pub(crate) fn base(&self) -> usize {
    self.base.as_ptr() as usize
  }

  #[inline]
  pub(crate) const fn floor(&self) -> usize {
    self.floor
  }

  #[inline]
  pub(crate) const fn top(&self) -> usize {
    self.top
  }

  pub(crate) fn raise_top(&mut self, top: usize) {
    self.top = self.top.max(top);
  }

  #[inline]
  fn header(&self, block: Block) -> *mut Header {
    unsafe { self.base.as_ptr().add(block.0).cast() }
  }

  #[inline]
  pub(crate) fn addr(&self, block: Block) -> usize {
    self.base() + block.0
  }

  // --- Untrusted offsets ---

  /// Whether a tag (`size_state` and `left_size`) can be read at `offset`.
  #[inline]
  pub(crate) fn is_header(&self, offset: usize) -> bool {
    offset >= self.floor
      && offset % MIN_ALLOCATION == 0
      && offset
        .checked_add(HEADER_SIZE)
        .is_some_and(|end| end <= self.top)
  }

  /// Whether a free-list node (sentinel or free block) can be read at `offset`.
  #[inline]
  pub(crate) fn is_node(&self, offset: usize) -> bool {
    if offset < self.floor {
      return offset % MIN_BLOCK_SIZE == 0;
    }
    self.is_header(offset)
      && offset
        .checked_add(MIN_BLOCK_SIZE)
        .is_some_and(|end| end <= self.top)
  }

  /// Header of the block whose payload starts at `ptr`, if `ptr` could be one.
  pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> Option<Block> {
    let offset = (ptr.as_ptr() as usize)
      .checked_sub(self.base())?
      .checked_sub(HEADER_SIZE)?;
    self.is_header(offset).then_some(Block(offset))
  }

  /// Right neighbor of `block`, if its recorded size keeps it inside the
  /// region.
  pub(crate) fn checked_right(&self, block: Block) -> Option<Block> {
    let size = self.size(block);
    if size < HEADER_SIZE {
      return None;
    }
    let right = block.0.checked_add(size)?;
    self.is_header(right).then_some(Block(right))
  }

  // --- Tags ---

  #[inline]
  pub(crate) fn size(&self, block: Block) -> usize {
    unsafe { (*self.header(block)).size_state & !STATE_MASK }
  }

  #[inline]
  pub(crate) fn state(&self, block: Block) -> Option<State> {
    State::from_bits(unsafe { (*self.header(block)).size_state } & STATE_MASK)
  }

  #[inline]
  pub(crate) fn set_size(&self, block: Block, size: usize) {
    debug_assert_eq!(size & STATE_MASK, 0);
    let header = self.header(block);
    unsafe { (*header).size_state = size | ((*header).size_state & STATE_MASK) };
  }

  #[inline]
  pub(crate) fn set_state(&self, block: Block, state: State) {
    let header = self.header(block);
    unsafe { (*header).size_state = ((*header).size_state & !STATE_MASK) | state as usize };
  }

  #[inline]
  pub(crate) fn set_size_and_state(&self, block: Block, size: usize, state: State) {
    debug_assert_eq!(size & STATE_MASK, 0);
    unsafe { (*self.header(block)).size_state = size | state as usize };
  }

  #[inline]
  pub(crate) fn left_size(&self, block: Block) -> usize {
    unsafe { (*self.header(block)).left_size }
  }

  #[inline]
  pub(crate) fn set_left_size(&self, block: Block, left_size: usize) {
    unsafe { (*self.header(block)).left_size = left_size };
  }

  #[inline]
  pub(crate) fn right(&self, block: Block) -> Block {
    Block(block.0 + self.size(block))
  }

  #[inline]
  pub(crate) fn left(&self, block: Block) -> Block {
    Block(block.0 - self.left_size(block))
  }

  // --- Links ---

  #[inline]
  pub(crate) fn next(&self, block: Block) -> Block {
    Block(unsafe { (*self.header(block)).next })
  }

  #[inline]
  pub(crate) fn prev(&self, block: Block) -> Block {
    Block(unsafe { (*self.header(block)).prev })
  }

  #[inline]
  pub(crate) fn set_next(&self, block: Block, next: Block) {
    unsafe { (*self.header(block)).next = next.0 };
  }

  #[inline]
  pub(crate) fn set_prev(&self, block: Block, prev: Block) {
    unsafe { (*self.header(block)).prev = prev.0 };
  }

  #[inline]
  pub(crate) fn clear_links(&self, block: Block) {
    self.set_next(block, Block(0));
    self.set_prev(block, Block(0));
  }

  // --- Payload ---

  #[inline]
  pub(crate) fn payload(&self, block: Block) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block.0 + HEADER_SIZE)) }
  }

  /// Zeroes `len` bytes starting `from` bytes into the region.
  #[inline]
  pub(crate) fn zero(&self, from: usize, len: usize) {
    debug_assert!(from + len <= self.top);
    unsafe { self.base.as_ptr().add(from).write_bytes(0, len) };
  }
}

//! Block header codec.
//!
//! Every block starts with a two word header followed by its payload:
//!
//! ```text
//!   ┌──────────────────────┬──────────────────────┬─────────────────────────┐
//!   │ size | allocated bit │ next free (or NIL)   │   payload (size bytes)  │
//!   └──────────────────────┴──────────────────────┴─────────────────────────┘
//!   ^ block offset                              ^ payload offset
//! ```
//!
//! Sizes are multiples of [`ALIGNMENT`], so bit 0 of the first word is free to
//! carry the allocated flag. The second word is only meaningful while the
//! block sits on the free list.

use std::mem;

/// Size of a machine word.
pub const WORD: usize = mem::size_of::<usize>();

/// Alignment of every block offset, payload address and payload size.
pub const ALIGNMENT: usize = 2 * WORD;

/// Bytes taken by a block header.
pub const HEADER_SIZE: usize = 2 * WORD;

/// Smallest remainder worth splitting off: a header plus one alignment unit.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + ALIGNMENT;

const ALLOCATED: usize = 0x1;

/// Link value stored in the header of the last free block.
pub(crate) const NIL: usize = usize::MAX;

/// Packs a payload size and an allocated flag into one header word.
#[inline]
pub const fn encode(
  size: usize,
  allocated: bool,
) -> usize {
  debug_assert!(size % ALIGNMENT == 0);
  size | allocated as usize
}

/// Payload size stored in a header word.
#[inline]
pub const fn decode_size(word: usize) -> usize {
  word & !(ALIGNMENT - 1)
}

/// Allocated flag stored in a header word.
#[inline]
pub const fn decode_allocated(word: usize) -> bool {
  word & ALLOCATED != 0
}

/// Position of a block header, as an offset into the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

impl Block {
  pub(crate) const fn at(offset: usize) -> Self {
    Self(offset)
  }

  /// Offset of the header.
  pub const fn offset(self) -> usize {
    self.0
  }

  /// Offset of the first payload byte.
  pub const fn payload_of(self) -> usize {
    self.0 + HEADER_SIZE
  }

  /// Block owning the payload at `payload`, if a header fits in front of it.
  pub const fn block_of(payload: usize) -> Option<Self> {
    if payload < HEADER_SIZE || payload % ALIGNMENT != 0 {
      return None;
    }
    Some(Self(payload - HEADER_SIZE))
  }

  /// First offset past a payload of `size` bytes.
  pub(crate) const fn end(
    self,
    size: usize,
  ) -> usize {
    self.0.saturating_add(HEADER_SIZE).saturating_add(size)
  }
}

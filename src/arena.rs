//! The heap arena: every extent the heap owns, addressed by offset.
//!
//! Extents are laid out one after another in a single logical offset space,
//! in the order they were obtained. An extent that starts exactly where the
//! previous one ends extends that segment, so blocks can later be merged
//! across it. Otherwise it opens a new segment, and blocks never straddle the
//! boundary between two segments.
//!
//! ```text
//!   offset 0                     seg.len   seg.len + ...
//!   ┌──────────────────────────────┬────────────────────────┐
//!   │ segment 0 (one or more       │ segment 1 (disjoint    │
//!   │ contiguous extents)          │ extent)                │
//!   └──────────────────────────────┴────────────────────────┘
//! ```

use std::ptr::NonNull;

use crate::{
  block::{self, Block, NIL, WORD},
  page::Extent,
};

#[derive(Debug)]
struct Segment {
  base: NonNull<u8>,
  offset: usize,
  len: usize,
}

impl Segment {
  const fn end(&self) -> usize {
    self.offset + self.len
  }

  fn end_addr(&self) -> usize {
    self.base.as_ptr() as usize + self.len
  }
}

#[derive(Debug, Default)]
pub(crate) struct Arena {
  segments: Vec<Segment>,
  len: usize,
}

impl Arena {
  pub(crate) const fn new() -> Self {
    Self {
      segments: Vec::new(),
      len: 0,
    }
  }

  /// Total bytes owned.
  pub(crate) const fn len(&self) -> usize {
    self.len
  }

  /// Offset ranges of the segments, in order.
  pub(crate) fn segments(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
    self.segments.iter().map(|segment| (segment.offset, segment.end()))
  }

  /// Appends an extent and returns the offset of its first byte.
  pub(crate) fn push(
    &mut self,
    extent: Extent,
  ) -> usize {
    debug_assert!(!extent.is_empty(), "empty extent");
    let offset = self.len;

    match self.segments.last_mut() {
      Some(last) if last.end_addr() == extent.start().as_ptr() as usize => {
        last.len += extent.len();
      }
      _ => self.segments.push(Segment {
        base: extent.start(),
        offset,
        len: extent.len(),
      }),
    }

    self.len += extent.len();
    offset
  }

  fn segment(
    &self,
    offset: usize,
  ) -> Option<&Segment> {
    let index = self.segments.partition_point(|segment| segment.offset <= offset);
    let segment = self.segments.get(index.checked_sub(1)?)?;
    (offset < segment.end()).then_some(segment)
  }

  /// End offset of the segment holding `offset`.
  pub(crate) fn segment_end(
    &self,
    offset: usize,
  ) -> Option<usize> {
    self.segment(offset).map(Segment::end)
  }

  /// Whether a whole header can be read at `offset`.
  pub(crate) fn holds_header(
    &self,
    offset: usize,
  ) -> bool {
    offset % block::ALIGNMENT == 0
      && self
        .segment(offset)
        .is_some_and(|segment| offset + block::HEADER_SIZE <= segment.end())
  }

  /// Whether `block`'s payload lies entirely inside its own segment.
  pub(crate) fn holds_block(
    &self,
    block: Block,
  ) -> bool {
    self.holds_header(block.offset())
      && self
        .segment(block.offset())
        .is_some_and(|segment| block.end(self.get_size(block)) <= segment.end())
  }

  pub(crate) fn ptr_of(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    let Some(segment) = self.segment(offset) else {
      panic!("offset {offset:#x} is outside the heap");
    };
    unsafe { segment.base.add(offset - segment.offset) }
  }

  pub(crate) fn offset_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<usize> {
    let address = ptr.as_ptr() as usize;
    self.segments.iter().find_map(|segment| {
      let base = segment.base.as_ptr() as usize;
      (base..segment.end_addr())
        .contains(&address)
        .then(|| segment.offset + (address - base))
    })
  }

  fn word_ptr(
    &self,
    offset: usize,
  ) -> *mut usize {
    assert!(offset % WORD == 0, "unaligned header word at {offset:#x}");
    let Some(segment) = self.segment(offset).filter(|segment| offset + WORD <= segment.end()) else {
      panic!("header word at {offset:#x} is outside the heap");
    };
    unsafe { segment.base.as_ptr().add(offset - segment.offset).cast::<usize>() }
  }

  fn word(
    &self,
    offset: usize,
  ) -> usize {
    unsafe { self.word_ptr(offset).read() }
  }

  fn set_word(
    &mut self,
    offset: usize,
    value: usize,
  ) {
    unsafe { self.word_ptr(offset).write(value) }
  }

  /// Writes a fresh header with no free list link.
  pub(crate) fn put_block(
    &mut self,
    block: Block,
    size: usize,
    allocated: bool,
  ) {
    self.set_word(block.offset(), block::encode(size, allocated));
    self.set_next(block, None);
  }

  /// The raw size/tag word.
  pub(crate) fn header_word(
    &self,
    block: Block,
  ) -> usize {
    self.word(block.offset())
  }

  #[cfg(test)]
  pub(crate) fn set_header_word(
    &mut self,
    block: Block,
    word: usize,
  ) {
    self.set_word(block.offset(), word);
  }

  pub(crate) fn get_size(
    &self,
    block: Block,
  ) -> usize {
    block::decode_size(self.word(block.offset()))
  }

  /// Rewrites the size, keeping the allocated flag.
  pub(crate) fn set_size(
    &mut self,
    block: Block,
    size: usize,
  ) {
    let allocated = self.is_allocated(block);
    self.set_word(block.offset(), block::encode(size, allocated));
  }

  pub(crate) fn is_allocated(
    &self,
    block: Block,
  ) -> bool {
    block::decode_allocated(self.word(block.offset()))
  }

  pub(crate) fn set_allocated(
    &mut self,
    block: Block,
  ) {
    let word = self.word(block.offset());
    self.set_word(block.offset(), word | 0x1);
  }

  pub(crate) fn set_free(
    &mut self,
    block: Block,
  ) {
    let word = self.word(block.offset());
    self.set_word(block.offset(), word & !0x1);
  }

  pub(crate) fn next(
    &self,
    block: Block,
  ) -> Option<Block> {
    match self.word(block.offset() + WORD) {
      NIL => None,
      offset => Some(Block::at(offset)),
    }
  }

  pub(crate) fn set_next(
    &mut self,
    block: Block,
    next: Option<Block>,
  ) {
    self.set_word(block.offset() + WORD, next.map_or(NIL, Block::offset));
  }

  /// First offset past `block`'s payload.
  pub(crate) fn end_of(
    &self,
    block: Block,
  ) -> usize {
    block.end(self.get_size(block))
  }

  /// Whether `next` starts right where `block` ends, inside the same segment.
  pub(crate) fn adjacent(
    &self,
    block: Block,
    next: Block,
  ) -> bool {
    let end = self.end_of(block);
    end == next.offset() && self.segment_end(block.offset()).is_some_and(|limit| end < limit)
  }
}

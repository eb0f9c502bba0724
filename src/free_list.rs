//! Address-ordered, singly linked list of free blocks.
//!
//! The links live inside the free blocks themselves (second header word), so
//! the list is just a head offset. Keeping it sorted by offset means two list
//! neighbours are the only candidates for physical adjacency, which turns
//! coalescing and its check into a local, one-pass property.

use crate::{arena::Arena, block::Block};

#[derive(Debug, Default)]
pub(crate) struct FreeList {
  head: Option<Block>,
}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self { head: None }
  }

  pub(crate) const fn head(&self) -> Option<Block> {
    self.head
  }

  pub(crate) fn iter<'a>(
    &self,
    arena: &'a Arena,
  ) -> Iter<'a> {
    Iter {
      arena,
      current: self.head,
    }
  }

  /// Links `block` in front of the first entry with a higher offset.
  ///
  /// Returns the entry now preceding `block`, if any.
  pub(crate) fn insert_ordered(
    &mut self,
    arena: &mut Arena,
    block: Block,
  ) -> Option<Block> {
    let mut prev = None;
    let mut current = self.head;

    while let Some(entry) = current {
      if entry > block {
        break;
      }
      prev = Some(entry);
      current = arena.next(entry);
    }

    arena.set_next(block, current);
    self.link(arena, prev, Some(block));
    prev
  }

  /// Unlinks `block`. Returns `false` if it was not on the list.
  pub(crate) fn remove(
    &mut self,
    arena: &mut Arena,
    block: Block,
  ) -> bool {
    let Some(prev) = self.position(arena, block) else {
      return false;
    };
    let next = arena.next(block);
    self.link(arena, prev, next);
    arena.set_next(block, None);
    true
  }

  /// Puts `new` in `old`'s place. Returns `false` if `old` was not listed.
  pub(crate) fn replace(
    &mut self,
    arena: &mut Arena,
    old: Block,
    new: Block,
  ) -> bool {
    let Some(prev) = self.position(arena, old) else {
      return false;
    };
    let next = arena.next(old);
    arena.set_next(new, next);
    self.link(arena, prev, Some(new));
    true
  }

  /// First entry whose payload holds at least `min_size` bytes.
  pub(crate) fn find_first_fit(
    &self,
    arena: &Arena,
    min_size: usize,
  ) -> Option<Block> {
    self.iter(arena).find(|&block| arena.get_size(block) >= min_size)
  }

  /// `Some(prev)` when `block` is listed, where `prev` is its predecessor.
  fn position(
    &self,
    arena: &Arena,
    block: Block,
  ) -> Option<Option<Block>> {
    let mut prev = None;
    for entry in self.iter(arena) {
      if entry == block {
        return Some(prev);
      }
      if entry > block {
        return None;
      }
      prev = Some(entry);
    }
    None
  }

  fn link(
    &mut self,
    arena: &mut Arena,
    prev: Option<Block>,
    next: Option<Block>,
  ) {
    match prev {
      Some(prev) => arena.set_next(prev, next),
      None => self.head = next,
    }
  }
}

pub(crate) struct Iter<'a> {
  arena: &'a Arena,
  current: Option<Block>,
}

impl Iterator for Iter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.current?;
    self.current = self.arena.next(block);
    Some(block)
  }
}

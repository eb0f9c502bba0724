//! Heap consistency checker.
//!
//! Two read-only passes over the heap:
//!
//! 1. The free list, pair by pair: every entry is a free, well-tagged header
//!    inside the heap, entries strictly increase in offset, no two neighbours
//!    touch (a touching pair is a missed coalesce), and the walk terminates.
//!    The number of entries must match the heap's free block counter.
//! 2. The implicit block chain: starting at each segment, `offset + header +
//!    size` must land exactly on the next header and finally on the segment
//!    end. Because blocks tile their segments, this is also the overlap check
//!    for allocated blocks. Every free block met on the way must be the next
//!    free list entry.

use crate::{
  arena::Arena,
  block::{self, ALIGNMENT, Block, MIN_BLOCK_SIZE},
  free_list::FreeList,
};

/// An invariant the heap failed to uphold, with the offsets and sizes involved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
  #[error("free list entry {offset:#x} is not a block header inside the heap")]
  OutOfBounds { offset: usize },
  #[error("block at {offset:#x} with {size} bytes runs past its segment end {end:#x}")]
  Overrun { offset: usize, size: usize, end: usize },
  #[error("header of block at {offset:#x} carries stray tag bits ({word:#x})")]
  StrayBits { offset: usize, word: usize },
  #[error("free list entry {offset:#x} ({size} bytes) is marked allocated")]
  AllocatedOnFreeList { offset: usize, size: usize },
  #[error("free list out of order: {prev:#x} is followed by {current:#x}")]
  OutOfOrder { prev: usize, current: usize },
  #[error("free blocks {prev:#x} ({prev_size} bytes) and {current:#x} touch but were not coalesced")]
  Uncoalesced {
    prev: usize,
    prev_size: usize,
    current: usize,
  },
  #[error("free list does not terminate within {bound} entries")]
  Cycle { bound: usize },
  #[error("free list holds {walked} blocks but the heap counts {tracked}")]
  CountMismatch { walked: usize, tracked: usize },
  #[error("{offset:#x}..{end:#x} is too short for a block header")]
  Gap { offset: usize, end: usize },
  #[error("free block at {offset:#x} is missing from the free list")]
  Unlisted { offset: usize },
  #[error("free list entry {offset:#x} does not start a block")]
  Stray { offset: usize },
}

/// Summary of a heap that passed the check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapReport {
  /// Bytes obtained from the page source, headers included.
  pub heap_bytes: usize,
  pub blocks: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  /// Largest payload a single allocation could get without growing the heap.
  pub largest_free: usize,
}

pub(crate) fn check(
  arena: &Arena,
  free_list: &FreeList,
  tracked: usize,
) -> Result<HeapReport, CheckError> {
  let walked = check_free_list(arena, free_list)?;
  if walked != tracked {
    return Err(CheckError::CountMismatch { walked, tracked });
  }
  check_chain(arena, free_list)
}

fn check_free_list(
  arena: &Arena,
  free_list: &FreeList,
) -> Result<usize, CheckError> {
  let bound = arena.len() / MIN_BLOCK_SIZE + 1;
  let mut walked = 0;
  let mut prev: Option<Block> = None;
  let mut current = free_list.head();

  while let Some(block) = current {
    let offset = block.offset();
    if walked == bound {
      return Err(CheckError::Cycle { bound });
    }
    if !arena.holds_header(offset) {
      return Err(CheckError::OutOfBounds { offset });
    }

    let word = arena.header_word(block);
    let size = block::decode_size(word);
    if word & (ALIGNMENT - 1) & !0x1 != 0 {
      return Err(CheckError::StrayBits { offset, word });
    }
    if !arena.holds_block(block) {
      let end = arena.segment_end(offset).unwrap_or(offset);
      return Err(CheckError::Overrun { offset, size, end });
    }
    if block::decode_allocated(word) {
      return Err(CheckError::AllocatedOnFreeList { offset, size });
    }

    if let Some(prev) = prev {
      if prev >= block {
        return Err(CheckError::OutOfOrder {
          prev: prev.offset(),
          current: offset,
        });
      }
      if arena.adjacent(prev, block) {
        return Err(CheckError::Uncoalesced {
          prev: prev.offset(),
          prev_size: arena.get_size(prev),
          current: offset,
        });
      }
    }

    current = arena.next(block);
    if current == Some(block) {
      return Err(CheckError::Cycle { bound });
    }
    walked += 1;
    prev = Some(block);
  }

  Ok(walked)
}

fn check_chain(
  arena: &Arena,
  free_list: &FreeList,
) -> Result<HeapReport, CheckError> {
  let mut report = HeapReport {
    heap_bytes: arena.len(),
    ..HeapReport::default()
  };
  let mut listed = free_list.head();

  for (start, end) in arena.segments() {
    let mut offset = start;

    while offset < end {
      if let Some(entry) = listed {
        if entry.offset() < offset {
          return Err(CheckError::Stray { offset: entry.offset() });
        }
      }
      if !arena.holds_header(offset) {
        return Err(CheckError::Gap { offset, end });
      }

      let block = Block::at(offset);
      let size = arena.get_size(block);
      let next = block.end(size);
      if next > end {
        return Err(CheckError::Overrun { offset, size, end });
      }

      if arena.is_allocated(block) {
        report.allocated_blocks += 1;
        report.allocated_bytes += size;
      } else {
        if listed != Some(block) {
          return Err(CheckError::Unlisted { offset });
        }
        listed = arena.next(block);
        report.free_blocks += 1;
        report.free_bytes += size;
        report.largest_free = report.largest_free.max(size);
      }

      report.blocks += 1;
      offset = next;
    }
  }

  match listed {
    Some(entry) => Err(CheckError::Stray { offset: entry.offset() }),
    None => Ok(report),
  }
}

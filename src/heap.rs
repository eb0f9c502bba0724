use std::{cmp, ptr::NonNull};

use log::{debug, error, trace, warn};

use crate::{
  align,
  align::checked_align_to,
  arena::Arena,
  block::{ALIGNMENT, Block, HEADER_SIZE, MIN_BLOCK_SIZE},
  check::{self, CheckError, HeapReport},
  config::HeapConfig,
  error::HeapError,
  free_list::FreeList,
  page::{PageSource, SourceError},
};

/// Largest request `alloc` accepts. Keeps every size computation far from
/// overflow.
pub const MAX_REQUEST: usize = isize::MAX as usize / 2;

/// A free block as seen from outside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
  /// Offset of the header within the heap.
  pub offset: usize,
  /// Payload bytes.
  pub size: usize,
  /// Where the payload would be handed out.
  pub payload: NonNull<u8>,
}

/// A first-fit heap with an explicit, address-ordered free list.
///
/// Single-threaded by construction: every operation takes `&mut self`.
pub struct Heap<S: PageSource> {
  arena: Arena,
  free_list: FreeList,
  free_blocks: usize,
  config: HeapConfig,
  source: S,
}

impl<S: PageSource> Heap<S> {
  /// Sets up a heap with the default configuration.
  pub fn init(source: S) -> Result<Self, HeapError> {
    Self::with_config(source, HeapConfig::default())
  }

  /// Obtains the initial extent and installs it as the only free block.
  pub fn with_config(
    source: S,
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    let mut heap = Self {
      arena: Arena::new(),
      free_list: FreeList::new(),
      free_blocks: 0,
      config,
      source,
    };

    let initial = heap
      .config
      .initial_pages
      .max(1)
      .saturating_mul(heap.source.granularity());
    let block = heap.extend(initial - HEADER_SIZE).map_err(HeapError::Init)?;
    heap.free_list.insert_ordered(&mut heap.arena, block);
    heap.free_blocks = 1;

    debug!(
      "heap initialised with {} bytes ({} usable)",
      heap.arena.len(),
      heap.arena.get_size(block)
    );

    heap.verify()?;
    Ok(heap)
  }

  /// Allocates at least `size` bytes and returns the payload address.
  ///
  /// The address is aligned to [`ALIGNMENT`]. A zero-byte request still gets
  /// a unique, one-unit block.
  pub fn alloc(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    if size > MAX_REQUEST {
      return Err(HeapError::RequestTooLarge { requested: size });
    }
    let rounded = cmp::max(align!(size), ALIGNMENT);

    let block = self
      .find(rounded)
      .inspect_err(|err| warn!("alloc({size}) failed: {err}"))?;

    if self.arena.get_size(block) - rounded < MIN_BLOCK_SIZE {
      let removed = self.free_list.remove(&mut self.arena, block);
      debug_assert!(removed, "fit {:#x} is not on the free list", block.offset());
      self.free_blocks -= 1;
    } else {
      self.split(block, rounded);
    }
    self.arena.set_allocated(block);

    trace!(
      "alloc({size}) -> {:#x} ({} bytes)",
      block.offset(),
      self.arena.get_size(block)
    );

    self.verify()?;
    Ok(self.arena.ptr_of(block.payload_of()))
  }

  /// Returns a block to the heap.
  ///
  /// Freeing null is a no-op. Pointers this heap does not own and blocks
  /// that are already free are reported as errors when they can be detected.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a pointer returned by [`alloc`](Self::alloc) on
  /// this heap and not freed since. Detection of violations is best effort:
  /// a pointer into the middle of a payload can go unnoticed and corrupt the
  /// heap.
  pub unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) -> Result<(), HeapError> {
    let Some(ptr) = NonNull::new(ptr) else {
      return Ok(());
    };

    let block = self.block_of(ptr)?;
    if !self.arena.is_allocated(block) {
      error!("double free of {ptr:?}");
      return Err(HeapError::DoubleFree {
        address: ptr.as_ptr() as usize,
      });
    }

    self.arena.set_free(block);
    self.free_blocks += 1;
    let prev = self.free_list.insert_ordered(&mut self.arena, block);
    let merged = self.coalesce(block, prev);

    trace!(
      "free({:#x}) -> free block {:#x} ({} bytes)",
      block.offset(),
      merged.offset(),
      self.arena.get_size(merged)
    );

    self.verify()
  }

  /// Payload capacity of a live allocation, which may exceed the request.
  pub fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> Result<usize, HeapError> {
    let block = self.block_of(ptr)?;
    if !self.arena.is_allocated(block) {
      return Err(HeapError::InvalidPointer {
        address: ptr.as_ptr() as usize,
      });
    }
    Ok(self.arena.get_size(block))
  }

  /// Validates the heap without changing it.
  pub fn check_heap(&self) -> Result<HeapReport, CheckError> {
    check::check(&self.arena, &self.free_list, self.free_blocks)
      .inspect_err(|err| error!("heap check failed: {err}"))
  }

  /// Number of free blocks the heap believes it has.
  pub const fn free_blocks(&self) -> usize {
    self.free_blocks
  }

  /// Bytes obtained from the page source so far.
  pub const fn heap_size(&self) -> usize {
    self.arena.len()
  }

  pub const fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub const fn source(&self) -> &S {
    &self.source
  }

  /// Free list entries in address order.
  pub fn free_list(&self) -> impl Iterator<Item = FreeBlock> + '_ {
    self.free_list.iter(&self.arena).map(|block| FreeBlock {
      offset: block.offset(),
      size: self.arena.get_size(block),
      payload: self.arena.ptr_of(block.payload_of()),
    })
  }

  fn block_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Result<Block, HeapError> {
    let invalid = HeapError::InvalidPointer {
      address: ptr.as_ptr() as usize,
    };

    let Some(block) = self.arena.offset_of(ptr).and_then(Block::block_of) else {
      return Err(invalid);
    };
    // The header has to sit in the same segment as the payload.
    if self.arena.segment_end(block.offset()) != self.arena.segment_end(block.payload_of())
      || !self.arena.holds_block(block)
    {
      return Err(invalid);
    }

    Ok(block)
  }

  /// First-fit search, growing the heap until a fit exists.
  fn find(
    &mut self,
    size: usize,
  ) -> Result<Block, HeapError> {
    if let Some(block) = self.free_list.find_first_fit(&self.arena, size) {
      return Ok(block);
    }

    loop {
      let fresh = self
        .extend(size)
        .map_err(|source| HeapError::OutOfMemory { requested: size, source })?;
      self.free_blocks += 1;
      let prev = self.free_list.insert_ordered(&mut self.arena, fresh);

      let block = self.coalesce(fresh, prev);
      if self.arena.get_size(block) >= size {
        return Ok(block);
      }
    }
  }

  /// Grows the heap by a fresh free block able to hold `min_size` bytes.
  ///
  /// Grows by at least the shortfall, and otherwise doubles the heap up to
  /// `max_growth`. The new block is not put on the free list.
  fn extend(
    &mut self,
    min_size: usize,
  ) -> Result<Block, SourceError> {
    let granularity = self.source.granularity();
    let wanted = min_size
      .checked_add(HEADER_SIZE)
      .map(|needed| cmp::max(needed, cmp::min(self.arena.len(), self.config.max_growth)))
      .and_then(|wanted| checked_align_to(wanted, granularity));
    let Some(wanted) = wanted else {
      return Err(SourceError::TooLarge { requested: min_size });
    };

    let extent = self.source.obtain(wanted)?;
    debug_assert!(extent.len() % ALIGNMENT == 0 && extent.len() >= MIN_BLOCK_SIZE);

    let block = Block::at(self.arena.push(extent));
    self.arena.put_block(block, extent.len() - HEADER_SIZE, false);

    debug!(
      "extended heap by {} bytes at {:#x}, now {} bytes",
      extent.len(),
      block.offset(),
      self.arena.len()
    );

    Ok(block)
  }

  /// Carves `size` bytes off the front of the free `block`; the remainder
  /// takes its place on the free list.
  fn split(
    &mut self,
    block: Block,
    size: usize,
  ) {
    let total = self.arena.get_size(block);
    debug_assert!(total >= size + MIN_BLOCK_SIZE);

    let remainder = Block::at(block.end(size));
    self.arena.put_block(remainder, total - size - HEADER_SIZE, false);
    let replaced = self.free_list.replace(&mut self.arena, block, remainder);
    debug_assert!(replaced, "split {:#x} is not on the free list", block.offset());
    self.arena.put_block(block, size, false);

    trace!(
      "split {:#x}: {size} + {} bytes at {:#x}",
      block.offset(),
      self.arena.get_size(remainder),
      remainder.offset()
    );
  }

  /// Merges the listed free `block` with free physical neighbours on both
  /// sides and returns the surviving block. `prev` is `block`'s list
  /// predecessor.
  fn coalesce(
    &mut self,
    block: Block,
    prev: Option<Block>,
  ) -> Block {
    if let Some(next) = self.arena.next(block) {
      if self.arena.adjacent(block, next) {
        let size = self.arena.get_size(block) + HEADER_SIZE + self.arena.get_size(next);
        let after = self.arena.next(next);
        self.arena.set_size(block, size);
        self.arena.set_next(block, after);
        self.free_blocks -= 1;
        trace!("coalesced {:#x} into {:#x}", next.offset(), block.offset());
      }
    }

    let Some(prev) = prev else {
      return block;
    };
    if !self.arena.adjacent(prev, block) {
      return block;
    }

    let size = self.arena.get_size(prev) + HEADER_SIZE + self.arena.get_size(block);
    let after = self.arena.next(block);
    self.arena.set_size(prev, size);
    self.arena.set_next(prev, after);
    self.free_blocks -= 1;
    trace!("coalesced {:#x} into {:#x}", block.offset(), prev.offset());

    prev
  }

  fn verify(&self) -> Result<(), HeapError> {
    if self.config.verify {
      self.check_heap()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::page::{MmapSource, page_size, testing::ScatteredSource};

  fn heap(pages: usize) -> Heap<MmapSource> {
    heap_with(pages, HeapConfig::default())
  }

  fn heap_with(
    pages: usize,
    config: HeapConfig,
  ) -> Heap<MmapSource> {
    let source = MmapSource::new(pages * page_size()).unwrap();
    Heap::with_config(source, config.with_verify(true)).unwrap()
  }

  fn free_list(heap: &Heap<impl PageSource>) -> Vec<(usize, usize)> {
    heap.free_list().map(|block| (block.offset, block.size)).collect()
  }

  #[test]
  fn test_init() {
    let heap = heap(16);
    let page = heap.source().granularity();

    assert_eq!(2 * page, heap.heap_size());
    assert_eq!(1, heap.free_blocks());
    assert_eq!(vec![(0, 2 * page - HEADER_SIZE)], free_list(&heap));
    assert_eq!(1, heap.check_heap().unwrap().free_blocks);
  }

  #[test]
  fn test_init_fails_without_pages() {
    let source = MmapSource::new(page_size()).unwrap();
    let result = Heap::with_config(source, HeapConfig::default().with_initial_pages(2));

    assert!(matches!(result, Err(HeapError::Init(SourceError::Exhausted { .. }))));
  }

  #[test]
  fn test_init_with_huge_initial_pages_fails() {
    let source = MmapSource::new(4 * page_size()).unwrap();
    let pages = usize::MAX / page_size();
    let result = Heap::with_config(source, HeapConfig::default().with_initial_pages(pages));
    assert!(matches!(result, Err(HeapError::Init(SourceError::Exhausted { .. }))));

    let source = MmapSource::new(4 * page_size()).unwrap();
    let result = Heap::with_config(source, HeapConfig::default().with_initial_pages(usize::MAX));
    assert!(matches!(result, Err(HeapError::Init(SourceError::TooLarge { .. }))));
  }

  #[test]
  fn test_alignment() {
    let mut heap = heap(64);

    for size in 0..200 {
      let ptr = heap.alloc(size).unwrap();
      let usable = heap.usable_size(ptr).unwrap();

      assert_eq!(0, ptr.as_ptr() as usize % ALIGNMENT);
      assert_eq!(0, usable % ALIGNMENT);
      assert!(usable >= size.max(1));
    }
  }

  #[test]
  fn test_zero_sized_allocations_are_distinct() {
    let mut heap = heap(16);
    let first = heap.alloc(0).unwrap();
    let second = heap.alloc(0).unwrap();

    assert_ne!(first, second);
    assert_eq!(ALIGNMENT, heap.usable_size(first).unwrap());
  }

  #[test]
  fn test_free_without_neighbours_stays_separate() {
    let mut heap = heap(16);
    let first = heap.alloc(64).unwrap();
    let _second = heap.alloc(128).unwrap();

    unsafe { heap.free(first.as_ptr()).unwrap() };

    let free: Vec<_> = heap.free_list().collect();
    assert_eq!(2, free.len());
    assert_eq!(2, heap.free_blocks());
    assert_eq!(first, free[0].payload);
    assert_eq!(64, free[0].size);
    heap.check_heap().unwrap();
  }

  #[test]
  fn test_free_adjacent_pair_merges_everything() {
    let mut heap = heap(16);
    let page = heap.source().granularity();
    let first = heap.alloc(64).unwrap();
    let second = heap.alloc(64).unwrap();

    unsafe {
      heap.free(first.as_ptr()).unwrap();
      heap.free(second.as_ptr()).unwrap();
    }

    assert_eq!(vec![(0, 2 * page - HEADER_SIZE)], free_list(&heap));
    assert_eq!(1, heap.free_blocks());
  }

  #[test]
  fn test_coalesce_in_either_order() {
    for reverse in [false, true] {
      let mut heap = heap(16);
      let first = heap.alloc(64).unwrap();
      let second = heap.alloc(64).unwrap();
      let _guard = heap.alloc(64).unwrap();

      unsafe {
        if reverse {
          heap.free(second.as_ptr()).unwrap();
          heap.free(first.as_ptr()).unwrap();
        } else {
          heap.free(first.as_ptr()).unwrap();
          heap.free(second.as_ptr()).unwrap();
        }
      }

      let free: Vec<_> = heap.free_list().collect();
      assert_eq!(2, free.len());
      assert_eq!(first, free[0].payload);
      assert_eq!(64 + HEADER_SIZE + 64, free[0].size);
    }
  }

  #[test]
  fn test_coalesce_both_sides() {
    let mut heap = heap(16);
    let blocks: Vec<_> = (0..3).map(|_| heap.alloc(64).unwrap()).collect();
    let _guard = heap.alloc(64).unwrap();

    unsafe {
      heap.free(blocks[0].as_ptr()).unwrap();
      heap.free(blocks[2].as_ptr()).unwrap();
      assert_eq!(3, heap.free_blocks());
      heap.free(blocks[1].as_ptr()).unwrap();
    }

    let free: Vec<_> = heap.free_list().collect();
    assert_eq!(2, heap.free_blocks());
    assert_eq!(blocks[0], free[0].payload);
    assert_eq!(3 * 64 + 2 * HEADER_SIZE, free[0].size);
  }

  #[test]
  fn test_coalesce_behind_a_later_list_entry() {
    let mut heap = heap(16);
    let blocks: Vec<_> = (0..5).map(|_| heap.alloc(64).unwrap()).collect();
    let _guard = heap.alloc(64).unwrap();

    unsafe {
      heap.free(blocks[0].as_ptr()).unwrap();
      heap.free(blocks[2].as_ptr()).unwrap();
      heap.free(blocks[4].as_ptr()).unwrap();
      assert_eq!(4, heap.free_blocks());
      heap.free(blocks[3].as_ptr()).unwrap();
    }

    let free: Vec<_> = heap.free_list().collect();
    assert_eq!(3, heap.free_blocks());
    assert_eq!(blocks[0], free[0].payload);
    assert_eq!(64, free[0].size);
    assert_eq!(blocks[2], free[1].payload);
    assert_eq!(3 * 64 + 2 * HEADER_SIZE, free[1].size);
    assert!(free[2].offset > free[1].offset);
  }

  #[test]
  fn test_freed_block_is_reused() {
    let mut heap = heap(16);
    let size = heap.heap_size();

    let first = heap.alloc(64).unwrap();
    unsafe { heap.free(first.as_ptr()).unwrap() };
    let second = heap.alloc(64).unwrap();

    assert_eq!(first, second);
    assert_eq!(size, heap.heap_size());
  }

  #[test]
  fn test_first_fit_prefers_lower_address() {
    let mut heap = heap(16);
    let low = heap.alloc(128).unwrap();
    let _a = heap.alloc(16).unwrap();
    let high = heap.alloc(128).unwrap();
    let _b = heap.alloc(16).unwrap();

    unsafe {
      heap.free(high.as_ptr()).unwrap();
      heap.free(low.as_ptr()).unwrap();
    }

    assert_eq!(low, heap.alloc(100).unwrap());
  }

  #[test]
  fn test_small_remainder_is_not_split() {
    let mut heap = heap(16);
    let victim = heap.alloc(64).unwrap();
    let _guard = heap.alloc(16).unwrap();
    unsafe { heap.free(victim.as_ptr()).unwrap() };
    let before = heap.free_blocks();

    // 64 - 48 leaves less than a header plus one unit.
    let reused = heap.alloc(48).unwrap();

    assert_eq!(victim, reused);
    assert_eq!(64, heap.usable_size(reused).unwrap());
    assert_eq!(before - 1, heap.free_blocks());
  }

  #[test]
  fn test_grows_when_initial_extent_runs_out() {
    let mut heap = heap(64);
    let initial = heap.heap_size();

    let mut live = Vec::new();
    while heap.heap_size() == initial {
      live.push(heap.alloc(100).unwrap());
    }

    let report = heap.check_heap().unwrap();
    assert!(heap.heap_size() > initial);
    assert_eq!(report.free_blocks, heap.free_blocks());
    assert_eq!(report.allocated_blocks, live.len());
    assert!(heap.free_blocks() >= 1);
  }

  #[test]
  fn test_growth_merges_with_free_tail() {
    let source = MmapSource::new(4 * page_size()).unwrap();
    let page = source.granularity();
    let config = HeapConfig::default().with_initial_pages(1).with_verify(true);
    let mut heap = Heap::with_config(source, config).unwrap();

    // Leaves a small free tail in front of the next extent.
    let request = page - 6 * ALIGNMENT;
    let first = heap.alloc(request).unwrap();
    let second = heap.alloc(request).unwrap();

    assert_eq!(2 * page, heap.heap_size());
    assert_eq!(1, heap.free_blocks());
    assert_eq!(
      first.as_ptr() as usize + request + HEADER_SIZE,
      second.as_ptr() as usize
    );
  }

  #[test]
  fn test_large_request_outgrows_max_growth() {
    let config = HeapConfig::default().with_max_growth(page_size());
    let mut heap = heap_with(64, config);
    let size = 8 * page_size();

    let ptr = heap.alloc(size).unwrap();

    assert!(heap.usable_size(ptr).unwrap() >= size);
    assert!(heap.heap_size() >= size);
  }

  #[test]
  fn test_exhaustion_is_recoverable() {
    let mut heap = heap(2);

    let err = heap.alloc(16 * page_size()).unwrap_err();
    assert!(matches!(err, HeapError::OutOfMemory { .. }));
    assert!(err.is_recoverable());

    heap.check_heap().unwrap();
    heap.alloc(64).unwrap();
  }

  #[test]
  fn test_request_too_large() {
    let mut heap = heap(2);
    let err = heap.alloc(usize::MAX).unwrap_err();

    assert!(matches!(err, HeapError::RequestTooLarge { .. }));
    assert!(err.is_recoverable());
  }

  #[test]
  fn test_double_free_is_detected() {
    let mut heap = heap(16);
    let ptr = heap.alloc(64).unwrap();

    unsafe {
      heap.free(ptr.as_ptr()).unwrap();
      let err = heap.free(ptr.as_ptr()).unwrap_err();
      assert!(matches!(err, HeapError::DoubleFree { .. }));
      assert!(!err.is_recoverable());
    }
  }

  #[test]
  fn test_foreign_pointers_are_rejected() {
    let mut heap = heap(16);
    let ptr = heap.alloc(64).unwrap();
    let mut local = 0u64;

    unsafe {
      let foreign = heap.free((&raw mut local).cast()).unwrap_err();
      assert!(matches!(foreign, HeapError::InvalidPointer { .. }));

      let misaligned = heap.free(ptr.as_ptr().add(1)).unwrap_err();
      assert!(matches!(misaligned, HeapError::InvalidPointer { .. }));
    }
    heap.check_heap().unwrap();
  }

  #[test]
  fn test_free_null_is_a_no_op() {
    let mut heap = heap(16);
    unsafe { heap.free(std::ptr::null_mut()).unwrap() };
    assert_eq!(1, heap.free_blocks());
  }

  #[test]
  fn test_disjoint_extents_never_merge() {
    let config = HeapConfig::default().with_initial_pages(1).with_verify(true);
    let mut heap = Heap::with_config(ScatteredSource::new(2), config).unwrap();
    let request = 4096 - 6 * ALIGNMENT;

    let first = heap.alloc(request).unwrap();
    let second = heap.alloc(request).unwrap();
    assert_eq!(2, heap.free_blocks());

    unsafe {
      heap.free(first.as_ptr()).unwrap();
      heap.free(second.as_ptr()).unwrap();
    }
    assert_eq!(
      vec![(0, 4096 - HEADER_SIZE), (4096, 4096 - HEADER_SIZE)],
      free_list(&heap)
    );

    let err = heap.alloc(2 * 4096).unwrap_err();
    assert!(err.is_recoverable());
    heap.check_heap().unwrap();
  }

  #[test]
  fn test_random_workload_keeps_heap_consistent() {
    let mut heap = heap(256);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    let mut seed = 0x2545_f491_u64;
    let mut next = move || {
      seed ^= seed << 13;
      seed ^= seed >> 7;
      seed ^= seed << 17;
      seed
    };

    for round in 0..2000 {
      let roll = next();
      if live.is_empty() || roll % 3 != 0 {
        let size = (next() % 512) as usize;
        let ptr = heap.alloc(size).unwrap();
        let fill = round as u8;
        unsafe { ptr.as_ptr().write_bytes(fill, size) };
        live.push((ptr, size, fill));
      } else {
        let (ptr, size, fill) = live.swap_remove((roll as usize / 3) % live.len());
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == fill), "payload at {ptr:?} was overwritten");
        unsafe { heap.free(ptr.as_ptr()).unwrap() };
      }
    }

    for (ptr, size, fill) in live.drain(..) {
      let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
      assert!(bytes.iter().all(|&b| b == fill));
      unsafe { heap.free(ptr.as_ptr()).unwrap() };
    }

    assert_eq!(vec![(0, heap.heap_size() - HEADER_SIZE)], free_list(&heap));
  }
}

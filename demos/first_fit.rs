use std::io::Read;

use firstfit::{Heap, HeapConfig, MmapSource, PageSource};

/// Waits until the user presses ENTER when the demo runs with `--pause`.
/// Useful when you want to inspect the mapping with tools like `pmap` or `gdb`.
fn block_until_enter_pressed(pause: bool) {
  if !pause {
    return;
  }
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the free list and the current break of the page source.
fn print_heap(
  label: &str,
  heap: &Heap<MmapSource>,
) {
  println!(
    "[{}] heap = {} bytes, break = {:?}, free blocks = {}",
    label,
    heap.heap_size(),
    heap.source().brk(),
    heap.free_blocks(),
  );
  for block in heap.free_list() {
    println!("      free @ {:#06x}: {} bytes", block.offset, block.size);
  }

  match heap.check_heap() {
    Ok(report) => println!(
      "      check ok: {} allocated / {} free bytes",
      report.allocated_bytes, report.free_bytes
    ),
    Err(err) => println!("      check FAILED: {err}"),
  }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let pause = std::env::args().any(|arg| arg == "--pause");

  // One megabyte of address space; the heap starts with two pages of it.
  let source = MmapSource::new(1 << 20)?;
  let page = source.granularity();
  let mut heap = Heap::with_config(source, HeapConfig::default().with_verify(true))?;

  print_heap("start", &heap);
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 1) Two small allocations are split off the front of the first block.
  // --------------------------------------------------------------------
  let first = heap.alloc(64)?;
  let second = heap.alloc(128)?;
  println!("\n[1] alloc(64) = {first:?}, alloc(128) = {second:?}");
  unsafe { first.as_ptr().write_bytes(0xAB, 64) };
  print_heap("1", &heap);
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 2) Freeing the first block leaves it on its own: its only physical
  //    neighbour is still allocated.
  // --------------------------------------------------------------------
  unsafe { heap.free(first.as_ptr())? };
  println!("\n[2] free({first:?})");
  print_heap("2", &heap);
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 3) The same request lands on the freed block again (first fit).
  // --------------------------------------------------------------------
  let third = heap.alloc(64)?;
  println!(
    "\n[3] alloc(64) = {third:?}, reused the freed block? {}",
    if third == first { "yes" } else { "no" }
  );
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 4) Freeing both neighbours merges them with the free tail.
  // --------------------------------------------------------------------
  unsafe {
    heap.free(third.as_ptr())?;
    heap.free(second.as_ptr())?;
  }
  println!("\n[4] freed everything");
  print_heap("4", &heap);
  block_until_enter_pressed(pause);

  // --------------------------------------------------------------------
  // 5) A request larger than the heap makes it grow.
  // --------------------------------------------------------------------
  let big = heap.alloc(4 * page)?;
  println!("\n[5] alloc({}) = {big:?}", 4 * page);
  print_heap("5", &heap);

  unsafe { heap.free(big.as_ptr())? };
  print_heap("end", &heap);

  Ok(())
}

//! # firstfit - An Explicit Free List Allocator
//!
//! This crate provides a `malloc`/`free` style heap that manages memory
//! obtained from a [`PageSource`] with an explicit, address-ordered free list,
//! first-fit search, block splitting and coalescing.
//!
//! ## Overview
//!
//! ```text
//!   Heap Layout:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                              HEAP                                    │
//!   │                                                                      │
//!   │   ┌─────┬──────┬─────┬───────┬─────┬──────┬──────────────────────┐   │
//!   │   │ hdr │ A1   │ hdr │ free  │ hdr │ A2   │ hdr │  free          │   │
//!   │   └─────┴──────┴─────┴───────┴─────┴──────┴──────────────────────┘   │
//!   │                  ▲                          ▲                        │
//!   │    free_head ────┘  next ───────────────────┘  next ──► NIL          │
//!   │                                                                      │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   Free blocks are linked in address order through their own headers.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   firstfit
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Block header codec (internal layout, constants)
//!   ├── arena      - Extents owned by the heap, addressed by offset (internal)
//!   ├── free_list  - Address-ordered free list (internal)
//!   ├── page       - PageSource trait and the mmap backed MmapSource
//!   ├── heap       - Heap: init, alloc, free, extend, split, coalesce
//!   ├── check      - Heap consistency checker
//!   ├── config     - HeapConfig
//!   └── error      - HeapError
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use firstfit::{Heap, MmapSource};
//!
//! let source = MmapSource::new(1 << 20).unwrap();
//! let mut heap = Heap::init(source).unwrap();
//!
//! let ptr = heap.alloc(64).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 64);
//!     heap.free(ptr.as_ptr()).unwrap();
//! }
//!
//! heap.check_heap().unwrap();
//! ```
//!
//! ## How It Works
//!
//! Each block carries a two word header in front of its payload:
//!
//! ```text
//!   Single Block:
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │         Payload                │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ size | alloc    │  │  ┌──────────────────────────┐  │
//!   │  │ next (if free)  │  │  │     size bytes usable    │  │
//!   │  └─────────────────┘  │  └──────────────────────────┘  │
//!   │      16 bytes         │                                │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user
//! ```
//!
//! `alloc` rounds the request up to [`ALIGNMENT`], takes the first free block
//! that fits and splits off the rest when the rest can hold a header and one
//! alignment unit. When nothing fits, the heap grows by a new extent from its
//! [`PageSource`]. `free` puts the block back on the list in address order and
//! merges it with free neighbours on either side.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: every operation takes `&mut self`
//! - **Never shrinks**: extents are held until the heap is dropped
//! - **Best-effort misuse detection**: double frees and foreign pointers are
//!   reported when visible in the headers, not guaranteed
//!
//! ## Safety
//!
//! Payload pointers are raw memory. Reading and writing them, and handing them
//! back to [`Heap::free`], is `unsafe`.

pub mod align;
mod arena;
mod block;
mod check;
mod config;
mod error;
mod free_list;
mod heap;
mod page;

pub use block::{ALIGNMENT, HEADER_SIZE, MIN_BLOCK_SIZE};
pub use check::{CheckError, HeapReport};
pub use config::HeapConfig;
pub use error::HeapError;
pub use heap::{FreeBlock, Heap, MAX_REQUEST};
pub use page::{Extent, MmapSource, PageSource, SourceError, page_size};

//! Page supply for the heap.
//!
//! The heap never talks to the operating system directly. It asks a
//! [`PageSource`] for raw extents and keeps them for its whole lifetime.

use std::{io, ptr, ptr::NonNull};

use log::debug;

use crate::align::checked_align_to;

/// A run of fresh memory handed out by a [`PageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
  start: NonNull<u8>,
  len: usize,
}

impl Extent {
  /// Describes `len` bytes starting at `start`.
  ///
  /// # Safety
  ///
  /// `start..start + len` must be valid for reads and writes, zeroed, and
  /// owned by nobody else for as long as the receiving heap lives.
  pub const unsafe fn new(
    start: NonNull<u8>,
    len: usize,
  ) -> Self {
    Self { start, len }
  }

  pub const fn start(&self) -> NonNull<u8> {
    self.start
  }

  pub const fn len(&self) -> usize {
    self.len
  }

  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
  #[error("page source exhausted: requested {requested} bytes, {remaining} remaining")]
  Exhausted { requested: usize, remaining: usize },
  #[error("request for {requested} bytes overflows the address space")]
  TooLarge { requested: usize },
  #[error("failed to map {len} bytes")]
  Map {
    len: usize,
    #[source]
    source: io::Error,
  },
}

/// Supplier of zero-initialised memory extents.
///
/// Implementations must only ever return granularity-aligned extents whose
/// length is a multiple of [`granularity`](PageSource::granularity) and which
/// never overlap an extent returned earlier. Extents are never given back.
pub trait PageSource {
  /// Allocation unit of the source, a power of two.
  fn granularity(&self) -> usize;

  /// Hands out at least `min_bytes` fresh bytes.
  fn obtain(
    &mut self,
    min_bytes: usize,
  ) -> Result<Extent, SourceError>;
}

/// Page size of the running system.
pub fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { 4096 } else { size as usize }
}

/// A capped, `sbrk`-like page source.
///
/// Reserves `capacity` bytes of address space with a single anonymous mapping
/// and hands it out front to back, so consecutive extents are contiguous.
/// Once the reservation is used up every request fails with
/// [`SourceError::Exhausted`].
pub struct MmapSource {
  base: NonNull<u8>,
  capacity: usize,
  brk: usize,
  page_size: usize,
}

impl MmapSource {
  pub fn new(capacity: usize) -> Result<Self, SourceError> {
    let page_size = page_size();
    let Some(capacity) = checked_align_to(capacity.max(1), page_size) else {
      return Err(SourceError::TooLarge { requested: capacity });
    };

    let address = unsafe {
      libc::mmap(
        ptr::null_mut(),
        capacity,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      return Err(SourceError::Map {
        len: capacity,
        source: io::Error::last_os_error(),
      });
    }

    let Some(base) = NonNull::new(address.cast::<u8>()) else {
      return Err(SourceError::Map {
        len: capacity,
        source: io::Error::other("mmap returned null"),
      });
    };

    debug!("reserved {capacity} bytes at {base:?}");

    Ok(Self {
      base,
      capacity,
      brk: 0,
      page_size,
    })
  }

  /// Total bytes reserved.
  pub const fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes not yet handed out.
  pub const fn remaining(&self) -> usize {
    self.capacity - self.brk
  }

  /// Current break: the first address not yet handed out.
  pub fn brk(&self) -> *const u8 {
    unsafe { self.base.as_ptr().add(self.brk) }
  }
}

impl PageSource for MmapSource {
  fn granularity(&self) -> usize {
    self.page_size
  }

  fn obtain(
    &mut self,
    min_bytes: usize,
  ) -> Result<Extent, SourceError> {
    let remaining = self.remaining();
    let Some(len) = checked_align_to(min_bytes.max(1), self.page_size) else {
      return Err(SourceError::TooLarge { requested: min_bytes });
    };

    if len > remaining {
      return Err(SourceError::Exhausted {
        requested: len,
        remaining,
      });
    }

    let start = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
    self.brk += len;

    Ok(unsafe { Extent::new(start, len) })
  }
}

impl Drop for MmapSource {
  fn drop(&mut self) {
    unsafe { libc::munmap(self.base.as_ptr().cast(), self.capacity) };
  }
}

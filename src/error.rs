use crate::{check::CheckError, page::SourceError};

/// Errors reported by [`Heap`](crate::Heap).
///
/// Only the exhaustion variants are recoverable: the heap is left untouched
/// and smaller requests may still succeed. Everything else means the caller
/// broke the allocation contract or the heap is corrupted, and the heap must
/// not be used any further.
#[derive(Debug, thiserror::Error)]
pub enum HeapError {
  #[error("request for {requested} bytes exceeds the largest supported allocation")]
  RequestTooLarge { requested: usize },
  #[error("out of memory while allocating {requested} bytes")]
  OutOfMemory {
    requested: usize,
    #[source]
    source: SourceError,
  },
  #[error("page source could not supply the initial heap")]
  Init(#[source] SourceError),
  #[error("{address:#x} was not returned by this heap")]
  InvalidPointer { address: usize },
  #[error("block at {address:#x} is not allocated (double free?)")]
  DoubleFree { address: usize },
  #[error("heap corrupted: {0}")]
  Corrupted(#[from] CheckError),
}

impl HeapError {
  /// Whether the heap is still usable after this error.
  pub const fn is_recoverable(&self) -> bool {
    matches!(self, Self::RequestTooLarge { .. } | Self::OutOfMemory { .. })
  }
}

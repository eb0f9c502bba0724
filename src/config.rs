/// Tuning knobs for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Size of the first extent, in page source granules.
  pub initial_pages: usize,
  /// Upper bound for speculative growth. A single request larger than this
  /// still grows the heap by as much as it needs.
  pub max_growth: usize,
  /// Run the heap checker after every `alloc` and `free`.
  pub verify: bool,
}

impl HeapConfig {
  pub const DEFAULT_INITIAL_PAGES: usize = 2;
  pub const DEFAULT_MAX_GROWTH: usize = 64 * 1024;

  pub const fn new() -> Self {
    Self {
      initial_pages: Self::DEFAULT_INITIAL_PAGES,
      max_growth: Self::DEFAULT_MAX_GROWTH,
      verify: false,
    }
  }

  pub const fn with_initial_pages(
    mut self,
    initial_pages: usize,
  ) -> Self {
    self.initial_pages = initial_pages;
    self
  }

  pub const fn with_max_growth(
    mut self,
    max_growth: usize,
  ) -> Self {
    self.max_growth = max_growth;
    self
  }

  pub const fn with_verify(
    mut self,
    verify: bool,
  ) -> Self {
    self.verify = verify;
    self
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}

/// Rounds a byte count up to the block alignment.
///
/// The alignment is two machine words, the same as the block header.
///
/// # Examples
///
/// ```rust
/// use std::mem;
/// use firstfit::align;
///
/// match mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 16), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::ALIGNMENT)
  };
}

/// Rounds `value` up to a multiple of `to`, which must be a power of two.
///
/// ```rust
/// use firstfit::align_to;
///
/// assert_eq!(align_to!(1, 4096), 4096);
/// assert_eq!(align_to!(8192, 4096), 8192);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $to:expr) => {
    ($value + $to - 1) & !($to - 1)
  };
}

/// Like [`align_to!`], but `None` where the rounded value would overflow.
pub const fn checked_align_to(
  value: usize,
  to: usize,
) -> Option<usize> {
  match value.checked_add(to - 1) {
    Some(padded) => Some(padded & !(to - 1)),
    None => None,
  }
}

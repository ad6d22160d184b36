use core::fmt;

use tinyvec::ArrayVec;

/// Adapter letting `core::fmt::Write` formatting target a fixed-capacity
/// byte buffer.
///
/// Overflow is sticky: once a write doesn't fit, the buffer content is
/// invalid and [`Writable::overflowed`] stays set, so callers check once
/// at the end instead of after every `write!`.
#[derive(Debug)]
pub(crate) struct Writable<'a, A: tinyvec::Array<Item = u8>> {
  buf: &'a mut ArrayVec<A>,
  overflowed: bool,
}

impl<'a, A: tinyvec::Array<Item = u8>> Writable<'a, A> {
  pub(crate) fn new(buf: &'a mut ArrayVec<A>) -> Self {
    Self { buf,
           overflowed: false }
  }

  pub(crate) fn overflowed(&self) -> bool {
    self.overflowed
  }
}

impl<A: tinyvec::Array<Item = u8>> fmt::Write for Writable<'_, A> {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    if self.overflowed || self.buf.len() + s.len() > self.buf.capacity() {
      self.overflowed = true;
      return Err(fmt::Error);
    }
    self.buf.extend_from_slice(s.as_bytes());
    Ok(())
  }
}

#[allow(unused_imports)]
use crate::Token;

/// # Message ID
///
/// 16-bit unsigned integer in network byte order. Used to detect message
/// duplication and to match messages of type Acknowledgement/Reset to
/// messages of type Confirmable/Non-confirmable. The rules for generating a
/// Message ID and matching messages are defined in RFC 7252 section 4.
///
/// For a little more context and the difference between [`Id`] and
/// [`Token`], see [`Token`].
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Debug, Eq, Ord, Default)]
pub struct Id(pub u16);

impl Id {
  /// Create an Id from a big-endian 2-byte unsigned int
  pub fn from_be_bytes(bs: [u8; 2]) -> Self {
    Self(u16::from_be_bytes(bs))
  }

  /// The message id that follows this one, wrapping at `u16::MAX`
  pub fn next(&self) -> Self {
    Self(self.0.wrapping_add(1))
  }
}

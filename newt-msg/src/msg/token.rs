use tinyvec::ArrayVec;

use crate::MAX_TOK_LEN;

/// # Token
///
/// A sequence of 0 to 8 bytes chosen by the client, used to correlate a
/// response with the request it answers. Unlike [`super::Id`] (which pairs
/// an ACK with the specific datagram it acknowledges), the token survives
/// retransmission and separate responses: every reply to a request carries
/// the request's token.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Token(pub ArrayVec<[u8; MAX_TOK_LEN]>);

impl Token {
  /// Build a token from up to 8 bytes; anything longer is truncated
  pub fn from_bytes(bs: &[u8]) -> Self {
    Self(bs.iter().copied().take(MAX_TOK_LEN).collect())
  }

  /// Token content as a byte slice
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}

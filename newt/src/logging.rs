use core::fmt;

use newt_msg::Message;

/// One-line human summary of a message, cheap enough for trace logging
/// on targets without an allocator
pub(crate) struct MsgSummary<'a>(pub &'a Message);

impl fmt::Display for MsgSummary<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let [a, b, c, d] = self.0.code.to_human();
    write!(f,
           "{:?} {}{}{}{} mid={} with {} byte payload",
           self.0.ty,
           a,
           b,
           c,
           d,
           self.0.id.0,
           self.0.payload.0.len())
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Code, Id, Token, Type};

  use super::*;

  #[test]
  fn summary_is_one_line() {
    let msg = Message::new(Type::Con, Code::GET, Id(7), Token::default());
    let s = format!("{}", MsgSummary(&msg));
    assert_eq!(s, "Con 0.01 mid=7 with 0 byte payload");
  }
}

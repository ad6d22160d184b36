/// The Observe option on a request (RFC 7641).
///
/// `0` (register) asks the server to add the sender to the list of
/// observers of the target resource; `1` (deregister) removes it. On
/// notifications the same option instead carries a 24-bit sequence number
/// (see [`seq`]).
#[derive(Hash, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Action {
  /// Add the sender to the resource's observer list
  Register,
  /// Remove the sender from the resource's observer list
  Deregister,
}

impl Action {
  /// Try to parse from an option uint value
  pub fn from_uint(n: u64) -> Option<Self> {
    match n {
      | 0 => Some(Action::Register),
      | 1 => Some(Action::Deregister),
      | _ => None,
    }
  }
}

impl From<Action> for u64 {
  fn from(a: Action) -> Self {
    match a {
      | Action::Register => 0,
      | Action::Deregister => 1,
    }
  }
}

/// Mask a notification sequence number to the 24 bits the Observe option
/// can carry; the counter wraps rather than growing a fourth byte.
pub fn seq(n: u32) -> u32 {
  n & 0x00FF_FFFF
}

use super::ParseError;

/// Indicates if this message is of type Confirmable (0), Non-confirmable
/// (1), Acknowledgement (2), or Reset (3).
///
/// See [RFC7252 - Message Details](https://datatracker.ietf.org/doc/html/rfc7252#section-3) for context
#[derive(Copy, Clone, Hash, Eq, Ord, PartialEq, PartialOrd, Debug)]
pub enum Type {
  /// Some messages do not require an acknowledgement. This is particularly
  /// true for messages that are repeated regularly for application
  /// requirements, such as repeated readings from a sensor.
  Non,
  /// Some messages require an acknowledgement. These messages are called
  /// "Confirmable". When no packets are lost, each Confirmable message
  /// elicits exactly one return message of type Acknowledgement or type
  /// Reset.
  Con,
  /// An Acknowledgement message acknowledges that a specific Confirmable
  /// message arrived. It may also carry a Piggybacked Response.
  Ack,
  /// A Reset message indicates that a specific message (Confirmable or
  /// Non-confirmable) was received, but some context is missing to properly
  /// process it.
  Reset,
}

impl TryFrom<u8> for Type {
  type Error = ParseError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    match b {
      | 0 => Ok(Type::Con),
      | 1 => Ok(Type::Non),
      | 2 => Ok(Type::Ack),
      | 3 => Ok(Type::Reset),
      | _ => Err(ParseError::InvalidType(b)),
    }
  }
}

impl From<Type> for u8 {
  fn from(t: Type) -> u8 {
    match t {
      | Type::Con => 0,
      | Type::Non => 1,
      | Type::Ack => 2,
      | Type::Reset => 3,
    }
  }
}

/// # Code
///
/// The request method or response status of a message, packed in one byte
/// as a 3-bit class and 5-bit detail (`c.dd` in the RFC 7252 notation).
///
/// ```
/// use newt_msg::Code;
///
/// assert_eq!(Code::new(2, 5).to_human().iter().collect::<String>(), "2.05");
/// ```
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Code {
  /// The "class" of message codes identify it as a request or response, and
  /// provides the class of response status:
  ///
  /// |class|meaning|
  /// |---|---|
  /// |`0`|Message is a request|
  /// |`2`|Message is a success response|
  /// |`4`|Message is a client error response|
  /// |`5`|Message is a server error response|
  pub class: u8,

  /// 5-bit integer providing granular information about the response
  /// status. Always `0` for requests.
  pub detail: u8,
}

/// Whether a code is for a request, response, or empty message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
  /// A request code (0.xx)
  Request,
  /// A response code ([2-5].xx)
  Response,
  /// EMPTY (0.00)
  Empty,
}

impl Code {
  /// Create a new Code
  ///
  /// ```
  /// use newt_msg::Code;
  ///
  /// let content = Code::new(2, 05);
  /// ```
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// Get the human string representation of a message code as a `char`
  /// array, avoiding any need for an allocator.
  pub fn to_human(&self) -> [char; 4] {
    let to_char = |d: u8| char::from_digit(d.into(), 10).unwrap_or('?');
    [to_char(self.class),
     '.',
     to_char(self.detail / 10),
     to_char(self.detail % 10)]
  }

  /// Get whether this code is for a request, response, or empty message
  ///
  /// ```
  /// use newt_msg::{Code, CodeKind};
  ///
  /// assert_eq!(Code::new(0, 0).kind(), CodeKind::Empty);
  /// assert_eq!(Code::new(0, 1).kind(), CodeKind::Request);
  /// assert_eq!(Code::new(2, 5).kind(), CodeKind::Response);
  /// ```
  pub fn kind(&self) -> CodeKind {
    match (self.class, self.detail) {
      | (0, 0) => CodeKind::Empty,
      | (0, _) => CodeKind::Request,
      | _ => CodeKind::Response,
    }
  }

  /// Is this a 4.xx or 5.xx response?
  pub fn is_error(&self) -> bool {
    self.class == 4 || self.class == 5
  }

  /// The empty message code, used for ACKs, RSTs, and CoAP ping
  pub const EMPTY: Self = Self::new(0, 0);

  /// Method GET
  pub const GET: Self = Self::new(0, 1);
  /// Method POST
  pub const POST: Self = Self::new(0, 2);
  /// Method PUT
  pub const PUT: Self = Self::new(0, 3);
  /// Method DELETE
  pub const DELETE: Self = Self::new(0, 4);
  /// Method FETCH (RFC 8132), used by composite read & observe
  pub const FETCH: Self = Self::new(0, 5);
  /// Method PATCH (RFC 8132)
  pub const PATCH: Self = Self::new(0, 6);
  /// Method iPATCH (RFC 8132), used by composite write
  pub const IPATCH: Self = Self::new(0, 7);

  /// 2.01 Created
  pub const CREATED: Self = Self::new(2, 1);
  /// 2.02 Deleted
  pub const DELETED: Self = Self::new(2, 2);
  /// 2.03 Valid
  pub const VALID: Self = Self::new(2, 3);
  /// 2.04 Changed
  pub const CHANGED: Self = Self::new(2, 4);
  /// 2.05 Content
  pub const CONTENT: Self = Self::new(2, 5);
  /// 2.31 Continue (RFC 7959)
  pub const CONTINUE: Self = Self::new(2, 31);

  /// 4.00 Bad Request
  pub const BAD_REQUEST: Self = Self::new(4, 0);
  /// 4.01 Unauthorized
  pub const UNAUTHORIZED: Self = Self::new(4, 1);
  /// 4.02 Bad Option
  pub const BAD_OPTION: Self = Self::new(4, 2);
  /// 4.04 Not Found
  pub const NOT_FOUND: Self = Self::new(4, 4);
  /// 4.05 Method Not Allowed
  pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
  /// 4.06 Not Acceptable
  pub const NOT_ACCEPTABLE: Self = Self::new(4, 6);
  /// 4.08 Request Entity Incomplete (RFC 7959)
  pub const REQUEST_ENTITY_INCOMPLETE: Self = Self::new(4, 8);
  /// 4.13 Request Entity Too Large
  pub const REQUEST_ENTITY_TOO_LARGE: Self = Self::new(4, 13);
  /// 4.15 Unsupported Content-Format
  pub const UNSUPPORTED_CONTENT_FORMAT: Self = Self::new(4, 15);

  /// 5.00 Internal Server Error
  pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);
  /// 5.01 Not Implemented
  pub const NOT_IMPLEMENTED: Self = Self::new(5, 1);
  /// 5.03 Service Unavailable
  pub const SERVICE_UNAVAILABLE: Self = Self::new(5, 3);
}

impl From<u8> for Code {
  fn from(b: u8) -> Self {
    Self { class: b >> 5,
           detail: b & 0b11111 }
  }
}

impl From<Code> for u8 {
  fn from(code: Code) -> Self {
    (code.class << 5) | code.detail
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn code_byte_roundtrip() {
    let content = Code::new(2, 5);
    assert_eq!(u8::from(content), 0b0100_0101);
    assert_eq!(Code::from(0b0100_0101u8), content);

    let cont = Code::CONTINUE;
    assert_eq!(Code::from(u8::from(cont)), cont);
  }

  #[test]
  fn kinds() {
    assert_eq!(Code::EMPTY.kind(), CodeKind::Empty);
    assert_eq!(Code::FETCH.kind(), CodeKind::Request);
    assert_eq!(Code::SERVICE_UNAVAILABLE.kind(), CodeKind::Response);
    assert!(Code::BAD_REQUEST.is_error());
    assert!(!Code::CHANGED.is_error());
  }
}

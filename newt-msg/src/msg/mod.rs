use tinyvec::ArrayVec;

use crate::cursor::Cursor;
use crate::{MAX_PAYLOAD, MAX_TOK_LEN};

/// Message Code
pub mod code;

/// Message parsing errors
pub mod parse_error;

/// Message ID
pub mod id;

/// Message Options
pub mod opt;

/// Message Type
pub mod ty;

/// Message Token
pub mod token;

/// Message Version
pub mod ver;

/// Block1 / Block2 option values
pub mod block;

/// Observe option values
pub mod observe;

/// Content-Format option values
pub mod content_format;

/// LwM2M Uri-Query attribute keys
pub mod attr;

pub use block::Block;
pub use code::*;
pub use content_format::ContentFormat;
pub use id::*;
pub use opt::*;
pub use parse_error::*;
pub use token::*;
pub use ty::*;
pub use ver::*;

/// The request/response body of a message (RFC 7252 section 5.5)
#[derive(Default, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(pub ArrayVec<[u8; MAX_PAYLOAD]>);

impl Payload {
  /// Payload content as a byte slice
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Copy `bytes` into a payload, `None` when longer than [`MAX_PAYLOAD`]
  pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
    if bytes.len() > MAX_PAYLOAD {
      return None;
    }
    Some(Self(bytes.iter().copied().collect()))
  }
}

/// Struct representing the first byte of a message.
///
/// ```text
/// CoAP version
/// |
/// |  Message type (request, response, empty)
/// |  |
/// |  |  Length of token, in bytes. (4-bit integer)
/// |  |  |
/// vv vv vvvv
/// 01 00 0000
/// ```
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord)]
struct Byte1 {
  ver: Version,
  ty: Type,
  tkl: u8,
}

impl TryFrom<u8> for Byte1 {
  type Error = ParseError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    let ver = b >> 6;
    let ty = b >> 4 & 0b11;
    let tkl = b & 0b1111;

    if ver != 1 {
      return Err(ParseError::UnsupportedVersion(ver));
    }

    Ok(Byte1 { ver: Version(ver),
               ty: Type::try_from(ty)?,
               tkl })
  }
}

impl From<Byte1> for u8 {
  fn from(b: Byte1) -> u8 {
    (b.ver.0 << 6) | (u8::from(b.ty) << 4) | b.tkl
  }
}

/// # CoAP Messages
///
/// A CoAP message very close to the actual byte layout, with fixed-capacity
/// storage throughout (see the crate docs for the capacity constants).
///
/// ## Constructing
/// [`Message::new`] is the most straightforward way to initialize messages;
/// all fields are public for struct-literal initialization too.
///
/// ```
/// use newt_msg::{Code, Id, Message, Token, Type};
///
/// let mut req = Message::new(Type::Con, Code::GET, Id(1), Token::from_bytes(&[1]));
/// req.set_path("3/0/2").unwrap();
/// ```
///
/// ## Wire conversion
/// [`Message::try_from_bytes`] and [`Message::try_into_bytes`] convert to
/// and from the RFC 7252 byte layout; both are total over their error
/// enums and never panic on hostile input.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Message {
  /// see [`Id`] for details
  pub id: Id,
  /// see [`Type`] for details
  pub ty: Type,
  /// see [`Version`] for details
  pub ver: Version,
  /// see [`Token`] for details
  pub token: Token,
  /// see [`Code`] for details
  pub code: Code,
  /// see [`Opts`] for details
  pub opts: Opts,
  /// see [`Payload`]
  pub payload: Payload,
}

impl Message {
  /// Create a new message
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { id,
           token,
           ty,
           code,
           ver: Version::default(),
           payload: Payload::default(),
           opts: Opts::default() }
  }

  /// Create the Empty-ACK that acknowledges this message.
  ///
  /// Carries this message's [`Id`] and no token; a piggybacked response is
  /// built with [`Message::new`] instead, echoing both id and token.
  pub fn ack(&self) -> Self {
    Self::new(Type::Ack, Code::EMPTY, self.id, Token::default())
  }

  /// Create the Reset that rejects this message
  pub fn rst(&self) -> Self {
    Self::new(Type::Reset, Code::EMPTY, self.id, Token::default())
  }

  /// Parse a message from the bytes of one datagram
  pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
    let mut bytes = Cursor::new(bytes);

    let Byte1 { tkl, ty, ver } = bytes.next()
                                      .ok_or_else(ParseError::eof)?
                                      .try_into()?;

    if tkl > MAX_TOK_LEN as u8 {
      return Err(ParseError::InvalidTokenLength(tkl));
    }

    let code: Code = bytes.next().ok_or_else(ParseError::eof)?.into();
    let id = match bytes.take_exact(2) {
      | Some(&[a, b]) => Id::from_be_bytes([a, b]),
      | _ => return Err(ParseError::eof()),
    };

    let token = bytes.take_exact(tkl as usize)
                     .map(Token::from_bytes)
                     .ok_or_else(ParseError::eof)?;

    let opts = Opts::try_consume_bytes(&mut bytes)?;

    let rest = bytes.take_until_end();
    let payload = Payload::try_from_slice(rest).ok_or(ParseError::PayloadTooLong(rest.len()))?;

    Ok(Message { id,
                 ty,
                 ver,
                 code,
                 token,
                 opts,
                 payload })
  }

  /// Serialize into `buf`, yielding the number of bytes written
  pub fn try_into_bytes(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
    // max delta expressible with the 14-nibble two-byte extension
    const MAX_DELTA: u32 = 269 + u16::MAX as u32;

    let mut prev = 0u32;
    for o in self.opts.iter() {
      if o.number.0 - prev > MAX_DELTA {
        return Err(EncodeError::OptionsOverflow);
      }
      prev = o.number.0;
    }

    let size = self.wire_size();
    if buf.len() < size {
      return Err(EncodeError::TooSmall { capacity: buf.len(),
                                         size });
    }

    let mut ix = 0usize;
    let mut put = |buf: &mut [u8], bs: &[u8]| {
      buf[ix..ix + bs.len()].copy_from_slice(bs);
      ix += bs.len();
    };

    let byte1: u8 = Byte1 { tkl: self.token.0.len() as u8,
                            ver: self.ver,
                            ty: self.ty }.into();
    put(buf, &[byte1, self.code.into()]);
    put(buf, &self.id.0.to_be_bytes());
    put(buf, &self.token.0);

    let mut prev = 0u32;
    for o in self.opts.iter() {
      let (delta_nib, delta_ext) = opt::ext_split(o.number.0 - prev);
      let (len_nib, len_ext) = opt::ext_split(o.value.0.len() as u32);
      prev = o.number.0;

      put(buf, &[(delta_nib << 4) | len_nib]);
      put(buf, &delta_ext);
      put(buf, &len_ext);
      put(buf, &o.value.0);
    }

    if !self.payload.0.is_empty() {
      put(buf, &[0xFF]);
      put(buf, &self.payload.0);
    }

    Ok(ix)
  }

  /// Bytes this message occupies on the wire
  pub fn wire_size(&self) -> usize {
    let header = 4;
    let token = self.token.0.len();
    let opts = self.opts.wire_size();
    let payload = match self.payload.0.len() {
      | 0 => 0,
      | n => n + 1,
    };

    header + token + opts + payload
  }
}

/// Typed accessors for the options the LwM2M layer manipulates.
impl Message {
  /// Replace Uri-Path with `path`, one option instance per `/`-separated
  /// segment
  pub fn set_path(&mut self, path: &str) -> Result<(), SetError> {
    self.opts.remove(known::repeat::PATH);
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .try_for_each(|seg| {
          let v = OptValue::try_from_slice(seg.as_bytes()).ok_or(SetError::ValueTooLong)?;
          self.opts.add(known::repeat::PATH, v)
        })
  }

  /// Append one Uri-Path segment
  pub fn add_path_segment(&mut self, seg: &str) -> Result<(), SetError> {
    let v = OptValue::try_from_slice(seg.as_bytes()).ok_or(SetError::ValueTooLong)?;
    self.opts.add(known::repeat::PATH, v)
  }

  /// Uri-Path segments, in order
  pub fn path_segments(&self) -> impl Iterator<Item = &str> {
    self.opts
        .values(known::repeat::PATH)
        .filter_map(OptValue::as_str)
  }

  /// Append one Uri-Query value
  pub fn add_query(&mut self, query: &str) -> Result<(), SetError> {
    let v = OptValue::try_from_slice(query.as_bytes()).ok_or(SetError::ValueTooLong)?;
    self.opts.add(known::repeat::QUERY, v)
  }

  /// Uri-Query values, in order
  pub fn queries(&self) -> impl Iterator<Item = &str> {
    self.opts
        .values(known::repeat::QUERY)
        .filter_map(OptValue::as_str)
  }

  /// Location-Path segments of a response, in order
  pub fn location_paths(&self) -> impl Iterator<Item = &str> {
    self.opts
        .values(known::repeat::LOCATION_PATH)
        .filter_map(OptValue::as_str)
  }

  /// Content-Format
  pub fn content_format(&self) -> Option<ContentFormat> {
    self.get_uint(known::no_repeat::CONTENT_FORMAT)
        .map(|n| ContentFormat::from(n as u16))
  }

  /// Set Content-Format, discarding any existing value
  pub fn set_content_format(&mut self, format: ContentFormat) -> Result<(), SetError> {
    self.set_uint(known::no_repeat::CONTENT_FORMAT,
                  u16::from(&format) as u64)
  }

  /// Accept
  pub fn accept(&self) -> Option<ContentFormat> {
    self.get_uint(known::no_repeat::ACCEPT)
        .map(|n| ContentFormat::from(n as u16))
  }

  /// Set Accept, discarding any existing value
  pub fn set_accept(&mut self, format: ContentFormat) -> Result<(), SetError> {
    self.set_uint(known::no_repeat::ACCEPT, u16::from(&format) as u64)
  }

  /// Raw Observe value: a register/deregister action on requests, a
  /// sequence number on notifications
  pub fn observe(&self) -> Option<u32> {
    self.get_uint(known::no_repeat::OBSERVE).map(|n| n as u32)
  }

  /// Set Observe, discarding any existing value
  pub fn set_observe(&mut self, value: u32) -> Result<(), SetError> {
    self.set_uint(known::no_repeat::OBSERVE, observe::seq(value) as u64)
  }

  /// Block1
  pub fn block1(&self) -> Option<Block> {
    self.get_uint(known::no_repeat::BLOCK1)
        .map(|n| Block::from(n as u32))
  }

  /// Set Block1, discarding any existing value
  pub fn set_block1(&mut self, size: u16, num: u32, more: bool) -> Result<(), SetError> {
    self.set_uint(known::no_repeat::BLOCK1,
                  u32::from(Block::new(size, num, more)) as u64)
  }

  /// Block2
  pub fn block2(&self) -> Option<Block> {
    self.get_uint(known::no_repeat::BLOCK2)
        .map(|n| Block::from(n as u32))
  }

  /// Set Block2, discarding any existing value
  pub fn set_block2(&mut self, size: u16, num: u32, more: bool) -> Result<(), SetError> {
    self.set_uint(known::no_repeat::BLOCK2,
                  u32::from(Block::new(size, num, more)) as u64)
  }

  /// Read any option as a variable-length big-endian unsigned int
  pub fn get_uint(&self, number: OptNumber) -> Option<u64> {
    self.opts.get_first(number).and_then(OptValue::as_uint)
  }

  /// Write any option as a minimal-length big-endian unsigned int
  pub fn set_uint(&mut self, number: OptNumber, value: u64) -> Result<(), SetError> {
    self.opts.set(number, OptValue::from_uint(value))
  }

  /// Add one option instance
  pub fn add(&mut self, number: OptNumber, value: OptValue) -> Result<(), SetError> {
    self.opts.add(number, value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_msg() {
    let (expect, bytes) = crate::test_msg();
    assert_eq!(Message::try_from_bytes(&bytes).unwrap(), expect);
  }

  #[test]
  fn encode_msg() {
    let (msg, expect) = crate::test_msg();
    let mut buf = [0u8; 1280];
    let n = msg.try_into_bytes(&mut buf).unwrap();
    assert_eq!(&buf[..n], &expect[..]);
  }

  #[test]
  fn roundtrip() {
    let mut msg = Message::new(Type::Con,
                               Code::POST,
                               Id(7),
                               Token::from_bytes(&[1, 2, 3, 4]));
    msg.set_path("rd").unwrap();
    msg.add_query("ep=device-1").unwrap();
    msg.add_query("lt=150").unwrap();
    msg.set_content_format(ContentFormat::LinkFormat).unwrap();
    msg.payload = Payload::try_from_slice(b"</3/0>,</1/0>").unwrap();

    let mut buf = [0u8; 256];
    let n = msg.try_into_bytes(&mut buf).unwrap();
    let parsed = Message::try_from_bytes(&buf[..n]).unwrap();

    assert_eq!(parsed, msg);
    assert_eq!(parsed.wire_size(), n);
  }

  #[test]
  fn parse_byte1() {
    let byte = 0b_01_10_0011u8;
    let byte = Byte1::try_from(byte).unwrap();
    assert_eq!(byte,
               Byte1 { ver: Version(1),
                       ty: Type::Ack,
                       tkl: 3 });
  }

  #[test]
  fn rejects_bad_version() {
    // version bits 00
    let bytes = [0b0000_0001, 0x45, 0, 1, 254];
    assert_eq!(Message::try_from_bytes(&bytes),
               Err(ParseError::UnsupportedVersion(0)));
  }

  #[test]
  fn rejects_long_token() {
    let bytes = [0b0100_1001, 0x45, 0, 1];
    assert_eq!(Message::try_from_bytes(&bytes),
               Err(ParseError::InvalidTokenLength(9)));
  }

  #[test]
  fn ack_echoes_id_only() {
    let mut req = Message::new(Type::Con, Code::GET, Id(44), Token::from_bytes(&[9]));
    req.set_path("3/0/2").unwrap();

    let ack = req.ack();
    assert_eq!(ack.id, Id(44));
    assert_eq!(ack.ty, Type::Ack);
    assert_eq!(ack.code, Code::EMPTY);
    assert_eq!(ack.token.0.len(), 0);
  }

  #[test]
  fn no_payload_marker_when_empty() {
    let msg = Message::new(Type::Con, Code::CHANGED, Id(0), Token::default());
    let mut buf = [0u8; 16];
    let n = msg.try_into_bytes(&mut buf).unwrap();
    assert_eq!(n, 4);
    assert_ne!(buf[n - 1], 0xFF);
  }

  #[test]
  fn too_small_buffer() {
    let mut msg = Message::new(Type::Con, Code::GET, Id(0), Token::default());
    msg.payload = Payload::try_from_slice(&[0; 64]).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(msg.try_into_bytes(&mut buf),
               Err(EncodeError::TooSmall { capacity: 8,
                                           size: 69 }));
  }

  #[test]
  fn query_attr_roundtrip() {
    let mut msg = Message::new(Type::Con, Code::POST, Id(1), Token::default());
    msg.add_query("ep=n").unwrap();
    msg.add_query("Q").unwrap();

    let attrs: Vec<_> = msg.queries().filter_map(attr::parse).collect();
    assert_eq!(attrs,
               vec![(attr::Key::Ep, "n"), (attr::Key::Queue, "")]);
  }
}

//! Low-level representation of CoAP messages for the `newt` LwM2M client.
//!
//! The most notable item in `newt_msg` is [`Message`]: a CoAP message very
//! close to the actual byte layout, together with the option machinery the
//! LwM2M protocol layer needs (Uri-Path / Uri-Query, Observe, Block1/Block2,
//! Content-Format, Location-Path, ETag) and the LwM2M attribute query keys
//! (`ep`, `lt`, `pmin`, ...).
//!
//! ## Allocation
//! Every dynamically-sized attribute of a message (payload, option values,
//! option count, token) is stored in a fixed-capacity [`tinyvec::ArrayVec`],
//! so this crate never touches an allocator. The capacities are compile-time
//! constants ([`MAX_OPTS`], [`MAX_OPT_LEN`], [`MAX_PAYLOAD`]) sized for a
//! single UDP datagram on constrained links; a message that would exceed
//! them is a parse or encode error, never a reallocation.
//!
//! ## Wire format
//! Parsing and serialization implement RFC 7252 section 3 (base header,
//! token, option deltas with the 13/14/15 nibble extensions, `0xFF` payload
//! marker) plus the option value layouts of RFC 7959 (Block) and RFC 7641
//! (Observe).

// x-release-please-start-version
#![doc(html_root_url = "https://docs.rs/newt-msg/0.3.2")]
// x-release-please-end
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(not(test), forbid(missing_debug_implementations, unreachable_pub))]
#![cfg_attr(not(test), deny(unsafe_code, missing_copy_implementations))]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
#![deny(missing_docs)]

#[doc(hidden)]
pub mod cursor;

/// Message structs
pub mod msg;

#[doc(inline)]
pub use msg::*;

/// Maximum number of options one message may carry.
///
/// A datagram with more options than this fails to parse with
/// [`ParseError::TooManyOptions`]; the receiving side is expected to drop
/// the request silently.
pub const MAX_OPTS: usize = 16;

/// Maximum length in bytes of a single option value.
pub const MAX_OPT_LEN: usize = 64;

/// Maximum payload bytes one message may carry.
///
/// Sized to the conventional CoAP upper bound for a single UDP datagram;
/// larger representations travel block-wise.
pub const MAX_PAYLOAD: usize = 1152;

/// Maximum token length, fixed by RFC 7252 section 3.
pub const MAX_TOK_LEN: usize = 8;

#[cfg(test)]
pub(crate) fn test_msg() -> (Message, std::vec::Vec<u8>) {
  let header: [u8; 4] = 0b0100_0001_0100_0101_0000_0000_0000_0001_u32.to_be_bytes();
  let token: [u8; 1] = [254u8];
  let content_format: &[u8] = b"application/json";
  let options: [&[u8]; 2] = [&[0b1100_1101, 0x03], content_format];
  let payload: [&[u8]; 2] = [&[0b1111_1111], b"hello, world!"];

  let bytes: std::vec::Vec<u8> = [header.as_ref(), token.as_ref()].into_iter()
                                                                  .chain(options)
                                                                  .chain(payload)
                                                                  .flatten()
                                                                  .copied()
                                                                  .collect();

  let mut msg = Message::new(Type::Con,
                             Code::new(2, 5),
                             Id(1),
                             Token::from_bytes(&[254u8]));
  msg.add(OptNumber(12), content_format.iter().copied().collect())
     .unwrap();
  msg.payload = Payload(b"hello, world!".iter().copied().collect());

  (msg, bytes)
}

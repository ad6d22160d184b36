//! Payload codec seam.
//!
//! The concrete multi-entry codecs (SenML-CBOR, LwM2M-CBOR, TLV, ...) are
//! pluggable externals supplied by the host through
//! [`crate::client::App::codec`]; the engine itself ships only the
//! [`PlainText`] codec it needs for single-value exchanges. Everything
//! crossing this seam is a `(path, value)` pair.

use core::fmt::Write;

use newt_msg::{ContentFormat, Payload};

use crate::dm::{Chunk, DmError, Value};
use crate::path::Path;
use crate::writable::Writable;

/// Errors crossing the codec seam
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
  /// The output buffer is full
  NoSpace,
  /// The payload is not valid for this format
  Malformed,
  /// The format cannot express what was asked of it (e.g. several
  /// entries in a single-value format)
  Unsupported,
  /// The visitor refused an entry
  Dm(DmError),
}

/// One content format's encoder/decoder.
///
/// Encoding is streamed: `begin_encode`, one `encode_entry` per
/// `(path, value)` pair, `end_encode`. Decoding visits each entry the
/// payload holds.
pub trait PayloadCodec {
  /// The format this codec implements
  fn format(&self) -> ContentFormat;

  /// Start encoding a body of up to `item_hint` entries under `base`
  fn begin_encode(&mut self, base: Path, item_hint: usize, out: &mut Payload)
                  -> Result<(), CodecError>;

  /// Encode one entry
  fn encode_entry(&mut self,
                  path: Path,
                  value: &Value<'_>,
                  out: &mut Payload)
                  -> Result<(), CodecError>;

  /// Finish the body
  fn end_encode(&mut self, out: &mut Payload) -> Result<(), CodecError>;

  /// Visit every `(path, value)` entry in `payload`
  fn decode(&mut self,
            base: Path,
            payload: &[u8],
            emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
            -> Result<(), CodecError>;
}

/// `text/plain`: one scalar value, formatted as its decimal / literal
/// representation. Writes deliver the raw text to the resource handler,
/// which owns the conversion to its declared type.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainText;

impl PayloadCodec for PlainText {
  fn format(&self) -> ContentFormat {
    ContentFormat::Text
  }

  fn begin_encode(&mut self,
                  _base: Path,
                  item_hint: usize,
                  _out: &mut Payload)
                  -> Result<(), CodecError> {
    if item_hint > 1 {
      return Err(CodecError::Unsupported);
    }
    Ok(())
  }

  fn encode_entry(&mut self,
                  _path: Path,
                  value: &Value<'_>,
                  out: &mut Payload)
                  -> Result<(), CodecError> {
    let mut w = Writable::new(&mut out.0);
    match *value {
      | Value::Int(n) => write!(w, "{}", n).ok(),
      | Value::Uint(n) => write!(w, "{}", n).ok(),
      | Value::Float(f) => write!(w, "{}", f).ok(),
      | Value::Bool(b) => write!(w, "{}", if b { 1 } else { 0 }).ok(),
      | Value::Time(t) => write!(w, "{}", t).ok(),
      | Value::Objlnk { oid, iid } => write!(w, "{}:{}", oid, iid).ok(),
      | Value::Text(Chunk { data, .. }) | Value::Opaque(Chunk { data, .. }) => {
        if out.0.len() + data.len() > out.0.capacity() {
          return Err(CodecError::NoSpace);
        }
        out.0.extend_from_slice(data);
        return Ok(());
      },
      | Value::Null => return Err(CodecError::Unsupported),
    };

    if w.overflowed() {
      return Err(CodecError::NoSpace);
    }
    Ok(())
  }

  fn end_encode(&mut self, _out: &mut Payload) -> Result<(), CodecError> {
    Ok(())
  }

  fn decode(&mut self,
            base: Path,
            payload: &[u8],
            emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
            -> Result<(), CodecError> {
    if base.len() < 3 {
      return Err(CodecError::Unsupported);
    }
    if core::str::from_utf8(payload).is_err() {
      return Err(CodecError::Malformed);
    }
    emit(base, Value::Text(Chunk::whole(payload))).map_err(CodecError::Dm)
  }
}

/// Pick the content format for an outbound body.
///
/// The server's Accept wins when we can honor it; otherwise, for
/// multi-entry bodies the engine prefers LwM2M-CBOR, then the rest of the
/// host's codecs in fixed preference order, and for single values it
/// falls back to plain text.
pub fn choose(accept: Option<ContentFormat>,
              multi: bool,
              have: &mut dyn FnMut(ContentFormat) -> bool)
              -> Option<ContentFormat> {
  match accept {
    | Some(f) => {
      if (f == ContentFormat::Text && !multi) || have(f) {
        Some(f)
      } else {
        None
      }
    },
    | None if multi => [ContentFormat::Lwm2mCbor,
                        ContentFormat::SenmlCbor,
                        ContentFormat::Lwm2mTlv,
                        ContentFormat::SenmlJson].into_iter()
                                                 .find(|f| have(*f)),
    | None => Some(ContentFormat::Text),
  }
}

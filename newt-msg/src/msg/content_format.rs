/// Content-Format option values, covering the core CoAP registrations plus
/// the LwM2M media types.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentFormat {
  /// `text/plain; charset=utf-8`
  Text,
  /// `application/link-format`
  LinkFormat,
  /// `application/octet-stream`
  OctetStream,
  /// `application/cbor`
  Cbor,
  /// `application/senml+json`
  SenmlJson,
  /// `application/senml+cbor`
  SenmlCbor,
  /// `application/vnd.oma.lwm2m+tlv`
  Lwm2mTlv,
  /// `application/vnd.oma.lwm2m+json`
  Lwm2mJson,
  /// `application/vnd.oma.lwm2m+cbor`
  Lwm2mCbor,
  /// Another content format
  Other(u16),
}

impl ContentFormat {
  /// Convert this content format to the CoAP option byte value
  pub fn bytes(&self) -> [u8; 2] {
    u16::from(self).to_be_bytes()
  }

  /// Can this format carry more than one `(path, value)` entry?
  pub fn is_multi_entry(&self) -> bool {
    matches!(self,
             ContentFormat::SenmlJson
             | ContentFormat::SenmlCbor
             | ContentFormat::Lwm2mTlv
             | ContentFormat::Lwm2mJson
             | ContentFormat::Lwm2mCbor)
  }
}

impl<'a> From<&'a ContentFormat> for u16 {
  fn from(f: &'a ContentFormat) -> Self {
    use ContentFormat::*;
    match *f {
      | Text => 0,
      | LinkFormat => 40,
      | OctetStream => 42,
      | Cbor => 60,
      | SenmlJson => 110,
      | SenmlCbor => 112,
      | Lwm2mTlv => 11542,
      | Lwm2mJson => 11543,
      | Lwm2mCbor => 11544,
      | Other(n) => n,
    }
  }
}

impl From<u16> for ContentFormat {
  fn from(n: u16) -> Self {
    use ContentFormat::*;
    match n {
      | 0 => Text,
      | 40 => LinkFormat,
      | 42 => OctetStream,
      | 60 => Cbor,
      | 110 => SenmlJson,
      | 112 => SenmlCbor,
      | 11542 => Lwm2mTlv,
      | 11543 => Lwm2mJson,
      | 11544 => Lwm2mCbor,
      | n => Other(n),
    }
  }
}

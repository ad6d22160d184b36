macro_rules! opt {
  (#[doc = $doc:expr] $name:ident = $n:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: crate::OptNumber = crate::OptNumber($n);
  };
}

pub(crate) use opt;

/// Non-repeatable options
pub mod no_repeat {
  use super::opt;

  opt!(#[doc = "If-None-Match (RFC7252 5.10.8.2)"]
       IF_NONE_MATCH = 5);
  opt!(#[doc = "Observe (RFC7641 2): 0 = register, 1 = deregister on \
                requests; a 24-bit sequence number on notifications"]
       OBSERVE = 6);
  opt!(#[doc = "Content-Format (RFC7252 5.10.3)"]
       CONTENT_FORMAT = 12);
  opt!(#[doc = "Max-Age (RFC7252 5.10.5)"]
       MAX_AGE = 14);
  opt!(#[doc = "Accept (RFC7252 5.10.4)"]
       ACCEPT = 17);
  opt!(#[doc = "Block2 (RFC7959 2.2): response payload fragmentation"]
       BLOCK2 = 23);
  opt!(#[doc = "Block1 (RFC7959 2.2): request payload fragmentation"]
       BLOCK1 = 27);
  opt!(#[doc = "Size2 (RFC7959 4)"]
       SIZE2 = 28);
  opt!(#[doc = "Size1 (RFC7252 5.10.9)"]
       SIZE1 = 60);
}

/// Repeatable options
pub mod repeat {
  use super::opt;

  opt!(#[doc = "If-Match (RFC7252 5.10.8.1)"]
       IF_MATCH = 1);
  opt!(#[doc = "ETag (RFC7252 5.10.6)"]
       ETAG = 4);
  opt!(#[doc = "Location-Path (RFC7252 5.10.7)"]
       LOCATION_PATH = 8);
  opt!(#[doc = "Uri-Path (RFC7252 5.10.1)"]
       PATH = 11);
  opt!(#[doc = "Uri-Query (RFC7252 5.10.1)"]
       QUERY = 15);
  opt!(#[doc = "Location-Query (RFC7252 5.10.7)"]
       LOCATION_QUERY = 20);
}

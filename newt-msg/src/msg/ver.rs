/// Version of the CoAP protocol that the message adheres to.
///
/// Right now, this will always be 1; a datagram carrying any other version
/// fails to parse ([`super::ParseError::UnsupportedVersion`]).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Version(pub u8);

impl Default for Version {
  fn default() -> Self {
    Version(1)
  }
}

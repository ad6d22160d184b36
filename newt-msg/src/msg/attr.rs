//! The Uri-Query keys LwM2M layers on top of CoAP.
//!
//! Registration-interface queries (`ep`, `lt`, `b`, `Q`, `lwm2m`, `pct`)
//! and Write-Attributes / notification attributes (`pmin`, `pmax`, `gt`,
//! `lt`, `st`, `epmin`, `epmax`) share one namespace; `lt` is lifetime on
//! the registration interface and less-than on the information-reporting
//! interface, so the parsed key carries no interpretation.

/// A recognized query key
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Key {
  /// Endpoint client name
  Ep,
  /// Lifetime (registration) or less-than (write-attributes)
  Lt,
  /// Binding
  Binding,
  /// Queue mode (LwM2M 1.2 `Q`)
  Queue,
  /// Enabler version (`lwm2m`)
  Version,
  /// Preferred content format for bootstrap (`pct`)
  Pct,
  Pmin,
  Pmax,
  Gt,
  St,
  Epmin,
  Epmax,
}

impl Key {
  /// The key's spelling on the wire
  pub fn as_str(&self) -> &'static str {
    match self {
      | Key::Ep => "ep",
      | Key::Lt => "lt",
      | Key::Binding => "b",
      | Key::Queue => "Q",
      | Key::Version => "lwm2m",
      | Key::Pct => "pct",
      | Key::Pmin => "pmin",
      | Key::Pmax => "pmax",
      | Key::Gt => "gt",
      | Key::St => "st",
      | Key::Epmin => "epmin",
      | Key::Epmax => "epmax",
    }
  }

  fn from_str(s: &str) -> Option<Self> {
    match s {
      | "ep" => Some(Key::Ep),
      | "lt" => Some(Key::Lt),
      | "b" => Some(Key::Binding),
      | "Q" => Some(Key::Queue),
      | "lwm2m" => Some(Key::Version),
      | "pct" => Some(Key::Pct),
      | "pmin" => Some(Key::Pmin),
      | "pmax" => Some(Key::Pmax),
      | "gt" => Some(Key::Gt),
      | "st" => Some(Key::St),
      | "epmin" => Some(Key::Epmin),
      | "epmax" => Some(Key::Epmax),
      | _ => None,
    }
  }
}

/// Split one Uri-Query value into a recognized key and its (possibly
/// empty) value. Unrecognized keys yield `None` and are ignored by the
/// protocol layer (they are all elective in spirit; the option itself was
/// already accepted).
pub fn parse(query: &str) -> Option<(Key, &str)> {
  match query.split_once('=') {
    | Some((k, v)) => Key::from_str(k).map(|k| (k, v)),
    | None => Key::from_str(query).map(|k| (k, "")),
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn parse_key_value() {
    assert_eq!(parse("ep=urn:imei:123"), Some((Key::Ep, "urn:imei:123")));
    assert_eq!(parse("lt=86400"), Some((Key::Lt, "86400")));
    assert_eq!(parse("pmin=5"), Some((Key::Pmin, "5")));
    assert_eq!(parse("lwm2m=1.2"), Some((Key::Version, "1.2")));
  }

  #[test]
  fn parse_flag() {
    assert_eq!(parse("Q"), Some((Key::Queue, "")));
  }

  #[test]
  fn parse_unknown() {
    assert_eq!(parse("zzz=1"), None);
  }
}

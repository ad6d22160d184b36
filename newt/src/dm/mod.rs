use newt_msg::Code;

use crate::path::Path;

mod dispatch;

pub use dispatch::{execute, iterate, iterate_paths, read_value, DmOp, Dispatcher};

/// Errors a data-model operation can produce, each with a fixed mapping
/// onto the CoAP response code the server sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DmError {
  /// The addressed entity does not exist → 4.04
  NotFound,
  /// The server may not touch this entity (e.g. Security outside
  /// bootstrap) → 4.01
  Unauthorized,
  /// The payload or arguments are malformed → 4.00
  BadRequest,
  /// The entity exists but does not support the operation → 4.05
  MethodNotAllowed,
  /// The handler does not implement this operation → 5.01
  NotImplemented,
  /// A fixed-capacity structure is full → 5.00
  Memory,
  /// Handler bug or invariant violation → 5.00
  Internal,
}

impl DmError {
  /// The CoAP response code reported to the server
  pub fn code(&self) -> Code {
    match self {
      | DmError::NotFound => Code::NOT_FOUND,
      | DmError::Unauthorized => Code::UNAUTHORIZED,
      | DmError::BadRequest => Code::BAD_REQUEST,
      | DmError::MethodNotAllowed => Code::METHOD_NOT_ALLOWED,
      | DmError::NotImplemented => Code::NOT_IMPLEMENTED,
      | DmError::Memory | DmError::Internal => Code::INTERNAL_SERVER_ERROR,
    }
  }
}

/// A piece of a string or opaque resource value in transit.
///
/// Writes of large values arrive either as one whole-value chunk or as a
/// monotonically increasing sequence of partial chunks; handlers must
/// accept both. The final chunk of a sequence satisfies
/// [`Chunk::is_last`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
  /// The bytes of this piece
  pub data: &'a [u8],
  /// Where this piece begins within the whole value
  pub offset: usize,
  /// Total value length, when the writer knows it up front
  pub full_len: Option<usize>,
}

impl<'a> Chunk<'a> {
  /// A chunk carrying the whole value at once
  pub fn whole(data: &'a [u8]) -> Self {
    Self { data,
           offset: 0,
           full_len: Some(data.len()) }
  }

  /// Is this the final chunk of its value?
  pub fn is_last(&self) -> bool {
    match self.full_len {
      | Some(l) => l > 0 && self.offset + self.data.len() == l || l == 0,
      | None => false,
    }
  }
}

/// A typed resource value crossing the handler boundary, in either
/// direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
  /// Signed integer
  Int(i64),
  /// Unsigned integer
  Uint(u64),
  /// Floating point
  Float(f64),
  /// Boolean
  Bool(bool),
  /// Object link
  Objlnk {
    #[allow(missing_docs)]
    oid: u16,
    #[allow(missing_docs)]
    iid: u16,
  },
  /// Seconds since the unix epoch
  Time(i64),
  /// UTF-8 text, possibly chunked
  Text(Chunk<'a>),
  /// Opaque bytes, possibly chunked
  Opaque(Chunk<'a>),
  /// No value: deletes a resource instance in a composite write
  Null,
}

impl Value<'_> {
  /// The value as a float, for `gt`/`lt`/`st` attribute evaluation
  pub fn numeric(&self) -> Option<f64> {
    match *self {
      | Value::Int(n) => Some(n as f64),
      | Value::Uint(n) => Some(n as f64),
      | Value::Float(f) => Some(f),
      | Value::Time(t) => Some(t as f64),
      | Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
      | _ => None,
    }
  }
}

/// What a resource supports: read, write, execute, and whether it is
/// multi-instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ResourceKind {
  /// Single-instance, readable
  #[default]
  R,
  /// Single-instance, writable
  W,
  /// Single-instance, readable and writable
  Rw,
  /// Executable
  E,
  /// Multi-instance, readable
  Rm,
  /// Multi-instance, writable
  Wm,
  /// Multi-instance, readable and writable
  Rwm,
}

impl ResourceKind {
  #[allow(missing_docs)]
  pub fn is_readable(&self) -> bool {
    matches!(self, Self::R | Self::Rw | Self::Rm | Self::Rwm)
  }

  #[allow(missing_docs)]
  pub fn is_writable(&self) -> bool {
    matches!(self, Self::W | Self::Rw | Self::Wm | Self::Rwm)
  }

  #[allow(missing_docs)]
  pub fn is_multi(&self) -> bool {
    matches!(self, Self::Rm | Self::Wm | Self::Rwm)
  }

  #[allow(missing_docs)]
  pub fn is_executable(&self) -> bool {
    matches!(self, Self::E)
  }
}

/// One resource an instance presents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceDef {
  #[allow(missing_docs)]
  pub rid: u16,
  #[allow(missing_docs)]
  pub kind: ResourceKind,
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
  /// Commit staged data
  Success,
  /// Discard staged data
  Failure,
}

/// The handler vtable one LwM2M object implements.
///
/// Objects live in application storage for the lifetime of the
/// application; the engine holds no reference to them between `step()`
/// calls and addresses them through [`DataModel`] lookups only.
///
/// Invariant: [`Object::instance_ids`] visits ids in strictly ascending
/// order.
pub trait Object {
  /// The object id this handler serves
  fn oid(&self) -> u16;

  /// Object version advertised in the registration payload, e.g. "1.1"
  fn version(&self) -> Option<&str> {
    None
  }

  /// Visit every instance id, ascending
  fn instance_ids(&self, visit: &mut dyn FnMut(u16));

  /// Visit every resource the instance presents
  fn resource_defs(&self, iid: u16, visit: &mut dyn FnMut(ResourceDef)) -> Result<(), DmError>;

  /// Visit every instance id of a multi-instance resource, ascending
  fn resource_instance_ids(&self,
                           _iid: u16,
                           _rid: u16,
                           _visit: &mut dyn FnMut(u16))
                           -> Result<(), DmError> {
    Ok(())
  }

  /// Called once per transaction before any mutation of this object
  fn transaction_begin(&mut self) -> Result<(), DmError> {
    Ok(())
  }

  /// Verify staged data is consistent; an error rolls the transaction
  /// back
  fn transaction_validate(&mut self) -> Result<(), DmError> {
    Ok(())
  }

  /// Commit or discard staged data
  fn transaction_end(&mut self, _result: TxResult) {}

  /// Create an (empty) instance with the given id
  fn instance_create(&mut self, _iid: u16) -> Result<(), DmError> {
    Err(DmError::MethodNotAllowed)
  }

  /// Remove an instance
  fn instance_remove(&mut self, _iid: u16) -> Result<(), DmError> {
    Err(DmError::MethodNotAllowed)
  }

  /// Reset an instance's resources to their defaults; the write-replace
  /// entry point. Mandatory for writable objects.
  fn instance_reset(&mut self, _iid: u16) -> Result<(), DmError> {
    Err(DmError::MethodNotAllowed)
  }

  /// Produce the value(s) at a resource or resource-instance path by
  /// calling `emit` for each.
  ///
  /// A read of a multi-instance resource path emits one value per
  /// resource instance, at the resource-instance path.
  fn resource_read(&self,
                   path: Path,
                   emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
                   -> Result<(), DmError>;

  /// Apply one value at a resource or resource-instance path.
  ///
  /// Multi-instance semantics: a write to an absent resource-instance id
  /// inserts it; a write to a present one overwrites it.
  fn resource_write(&mut self, path: Path, value: Value<'_>) -> Result<(), DmError>;

  /// Run an executable resource
  fn resource_execute(&mut self, _iid: u16, _rid: u16, _arg: &[u8]) -> Result<(), DmError> {
    Err(DmError::MethodNotAllowed)
  }

  /// Remove one instance of a multi-instance resource
  fn resource_instance_remove(&mut self, _iid: u16, _rid: u16, _riid: u16) -> Result<(), DmError> {
    Err(DmError::MethodNotAllowed)
  }
}

/// Lookup and iteration over the application's installed objects.
///
/// The engine re-borrows the data model on every `step()` call rather
/// than owning object references, so ownership stays tree-shaped: the
/// host owns the objects, the engine owns only ids.
pub trait DataModel {
  /// The oid of the `ix`-th installed object, `None` past the end
  fn oid_at(&mut self, ix: usize) -> Option<u16>;

  /// Look up an object by oid
  fn object(&mut self, oid: u16) -> Option<&mut dyn Object>;
}

/// [`DataModel`] over a plain slice of object handlers.
///
/// ```ignore
/// let mut objs: [&mut dyn Object; 2] = [&mut server, &mut device];
/// let mut dm = Registry::new(&mut objs);
/// client.step(&mut app_with(&mut dm))?;
/// ```
#[derive(Debug)]
pub struct Registry<'s, 'o> {
  objs: &'s mut [&'o mut (dyn Object + 'o)],
}

impl<'s, 'o> Registry<'s, 'o> {
  #[allow(missing_docs)]
  pub fn new(objs: &'s mut [&'o mut (dyn Object + 'o)]) -> Self {
    Self { objs }
  }
}

impl core::fmt::Debug for dyn Object + '_ {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "Object({})", self.oid())
  }
}

impl DataModel for Registry<'_, '_> {
  fn oid_at(&mut self, ix: usize) -> Option<u16> {
    self.objs.get(ix).map(|o| o.oid())
  }

  fn object(&mut self, oid: u16) -> Option<&mut dyn Object> {
    self.objs
        .iter_mut()
        .find(|o| o.oid() == oid)
        .map(|o| &mut **o as &mut dyn Object)
  }
}

/// Does `obj` currently have an instance `iid`?
pub fn has_instance(obj: &dyn Object, iid: u16) -> bool {
  let mut found = false;
  obj.instance_ids(&mut |i| found |= i == iid);
  found
}

/// The kind of resource `rid` within instance `iid`, if declared
pub fn resource_kind(obj: &dyn Object, iid: u16, rid: u16) -> Option<ResourceKind> {
  let mut kind = None;
  obj.resource_defs(iid, &mut |def| {
       if def.rid == rid {
         kind = Some(def.kind);
       }
     })
     .ok()?;
  kind
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_last() {
    assert!(Chunk::whole(b"abc").is_last());
    assert!(Chunk::whole(b"").is_last());

    let first = Chunk { data: b"ab",
                        offset: 0,
                        full_len: Some(4) };
    let last = Chunk { data: b"cd",
                       offset: 2,
                       full_len: Some(4) };
    let unknown = Chunk { data: b"ab",
                          offset: 0,
                          full_len: None };
    assert!(!first.is_last());
    assert!(last.is_last());
    assert!(!unknown.is_last());
  }

  #[test]
  fn numeric_values() {
    assert_eq!(Value::Int(-3).numeric(), Some(-3.0));
    assert_eq!(Value::Bool(true).numeric(), Some(1.0));
    assert_eq!(Value::Text(Chunk::whole(b"x")).numeric(), None);
    assert_eq!(Value::Null.numeric(), None);
  }

  #[test]
  fn kind_predicates() {
    assert!(ResourceKind::Rwm.is_multi());
    assert!(ResourceKind::Rwm.is_readable());
    assert!(ResourceKind::Rwm.is_writable());
    assert!(!ResourceKind::E.is_readable());
    assert!(ResourceKind::E.is_executable());
    assert!(!ResourceKind::R.is_writable());
  }

  #[test]
  fn registry_lookup() {
    use crate::test::TestObject;

    let mut a = TestObject::new(3);
    let mut b = TestObject::new(1);
    let mut objs: [&mut dyn Object; 2] = [&mut a, &mut b];
    let mut reg = Registry::new(&mut objs);

    assert_eq!(reg.oid_at(0), Some(3));
    assert_eq!(reg.oid_at(1), Some(1));
    assert_eq!(reg.oid_at(2), None);
    assert_eq!(reg.object(1).map(|o| o.oid()), Some(1));
    assert!(reg.object(99).is_none());
  }
}

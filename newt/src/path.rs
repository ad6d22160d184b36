use core::fmt;

/// The id value reserved to mean "no id here"
pub const INVALID_ID: u16 = 0xFFFF;

/// An LwM2M path: up to four 16-bit ids naming the root, an object, an
/// object instance, a resource, or a resource instance.
///
/// Paths are small `Copy` values, not references into anything; unused
/// trailing components hold [`INVALID_ID`].
///
/// ```
/// use newt::path::Path;
///
/// let res = Path::resource(3, 0, 2);
/// assert_eq!(res.oid(), Some(3));
/// assert_eq!(res.riid(), None);
/// assert!(res.starts_with(&Path::object(3)));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path {
  ids: [u16; 4],
  len: u8,
}

impl Path {
  /// The root path `/`
  pub const fn root() -> Self {
    Self { ids: [INVALID_ID; 4],
           len: 0 }
  }

  /// `/oid`
  pub const fn object(oid: u16) -> Self {
    Self { ids: [oid, INVALID_ID, INVALID_ID, INVALID_ID],
           len: 1 }
  }

  /// `/oid/iid`
  pub const fn instance(oid: u16, iid: u16) -> Self {
    Self { ids: [oid, iid, INVALID_ID, INVALID_ID],
           len: 2 }
  }

  /// `/oid/iid/rid`
  pub const fn resource(oid: u16, iid: u16, rid: u16) -> Self {
    Self { ids: [oid, iid, rid, INVALID_ID],
           len: 3 }
  }

  /// `/oid/iid/rid/riid`
  pub const fn resource_instance(oid: u16, iid: u16, rid: u16, riid: u16) -> Self {
    Self { ids: [oid, iid, rid, riid],
           len: 4 }
  }

  /// Number of components (0 for root, 4 for a resource instance)
  pub fn len(&self) -> usize {
    self.len as usize
  }

  /// Is this the root path?
  pub fn is_root(&self) -> bool {
    self.len == 0
  }

  #[allow(missing_docs)]
  pub fn oid(&self) -> Option<u16> {
    self.get(0)
  }

  #[allow(missing_docs)]
  pub fn iid(&self) -> Option<u16> {
    self.get(1)
  }

  #[allow(missing_docs)]
  pub fn rid(&self) -> Option<u16> {
    self.get(2)
  }

  #[allow(missing_docs)]
  pub fn riid(&self) -> Option<u16> {
    self.get(3)
  }

  fn get(&self, ix: usize) -> Option<u16> {
    if ix < self.len as usize {
      Some(self.ids[ix])
    } else {
      None
    }
  }

  /// The path one level up; root's parent is root
  pub fn parent(&self) -> Path {
    let mut p = *self;
    if p.len > 0 {
      p.len -= 1;
      p.ids[p.len as usize] = INVALID_ID;
    }
    p
  }

  /// Extend with one more component; `None` when already 4 deep or `id`
  /// is the reserved value
  pub fn join(&self, id: u16) -> Option<Path> {
    if self.len == 4 || id == INVALID_ID {
      return None;
    }
    let mut p = *self;
    p.ids[p.len as usize] = id;
    p.len += 1;
    Some(p)
  }

  /// Is `prefix` an ancestor-or-self of this path?
  pub fn starts_with(&self, prefix: &Path) -> bool {
    prefix.len <= self.len && self.ids[..prefix.len as usize] == prefix.ids[..prefix.len as usize]
  }

  /// Parse from Uri-Path segments (e.g. the option values of an inbound
  /// request). Yields `None` for a non-numeric segment, a component out
  /// of range, or more than four components.
  pub fn from_segments<'a>(segments: impl Iterator<Item = &'a str>) -> Option<Path> {
    let mut path = Path::root();
    for seg in segments {
      let id: u16 = seg.parse().ok()?;
      path = path.join(id)?;
    }
    Some(path)
  }

  /// Components, in order
  pub fn ids(&self) -> &[u16] {
    &self.ids[..self.len as usize]
  }
}

impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_root() {
      return write!(f, "/");
    }
    for id in self.ids() {
      write!(f, "/{}", id)?;
    }
    Ok(())
  }
}

impl fmt::Debug for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Path({})", self)
  }
}

//! CoRE-Link (`application/link-format`) payload writers.
//!
//! The engine emits link-format in two places: the Register/Update payload
//! describing the data model, and Discover responses (with notification
//! attributes attached). Both write into a caller-provided fixed buffer
//! and fail with [`Error::Memory`] rather than truncate.

use core::fmt::Write;

use tinyvec::ArrayVec;

use crate::dm::{self, DataModel};
use crate::error::Error;
use crate::observe::Attributes;
use crate::path::Path;
use crate::writable::Writable;

/// Objects never shown to a management server in registration or
/// discover payloads
fn is_hidden(oid: u16) -> bool {
  // Security (0) and OSCORE (21) are bootstrap-only territory
  oid == 0 || oid == 21
}

/// Write the registration payload: one link per object (with `ver` when
/// the object declares one) and one per object instance.
pub fn write_registration<A: tinyvec::Array<Item = u8>>(dm: &mut dyn DataModel,
                                                        out: &mut ArrayVec<A>)
                                                        -> Result<(), Error> {
  let mut w = Writable::new(out);
  let mut first = true;

  let mut ix = 0;
  while let Some(oid) = dm.oid_at(ix) {
    ix += 1;
    if is_hidden(oid) {
      continue;
    }

    let sep = |first: &mut bool| {
      let s = if *first { "" } else { "," };
      *first = false;
      s
    };

    let obj = dm.object(oid).ok_or(Error::Internal)?;
    match obj.version() {
      | Some(ver) => {
        let s = sep(&mut first);
        write!(w, "{}</{}>;ver={}", s, oid, ver).ok();
      },
      | None => {
        let mut any_instance = false;
        obj.instance_ids(&mut |_| any_instance = true);
        if !any_instance {
          let s = sep(&mut first);
          write!(w, "{}</{}>", s, oid).ok();
        }
      },
    }

    let mut iids = ArrayVec::<[u16; 32]>::new();
    obj.instance_ids(&mut |iid| {
         if !iids.is_full() {
           iids.push(iid);
         }
       });
    for iid in iids {
      let s = sep(&mut first);
      write!(w, "{}</{}/{}>", s, oid, iid).ok();
    }
  }

  if w.overflowed() {
    return Err(Error::Memory);
  }
  Ok(())
}

/// Write a Discover payload for `base`: every path under it, with the
/// stored notification attributes for paths that have them.
pub fn write_discover<A: tinyvec::Array<Item = u8>>(dm: &mut dyn DataModel,
                                                    base: Path,
                                                    attrs_of: &mut dyn FnMut(Path) -> Attributes,
                                                    out: &mut ArrayVec<A>)
                                                    -> Result<(), Error> {
  let mut paths = ArrayVec::<[Path; 64]>::new();
  dm::iterate_paths(dm, base, &mut |p| {
      if !paths.is_full() {
        paths.push(p);
      }
    }).map_err(Error::Dm)?;

  let mut w = Writable::new(out);
  let mut first = true;
  for p in paths {
    if p.oid().map(is_hidden).unwrap_or(false) {
      continue;
    }
    if !first {
      write!(w, ",").ok();
    }
    first = false;
    write!(w, "<{}>", p).ok();
    write_attrs(&mut w, &attrs_of(p));
  }

  if w.overflowed() {
    return Err(Error::Memory);
  }
  Ok(())
}

fn write_attrs<A: tinyvec::Array<Item = u8>>(w: &mut Writable<'_, A>, attrs: &Attributes) {
  if let Some(pmin) = attrs.pmin {
    write!(w, ";pmin={}", pmin).ok();
  }
  if let Some(pmax) = attrs.pmax {
    write!(w, ";pmax={}", pmax).ok();
  }
  if let Some(gt) = attrs.gt {
    write!(w, ";gt={}", gt).ok();
  }
  if let Some(lt) = attrs.lt {
    write!(w, ";lt={}", lt).ok();
  }
  if let Some(st) = attrs.st {
    write!(w, ";st={}", st).ok();
  }
  if let Some(epmin) = attrs.epmin {
    write!(w, ";epmin={}", epmin).ok();
  }
  if let Some(epmax) = attrs.epmax {
    write!(w, ";epmax={}", epmax).ok();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dm::{Object, Registry};
  use crate::test::TestObject;

  #[test]
  fn registration_payload_lists_objects_and_instances() {
    let mut dev = TestObject::new(3);
    dev.add_instance(0);
    let mut srv = TestObject::new(1);
    srv.add_instance(0);
    let mut custom = TestObject::new(9900);
    custom.version = Some("2.0");
    custom.add_instance(0);
    custom.add_instance(4);

    let mut objs: [&mut dyn Object; 3] = [&mut srv, &mut dev, &mut custom];
    let mut reg = Registry::new(&mut objs);

    let mut out = ArrayVec::<[u8; 256]>::new();
    write_registration(&mut reg, &mut out).unwrap();

    assert_eq!(core::str::from_utf8(&out).unwrap(),
               "</1/0>,</3/0>,</9900>;ver=2.0,</9900/0>,</9900/4>");
  }

  #[test]
  fn registration_payload_hides_security() {
    let mut sec = TestObject::new(0);
    sec.add_instance(0);
    let mut srv = TestObject::new(1);
    srv.add_instance(0);

    let mut objs: [&mut dyn Object; 2] = [&mut sec, &mut srv];
    let mut reg = Registry::new(&mut objs);

    let mut out = ArrayVec::<[u8; 128]>::new();
    write_registration(&mut reg, &mut out).unwrap();
    assert_eq!(core::str::from_utf8(&out).unwrap(), "</1/0>");
  }

  #[test]
  fn registration_payload_overflow_is_memory() {
    let mut dev = TestObject::new(3);
    dev.add_instance(0);
    let mut objs: [&mut dyn Object; 1] = [&mut dev];
    let mut reg = Registry::new(&mut objs);

    let mut out = ArrayVec::<[u8; 4]>::new();
    assert_eq!(write_registration(&mut reg, &mut out), Err(Error::Memory));
  }

  #[test]
  fn discover_payload_includes_attributes() {
    let mut dev = TestObject::new(3);
    dev.add_instance(0);
    let mut objs: [&mut dyn Object; 1] = [&mut dev];
    let mut reg = Registry::new(&mut objs);

    let observed = Path::resource(3, 0, 1);
    let mut out = ArrayVec::<[u8; 512]>::new();
    write_discover(&mut reg,
                   Path::resource(3, 0, 1),
                   &mut |p| {
                     let mut a = Attributes::default();
                     if p == observed {
                       a.pmin = Some(10);
                       a.pmax = Some(60);
                     }
                     a
                   },
                   &mut out).unwrap();

    assert_eq!(core::str::from_utf8(&out).unwrap(), "</3/0/1>;pmin=10;pmax=60");
  }
}

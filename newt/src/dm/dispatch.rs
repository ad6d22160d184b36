use tinyvec::ArrayVec;

use super::{has_instance, resource_kind, DataModel, DmError, Object, TxResult, Value};
use crate::config::cap;
use crate::error::Error;
use crate::path::Path;

/// The operations the data model can be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmOp {
  /// Read a subtree's values
  Read,
  /// List a subtree's structure
  Discover,
  /// Write, replacing the whole target first
  WriteReplace,
  /// Write, leaving untouched fields alone
  WritePartial,
  /// Composite write across objects
  WriteComp,
  /// Create an object instance
  Create,
  /// Delete an object instance
  Delete,
  /// Run an executable resource
  Execute,
  /// Composite read across objects
  ReadComp,
}

impl DmOp {
  fn is_write(&self) -> bool {
    matches!(self,
             DmOp::WriteReplace | DmOp::WritePartial | DmOp::WriteComp | DmOp::Create)
  }
}

#[derive(Debug)]
struct Txn {
  op: DmOp,
  bootstrap: bool,
  base: Path,
  touched: ArrayVec<[u16; cap::MAX_OBJECTS]>,
}

/// Transactional front door to the data model.
///
/// One operation runs at a time: [`Dispatcher::begin`] opens it,
/// [`Dispatcher::write_entry`] / [`Dispatcher::create_instance`] feed it,
/// [`Dispatcher::validate`] checks it, [`Dispatcher::end`] commits or
/// rolls it back. `transaction_begin` is called on each object the first
/// time the operation touches it, and `transaction_end` exactly once per
/// touched object when the operation ends.
#[derive(Debug, Default)]
pub struct Dispatcher {
  txn: Option<Txn>,
}

impl Dispatcher {
  /// Open an operation against `base`.
  ///
  /// Re-entrant `begin` is a usage bug and fails with [`Error::Logic`];
  /// data-model-level failures come back as [`Error::NotImplemented`]
  /// etc. via [`DmError`] mapping at the call sites that answer the
  /// server.
  pub fn begin(&mut self,
               dm: &mut dyn DataModel,
               op: DmOp,
               bootstrap: bool,
               base: Path)
               -> Result<(), Error> {
    if self.txn.is_some() {
      return Err(Error::Logic);
    }

    self.txn = Some(Txn { op,
                          bootstrap,
                          base,
                          touched: ArrayVec::new() });

    match self.begin_inner(dm, op, bootstrap, base) {
      | Ok(()) => Ok(()),
      | Err(e) => {
        // the operation never starts; unwind whatever was touched
        self.end(dm, false).ok();
        Err(Error::Dm(e))
      },
    }
  }

  fn begin_inner(&mut self,
                 dm: &mut dyn DataModel,
                 op: DmOp,
                 bootstrap: bool,
                 base: Path)
                 -> Result<(), DmError> {
    match op {
      | DmOp::WriteReplace if base.len() == 2 => {
        let (oid, iid) = (base.oid().unwrap_or_default(), base.iid().unwrap_or_default());
        self.touch(dm, oid)?;
        let obj = dm.object(oid).ok_or(DmError::NotFound)?;
        if !has_instance(obj, iid) {
          if !bootstrap {
            return Err(DmError::NotFound);
          }
          obj.instance_create(iid)?;
        }
        obj.instance_reset(iid)
      },
      | DmOp::WriteReplace if base.len() == 3 => {
        let oid = base.oid().unwrap_or_default();
        let iid = base.iid().unwrap_or_default();
        let rid = base.rid().unwrap_or_default();
        self.touch(dm, oid)?;
        let obj = dm.object(oid).ok_or(DmError::NotFound)?;
        match resource_kind(&*obj, iid, rid) {
          | Some(k) if k.is_multi() => clear_resource_instances(obj, iid, rid),
          | Some(_) => Ok(()),
          | None => {
            if bootstrap {
              Ok(())
            } else {
              Err(DmError::NotFound)
            }
          },
        }
      },
      | DmOp::Delete => self.begin_delete(dm, bootstrap, base),
      | _ => Ok(()),
    }
  }

  fn begin_delete(&mut self,
                  dm: &mut dyn DataModel,
                  bootstrap: bool,
                  base: Path)
                  -> Result<(), DmError> {
    match base.len() {
      | 2 => {
        let (oid, iid) = (base.oid().unwrap_or_default(), base.iid().unwrap_or_default());
        self.touch(dm, oid)?;
        let obj = dm.object(oid).ok_or(DmError::NotFound)?;
        if !has_instance(obj, iid) {
          return Err(DmError::NotFound);
        }
        obj.instance_remove(iid)
      },
      // bootstrap delete may sweep an object or the whole model
      | 0 | 1 if bootstrap => {
        let mut ix = 0;
        while let Some(oid) = dm.oid_at(ix) {
          ix += 1;
          if let Some(base_oid) = base.oid() {
            if base_oid != oid {
              continue;
            }
          }
          self.touch(dm, oid)?;
          let obj = dm.object(oid).ok_or(DmError::Internal)?;
          clear_instances(obj)?;
        }
        Ok(())
      },
      | _ => Err(DmError::MethodNotAllowed),
    }
  }

  /// Apply one `(path, value)` entry of the open write operation
  pub fn write_entry(&mut self,
                     dm: &mut dyn DataModel,
                     path: Path,
                     value: Value<'_>)
                     -> Result<(), DmError> {
    let (op, bootstrap, base) = match &self.txn {
      | Some(t) if t.op.is_write() => (t.op, t.bootstrap, t.base),
      | Some(_) | None => return Err(DmError::Internal),
    };

    if path.len() < 3 || !path.starts_with(&base) {
      return Err(DmError::BadRequest);
    }

    let oid = path.oid().unwrap_or_default();
    let iid = path.iid().unwrap_or_default();
    self.touch(dm, oid)?;

    let obj = dm.object(oid).ok_or(DmError::NotFound)?;

    if !has_instance(&*obj, iid) {
      if !bootstrap {
        return Err(DmError::NotFound);
      }
      obj.instance_create(iid)?;
    }

    if let Value::Null = value {
      // a Null entry deletes a resource instance; at resource level it is
      // malformed (LwM2M write-composite rules)
      return match path.riid() {
        | Some(riid) => obj.resource_instance_remove(iid, path.rid().unwrap_or_default(), riid),
        | None => Err(DmError::BadRequest),
      };
    }

    match obj.resource_write(path, value) {
      // a write addressed above resource level tolerates unknown optional
      // resources; bootstrap writes always do
      | Err(DmError::NotFound) if bootstrap || base.len() <= 2 => Ok(()),
      | other => other,
    }
  }

  /// Create an instance within the open `Create` operation; an `iid` of
  /// [`crate::path::INVALID_ID`] picks the lowest free id. Yields the id
  /// used.
  pub fn create_instance(&mut self,
                         dm: &mut dyn DataModel,
                         oid: u16,
                         iid: u16)
                         -> Result<u16, DmError> {
    match &self.txn {
      | Some(t) if t.op.is_write() => (),
      | _ => return Err(DmError::Internal),
    }

    self.touch(dm, oid)?;
    let obj = dm.object(oid).ok_or(DmError::NotFound)?;

    let iid = if iid == crate::path::INVALID_ID {
      lowest_free_iid(&*obj)
    } else {
      iid
    };

    obj.instance_create(iid)?;
    Ok(iid)
  }

  /// Ask every touched object to validate its staged data
  pub fn validate(&mut self, dm: &mut dyn DataModel) -> Result<(), DmError> {
    let touched = match &self.txn {
      | Some(t) => t.touched.clone(),
      | None => return Err(DmError::Internal),
    };

    for oid in touched {
      dm.object(oid)
        .ok_or(DmError::Internal)?
        .transaction_validate()?;
    }
    Ok(())
  }

  /// Close the operation, committing on `success` and rolling back
  /// otherwise
  pub fn end(&mut self, dm: &mut dyn DataModel, success: bool) -> Result<(), DmError> {
    let txn = self.txn.take().ok_or(DmError::Internal)?;
    let result = if success {
      TxResult::Success
    } else {
      TxResult::Failure
    };

    for oid in txn.touched {
      if let Some(obj) = dm.object(oid) {
        obj.transaction_end(result);
      }
    }
    Ok(())
  }

  /// Is an operation currently open?
  pub fn in_progress(&self) -> bool {
    self.txn.is_some()
  }

  fn touch(&mut self, dm: &mut dyn DataModel, oid: u16) -> Result<(), DmError> {
    let txn = self.txn.as_mut().ok_or(DmError::Internal)?;
    if txn.touched.contains(&oid) {
      return Ok(());
    }
    if txn.touched.len() == cap::MAX_OBJECTS {
      return Err(DmError::Memory);
    }

    dm.object(oid)
      .ok_or(DmError::NotFound)?
      .transaction_begin()?;
    txn.touched.push(oid);
    Ok(())
  }
}

/// Run an executable resource; not transactional.
pub fn execute(dm: &mut dyn DataModel, path: Path, arg: &[u8]) -> Result<(), DmError> {
  if path.len() != 3 {
    return Err(DmError::MethodNotAllowed);
  }

  let obj = dm.object(path.oid().unwrap_or_default())
              .ok_or(DmError::NotFound)?;
  let (iid, rid) = (path.iid().unwrap_or_default(), path.rid().unwrap_or_default());

  if !has_instance(&*obj, iid) {
    return Err(DmError::NotFound);
  }
  match resource_kind(&*obj, iid, rid) {
    | Some(k) if k.is_executable() => obj.resource_execute(iid, rid, arg),
    | Some(_) => Err(DmError::MethodNotAllowed),
    | None => Err(DmError::NotFound),
  }
}

/// Read the value(s) at a resource or resource-instance path
pub fn read_value(dm: &mut dyn DataModel,
                  path: Path,
                  emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
                  -> Result<(), DmError> {
  if path.len() < 3 {
    return Err(DmError::BadRequest);
  }

  let obj = dm.object(path.oid().unwrap_or_default())
              .ok_or(DmError::NotFound)?;
  if !has_instance(&*obj, path.iid().unwrap_or_default()) {
    return Err(DmError::NotFound);
  }
  obj.resource_read(path, emit)
}

/// Read every readable value under `base`, emitting `(path, value)` pairs
/// in data-model order. Absent optional resources are skipped.
pub fn iterate(dm: &mut dyn DataModel,
               base: Path,
               emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
               -> Result<(), DmError> {
  match base.len() {
    | 0 => {
      let mut ix = 0;
      while let Some(oid) = dm.oid_at(ix) {
        ix += 1;
        iterate(dm, Path::object(oid), emit)?;
      }
      Ok(())
    },
    | 1 => {
      let oid = base.oid().unwrap_or_default();
      let obj = dm.object(oid).ok_or(DmError::NotFound)?;
      let iids = collect_instances(&*obj);
      for iid in iids {
        iterate(dm, Path::instance(oid, iid), emit)?;
      }
      Ok(())
    },
    | 2 => {
      let oid = base.oid().unwrap_or_default();
      let iid = base.iid().unwrap_or_default();
      let obj = dm.object(oid).ok_or(DmError::NotFound)?;
      if !has_instance(&*obj, iid) {
        return Err(DmError::NotFound);
      }

      let mut defs = ArrayVec::<[super::ResourceDef; 32]>::new();
      obj.resource_defs(iid, &mut |d| {
           if !defs.is_full() {
             defs.push(d);
           }
         })?;

      for def in defs {
        if !def.kind.is_readable() {
          continue;
        }
        match obj.resource_read(Path::resource(oid, iid, def.rid), emit) {
          | Err(DmError::NotFound) => (),
          | other => other?,
        }
      }
      Ok(())
    },
    | _ => read_value(dm, base, emit),
  }
}

/// Visit every path under `base` that exists in the data model: objects,
/// instances, and resources (not resource instances). Used for Discover
/// and registration payloads.
pub fn iterate_paths(dm: &mut dyn DataModel,
                     base: Path,
                     emit: &mut dyn FnMut(Path))
                     -> Result<(), DmError> {
  match base.len() {
    | 0 => {
      let mut ix = 0;
      while let Some(oid) = dm.oid_at(ix) {
        ix += 1;
        iterate_paths(dm, Path::object(oid), emit)?;
      }
      Ok(())
    },
    | 1 => {
      let oid = base.oid().unwrap_or_default();
      let obj = dm.object(oid).ok_or(DmError::NotFound)?;
      emit(base);
      let iids = collect_instances(&*obj);
      for iid in iids {
        iterate_paths(dm, Path::instance(oid, iid), emit)?;
      }
      Ok(())
    },
    | 2 => {
      let oid = base.oid().unwrap_or_default();
      let iid = base.iid().unwrap_or_default();
      let obj = dm.object(oid).ok_or(DmError::NotFound)?;
      if !has_instance(&*obj, iid) {
        return Err(DmError::NotFound);
      }
      emit(base);
      obj.resource_defs(iid, &mut |d| {
           if let Some(p) = base.join(d.rid) {
             emit(p);
           }
         })
    },
    | _ => {
      emit(base);
      Ok(())
    },
  }
}

fn collect_instances(obj: &dyn Object) -> ArrayVec<[u16; 32]> {
  let mut iids = ArrayVec::new();
  obj.instance_ids(&mut |iid| {
       if !iids.is_full() {
         iids.push(iid);
       }
     });
  iids
}

fn lowest_free_iid(obj: &dyn Object) -> u16 {
  // instance ids are ascending, so the first gap is the answer
  let mut free = 0u16;
  obj.instance_ids(&mut |iid| {
       if iid == free {
         free += 1;
       }
     });
  free
}

fn clear_instances(obj: &mut dyn Object) -> Result<(), DmError> {
  loop {
    let mut first = None;
    obj.instance_ids(&mut |iid| {
         if first.is_none() {
           first = Some(iid);
         }
       });
    match first {
      | Some(iid) => obj.instance_remove(iid)?,
      | None => return Ok(()),
    }
  }
}

/// Remove all instances of a multi-instance resource, lowest riid first
fn clear_resource_instances(obj: &mut dyn Object, iid: u16, rid: u16) -> Result<(), DmError> {
  loop {
    let mut first = None;
    obj.resource_instance_ids(iid, rid, &mut |riid| {
         if first.is_none() {
           first = Some(riid);
         }
       })?;
    match first {
      | Some(riid) => obj.resource_instance_remove(iid, rid, riid)?,
      | None => return Ok(()),
    }
  }
}

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use embedded_time::rate::Fraction;
use embedded_time::Instant;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use newt_msg::{ContentFormat, Payload};

use crate::codec::{CodecError, PayloadCodec};
use crate::dm::{Chunk, DmError, Object, ResourceDef, ResourceKind, TxResult, Value};
use crate::net::{Socket, Transport};
use crate::path::Path;
use crate::writable::Writable;

pub(crate) fn seeded_rng() -> ChaCha8Rng {
  rng_from(42)
}

pub(crate) fn rng_from(seed: u64) -> ChaCha8Rng {
  ChaCha8Rng::seed_from_u64(seed)
}

/// A clock the test scripts by hand, in milliseconds
#[derive(Debug, Clone, Default)]
pub(crate) struct ClockMock(pub Rc<Cell<u64>>);

impl ClockMock {
  pub fn new() -> Self {
    Self(Rc::new(Cell::new(0)))
  }

  pub fn set(&self, ms: u64) {
    self.0.set(ms);
  }

  pub fn advance(&self, ms: u64) {
    self.0.set(self.0.get() + ms);
  }

  pub fn instant(ms: u64) -> Instant<Self> {
    Instant::new(ms)
  }
}

impl embedded_time::Clock for ClockMock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

  fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
    Ok(Instant::new(self.0.get()))
  }
}

/// Shared handles into a [`SockMock`] owned by the engine under test
#[derive(Debug, Clone)]
pub(crate) struct SockHandle {
  /// Datagrams the test injects for the engine to receive
  pub rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
  /// Datagrams the engine sent
  pub tx: Rc<RefCell<Vec<Vec<u8>>>>,
  pub closes: Rc<Cell<u32>>,
  pub reuses: Rc<Cell<u32>>,
}

impl SockHandle {
  pub fn push_rx(&self, bytes: &[u8]) {
    self.rx.borrow_mut().push_back(bytes.to_vec());
  }

  pub fn take_tx(&self) -> Vec<Vec<u8>> {
    core::mem::take(&mut *self.tx.borrow_mut())
  }
}

/// A mocked socket: everything sent lands in `tx`, everything in `rx`
/// is received in order
#[derive(Debug)]
pub(crate) struct SockMock {
  rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
  tx: Rc<RefCell<Vec<Vec<u8>>>>,
  closes: Rc<Cell<u32>>,
  reuses: Rc<Cell<u32>>,
  connected: bool,
  mtu: usize,
}

impl SockMock {
  pub fn new(mtu: usize) -> (Self, SockHandle) {
    let sock = Self { rx: Rc::new(RefCell::new(VecDeque::new())),
                      tx: Rc::new(RefCell::new(Vec::new())),
                      closes: Rc::new(Cell::new(0)),
                      reuses: Rc::new(Cell::new(0)),
                      connected: false,
                      mtu };
    let handle = SockHandle { rx: sock.rx.clone(),
                              tx: sock.tx.clone(),
                              closes: sock.closes.clone(),
                              reuses: sock.reuses.clone() };
    (sock, handle)
  }
}

impl Socket for SockMock {
  type Error = ();

  fn connect(&mut self, _addr: no_std_net::SocketAddr) -> nb::Result<(), ()> {
    self.connected = true;
    Ok(())
  }

  fn send(&mut self, msg: &[u8]) -> nb::Result<usize, ()> {
    self.tx.borrow_mut().push(msg.to_vec());
    Ok(msg.len())
  }

  fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, ()> {
    match self.rx.borrow_mut().pop_front() {
      | Some(dgram) => {
        let n = dgram.len().min(buf.len());
        buf[..n].copy_from_slice(&dgram[..n]);
        Ok(n)
      },
      | None => Err(nb::Error::WouldBlock),
    }
  }

  fn close(&mut self) -> nb::Result<(), ()> {
    self.connected = false;
    self.closes.set(self.closes.get() + 1);
    Ok(())
  }

  fn inner_mtu(&self) -> usize {
    self.mtu
  }

  fn reuse_last_port(&mut self) -> Result<(), ()> {
    self.reuses.set(self.reuses.get() + 1);
    Ok(())
  }

  fn transport(&self) -> Transport {
    Transport::Udp
  }
}

/// A toy multi-entry codec standing in for SenML-CBOR in tests: entries
/// are `<path>=<int>` joined by `;`, and a bare `<path>` decodes with a
/// Null value (the shape composite-read path lists arrive in).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TestCodec;

impl PayloadCodec for TestCodec {
  fn format(&self) -> ContentFormat {
    ContentFormat::SenmlCbor
  }

  fn begin_encode(&mut self,
                  _base: Path,
                  _item_hint: usize,
                  _out: &mut Payload)
                  -> Result<(), CodecError> {
    Ok(())
  }

  fn encode_entry(&mut self,
                  path: Path,
                  value: &Value<'_>,
                  out: &mut Payload)
                  -> Result<(), CodecError> {
    use core::fmt::Write;

    let n = match *value {
      | Value::Int(n) => n,
      | Value::Uint(n) => n as i64,
      | Value::Float(f) => f as i64,
      | _ => 0,
    };
    let mut w = Writable::new(&mut out.0);
    write!(w, "{}={};", path, n).map_err(|_| CodecError::NoSpace)
  }

  fn end_encode(&mut self, _out: &mut Payload) -> Result<(), CodecError> {
    Ok(())
  }

  fn decode(&mut self,
            _base: Path,
            payload: &[u8],
            emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
            -> Result<(), CodecError> {
    let s = core::str::from_utf8(payload).map_err(|_| CodecError::Malformed)?;
    for part in s.split(';').filter(|p| !p.is_empty()) {
      let (path_str, value) = part.split_once('=').unwrap_or((part, ""));
      let path = Path::from_segments(path_str.trim_start_matches('/').split('/'))
                      .ok_or(CodecError::Malformed)?;
      let v = match value.parse::<i64>() {
        | Ok(n) => Value::Int(n),
        | Err(_) => Value::Null,
      };
      emit(path, v).map_err(CodecError::Dm)?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stored {
  Int(i64),
  Text(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Inst {
  pub singles: BTreeMap<u16, Stored>,
  pub multi: BTreeMap<u16, BTreeMap<u16, i64>>,
}

/// Declared single-instance read/write resources of [`TestObject`]
const RW_RIDS: [u16; 4] = [1, 2, 3, 4];
/// Declared multi-instance resource
const MULTI_RID: u16 = 5;
/// Declared executable resource
const EXEC_RID: u16 = 8;

/// A pliable in-memory object for exercising the dispatcher and the
/// engine: integer/text resources 1-4, multi-instance 5, executable 8.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestObject {
  pub oid: u16,
  pub version: Option<&'static str>,
  pub instances: BTreeMap<u16, Inst>,
  pub snapshot: Option<BTreeMap<u16, Inst>>,
  pub tx_begins: u32,
  pub tx_ends: u32,
  pub reject_validation: bool,
  pub executed: Vec<(u16, u16, Vec<u8>)>,
}

impl TestObject {
  pub fn new(oid: u16) -> Self {
    Self { oid,
           ..Default::default() }
  }

  pub fn add_instance(&mut self, iid: u16) {
    self.instances.insert(iid, Inst::default());
  }

  pub fn set(&mut self, path: Path, value: i64) {
    let inst = self.instances
                   .entry(path.iid().unwrap())
                   .or_default();
    match path.riid() {
      | Some(riid) => {
        inst.multi
            .entry(path.rid().unwrap())
            .or_default()
            .insert(riid, value);
      },
      | None => {
        inst.singles.insert(path.rid().unwrap(), Stored::Int(value));
      },
    }
  }

  pub fn set_text(&mut self, path: Path, value: &str) {
    self.instances
        .entry(path.iid().unwrap())
        .or_default()
        .singles
        .insert(path.rid().unwrap(), Stored::Text(value.into()));
  }

  pub fn read_int(&self, path: Path) -> Option<i64> {
    let inst = self.instances.get(&path.iid()?)?;
    match path.riid() {
      | Some(riid) => inst.multi.get(&path.rid()?)?.get(&riid).copied(),
      | None => match inst.singles.get(&path.rid()?)? {
        | Stored::Int(n) => Some(*n),
        | Stored::Text(_) => None,
      },
    }
  }

  pub fn read_text(&self, path: Path) -> Option<String> {
    match self.instances
              .get(&path.iid()?)?
              .singles
              .get(&path.rid()?)?
    {
      | Stored::Text(s) => Some(s.clone()),
      | Stored::Int(_) => None,
    }
  }
}

impl Object for TestObject {
  fn oid(&self) -> u16 {
    self.oid
  }

  fn version(&self) -> Option<&str> {
    self.version
  }

  fn instance_ids(&self, visit: &mut dyn FnMut(u16)) {
    for iid in self.instances.keys() {
      visit(*iid);
    }
  }

  fn resource_defs(&self, iid: u16, visit: &mut dyn FnMut(ResourceDef)) -> Result<(), DmError> {
    if !self.instances.contains_key(&iid) {
      return Err(DmError::NotFound);
    }
    for rid in RW_RIDS {
      visit(ResourceDef { rid,
                          kind: ResourceKind::Rw });
    }
    visit(ResourceDef { rid: MULTI_RID,
                        kind: ResourceKind::Rwm });
    visit(ResourceDef { rid: EXEC_RID,
                        kind: ResourceKind::E });
    Ok(())
  }

  fn resource_instance_ids(&self,
                           iid: u16,
                           rid: u16,
                           visit: &mut dyn FnMut(u16))
                           -> Result<(), DmError> {
    let inst = self.instances.get(&iid).ok_or(DmError::NotFound)?;
    if let Some(riids) = inst.multi.get(&rid) {
      for riid in riids.keys() {
        visit(*riid);
      }
    }
    Ok(())
  }

  fn transaction_begin(&mut self) -> Result<(), DmError> {
    self.tx_begins += 1;
    self.snapshot = Some(self.instances.clone());
    Ok(())
  }

  fn transaction_validate(&mut self) -> Result<(), DmError> {
    if self.reject_validation {
      Err(DmError::BadRequest)
    } else {
      Ok(())
    }
  }

  fn transaction_end(&mut self, result: TxResult) {
    self.tx_ends += 1;
    let snapshot = self.snapshot.take();
    if result == TxResult::Failure {
      if let Some(s) = snapshot {
        self.instances = s;
      }
    }
  }

  fn instance_create(&mut self, iid: u16) -> Result<(), DmError> {
    self.instances.insert(iid, Inst::default());
    Ok(())
  }

  fn instance_remove(&mut self, iid: u16) -> Result<(), DmError> {
    self.instances.remove(&iid).ok_or(DmError::NotFound)?;
    Ok(())
  }

  fn instance_reset(&mut self, iid: u16) -> Result<(), DmError> {
    *self.instances.get_mut(&iid).ok_or(DmError::NotFound)? = Inst::default();
    Ok(())
  }

  fn resource_read(&self,
                   path: Path,
                   emit: &mut dyn FnMut(Path, Value<'_>) -> Result<(), DmError>)
                   -> Result<(), DmError> {
    let iid = path.iid().ok_or(DmError::BadRequest)?;
    let rid = path.rid().ok_or(DmError::BadRequest)?;
    let inst = self.instances.get(&iid).ok_or(DmError::NotFound)?;

    if rid == EXEC_RID {
      return Err(DmError::MethodNotAllowed);
    }

    if rid == MULTI_RID {
      let riids = inst.multi.get(&rid).ok_or(DmError::NotFound)?;
      match path.riid() {
        | Some(riid) => {
          let v = riids.get(&riid).ok_or(DmError::NotFound)?;
          return emit(path, Value::Int(*v));
        },
        | None => {
          for (riid, v) in riids {
            emit(Path::resource_instance(self.oid, iid, rid, *riid), Value::Int(*v))?;
          }
          return Ok(());
        },
      }
    }

    match inst.singles.get(&rid) {
      | Some(Stored::Int(n)) => emit(path, Value::Int(*n)),
      | Some(Stored::Text(s)) => emit(path, Value::Text(Chunk::whole(s.as_bytes()))),
      | None => Err(DmError::NotFound),
    }
  }

  fn resource_write(&mut self, path: Path, value: Value<'_>) -> Result<(), DmError> {
    let iid = path.iid().ok_or(DmError::BadRequest)?;
    let rid = path.rid().ok_or(DmError::BadRequest)?;

    if rid == MULTI_RID {
      let riid = path.riid().ok_or(DmError::BadRequest)?;
      let n = match value {
        | Value::Int(n) => n,
        | Value::Uint(n) => n as i64,
        | _ => return Err(DmError::BadRequest),
      };
      self.instances
          .get_mut(&iid)
          .ok_or(DmError::NotFound)?
          .multi
          .entry(rid)
          .or_default()
          .insert(riid, n);
      return Ok(());
    }

    if !RW_RIDS.contains(&rid) {
      return Err(DmError::NotFound);
    }

    let inst = self.instances.get_mut(&iid).ok_or(DmError::NotFound)?;
    match value {
      | Value::Int(n) => {
        inst.singles.insert(rid, Stored::Int(n));
        Ok(())
      },
      | Value::Uint(n) => {
        inst.singles.insert(rid, Stored::Int(n as i64));
        Ok(())
      },
      | Value::Text(chunk) => {
        let s = core::str::from_utf8(chunk.data).map_err(|_| DmError::BadRequest)?;
        match inst.singles.get_mut(&rid) {
          | Some(Stored::Text(existing)) if chunk.offset > 0 => existing.push_str(s),
          | _ => {
            // if the text looks like an integer, store it as one; the
            // plain-text codec leaves conversion to the resource
            match s.parse::<i64>() {
              | Ok(n) if chunk.is_last() => {
                inst.singles.insert(rid, Stored::Int(n));
              },
              | _ => {
                inst.singles.insert(rid, Stored::Text(s.into()));
              },
            }
          },
        }
        Ok(())
      },
      | _ => Err(DmError::BadRequest),
    }
  }

  fn resource_execute(&mut self, iid: u16, rid: u16, arg: &[u8]) -> Result<(), DmError> {
    self.executed.push((iid, rid, arg.to_vec()));
    Ok(())
  }

  fn resource_instance_remove(&mut self, iid: u16, rid: u16, riid: u16) -> Result<(), DmError> {
    self.instances
        .get_mut(&iid)
        .ok_or(DmError::NotFound)?
        .multi
        .get_mut(&rid)
        .ok_or(DmError::NotFound)?
        .remove(&riid)
        .ok_or(DmError::NotFound)?;
    Ok(())
  }
}

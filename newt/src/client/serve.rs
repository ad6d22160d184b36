//! The server-initiated half of the engine: everything that arrives as
//! a CoAP request and leaves as a response. Read, Write, Execute,
//! Create, Delete, Discover, Observe, Write-Attributes, the composite
//! operations, and the bootstrap write window all route through here.

use embedded_time::Instant;
use newt_msg::{attr, Block, Code, CodeKind, ContentFormat, Message, OptValue, Payload, Token,
               Type};
use tinyvec::ArrayVec;

use super::{App, Client, SrvAssembly, SrvBlock2};
use crate::cache::Hit;
use crate::codec::PayloadCodec;
use crate::config::cap;
use crate::dm::{self, DataModel, DmError, DmOp};
use crate::error::Error;
use crate::exchange;
use crate::net::Socket;
use crate::path::{Path, INVALID_ID};
use crate::time::{self, Clock};

/// Option numbers this engine understands well enough to act on
/// (Uri-Path, Uri-Query, Accept, Block2, Block1); any other critical
/// option in a request earns 4.02 Bad Option
const HANDLED_CRITICAL: [u32; 5] = [11, 15, 17, 23, 27];

/// What a handler decided to answer
struct Reply {
  code: Code,
  format: Option<ContentFormat>,
  payload: Payload,
  observe: Option<u32>,
  location: Option<(u16, u16)>,
}

impl Reply {
  fn code(code: Code) -> Self {
    Self { code,
           format: None,
           payload: Payload::default(),
           observe: None,
           location: None }
  }

  fn content(format: ContentFormat, payload: Payload) -> Self {
    Self { code: Code::CONTENT,
           format: Some(format),
           payload,
           observe: None,
           location: None }
  }
}

impl From<DmError> for Reply {
  fn from(e: DmError) -> Self {
    Reply::code(e.code())
  }
}

impl<'a, S: Socket, C: Clock> Client<'a, S, C> {
  /// Handle one inbound datagram that is not part of the client
  /// exchange
  pub(super) fn serve(&mut self,
                      dm: &mut dyn DataModel,
                      app: &mut dyn App,
                      req: &Message,
                      now: Instant<C>) {
    if req.code.kind() != CodeKind::Request {
      // a response nothing is waiting for; reject CONs so the peer
      // stops retransmitting
      if req.ty == Type::Con {
        let rst = req.rst();
        self.transmit(&rst, now);
      }
      return;
    }

    match self.cache.lookup(req.id, now) {
      | Hit::Recent(bytes) => {
        let mut replay = ArrayVec::<[u8; cap::MSG_BUF]>::new();
        replay.extend_from_slice(bytes);
        self.sock.send(&replay).ok();
        return;
      },
      | Hit::Seen => return,
      | Hit::Miss => (),
    }

    let unknown_critical = req.opts
                              .critical_numbers()
                              .any(|n| !HANDLED_CRITICAL.contains(&n.0));
    if unknown_critical {
      self.respond(req, Reply::code(Code::BAD_OPTION), now);
      return;
    }

    // one server exchange at a time: a second request during a
    // multi-block assembly is turned away (and that answer is cached)
    if let Some(a) = &self.srv_assembly {
      if a.token != req.token {
        self.respond(req, Reply::code(Code::SERVICE_UNAVAILABLE), now);
        return;
      }
    }

    let reply = self.handle(dm, app, req, now);
    match reply {
      | Some(r) => self.respond(req, r, now),
      | None => (),
    }
  }

  /// Route a deduplicated request; `None` means "no response at all"
  /// (mid-assembly continue was already sent, or silent drop)
  fn handle(&mut self,
            dm: &mut dyn DataModel,
            app: &mut dyn App,
            req: &Message,
            now: Instant<C>)
            -> Option<Reply> {
    // the Bootstrap-Finish and Bootstrap-Discover surface uses a
    // textual path, everything else is numeric
    let mut segs = req.path_segments();
    let first = segs.next();
    if first == Some("bs") {
      return Some(self.handle_bootstrap_finish(dm, req));
    }

    let path = match Path::from_segments(req.path_segments()) {
      | Some(p) => p,
      | None => return Some(Reply::code(Code::NOT_FOUND)),
    };

    let bootstrap = self.bootstrap.in_progress();

    // multi-block request bodies are assembled before the operation runs
    let body: Option<ArrayVec<[u8; cap::STAGING]>> = match self.assemble(req, now) {
      | Assembly::Continue => return None,
      | Assembly::Mismatch => return Some(Reply::code(Code::REQUEST_ENTITY_INCOMPLETE)),
      | Assembly::Overflow => return Some(Reply::code(Code::REQUEST_ENTITY_TOO_LARGE)),
      | Assembly::Complete(body) => Some(body),
      | Assembly::NotBlockwise => None,
    };
    let body = match &body {
      | Some(b) => &b[..],
      | None => req.payload.as_bytes(),
    };

    let reply = match req.code {
      | Code::GET => self.handle_get(dm, app, req, path, now),
      | Code::PUT => self.handle_put(dm, app, req, path, body, bootstrap),
      | Code::POST => self.handle_post(dm, app, req, path, body, bootstrap),
      | Code::DELETE => self.handle_delete(dm, path, bootstrap),
      | Code::FETCH => self.handle_read_composite(dm, app, req, body, now),
      | Code::IPATCH => self.handle_write_composite(dm, app, req, body, bootstrap),
      | _ => Reply::code(Code::METHOD_NOT_ALLOWED),
    };

    // server-side mutations feed back into observations and the
    // registration shape
    match req.code {
      | Code::PUT | Code::POST | Code::IPATCH if reply.code.class == 2 => {
        self.data_model_changed(dm, path);
      },
      | Code::DELETE if reply.code.class == 2 => {
        self.entity_removed(app, path);
        self.data_model_changed(dm, path.parent());
      },
      | _ => (),
    }

    Some(reply)
  }

  fn handle_bootstrap_finish(&mut self, dm: &mut dyn DataModel, req: &Message) -> Reply {
    if req.code != Code::POST || !self.bootstrap.in_progress() {
      return Reply::code(Code::BAD_REQUEST);
    }

    // the provisioned model must hold together before we accept
    let mut ok = true;
    let mut ix = 0;
    while let Some(oid) = dm.oid_at(ix) {
      ix += 1;
      if let Some(obj) = dm.object(oid) {
        ok &= obj.transaction_validate().is_ok();
      }
    }

    if !ok {
      log::warn!("bootstrap finish rejected: inconsistent data model");
      return Reply::code(Code::NOT_ACCEPTABLE);
    }

    log::info!("bootstrap finished");
    self.bootstrap.finished();
    Reply::code(Code::CHANGED)
  }

  fn handle_get(&mut self,
                dm: &mut dyn DataModel,
                app: &mut dyn App,
                req: &Message,
                path: Path,
                now: Instant<C>)
                -> Reply {
    // Block2 retrieval of a stored oversized response
    if let Some(b2) = req.block2() {
      if b2.num() > 0 {
        return self.continue_block2(req, b2);
      }
    }

    if req.accept() == Some(ContentFormat::LinkFormat) {
      return self.handle_discover(dm, path);
    }

    match req.observe() {
      | Some(0) => self.handle_observe(dm, app, req, path, now),
      | Some(1) => {
        self.obs.remove_by_token(req.token);
        self.handle_read(dm, app, req, path)
      },
      | _ => self.handle_read(dm, app, req, path),
    }
  }

  fn handle_read(&mut self,
                 dm: &mut dyn DataModel,
                 app: &mut dyn App,
                 req: &Message,
                 path: Path)
                 -> Reply {
    let multi = path.len() < 3;
    let format = match crate::codec::choose(req.accept(), multi, &mut |f| {
            app.codec(f).is_some()
          }) {
      | Some(f) => f,
      | None => return Reply::code(Code::NOT_ACCEPTABLE),
    };

    let mut body = Payload::default();
    let mut numeric = None;
    match self.encode_read(dm, app, path, format, &mut body, &mut numeric) {
      | Ok(()) => Reply::content(format, body),
      | Err(e) => Reply::from(e),
    }
  }

  fn handle_observe(&mut self,
                    dm: &mut dyn DataModel,
                    app: &mut dyn App,
                    req: &Message,
                    path: Path,
                    now: Instant<C>)
                    -> Reply {
    let mut reply = self.handle_read(dm, app, req, path);
    if reply.code != Code::CONTENT {
      return reply;
    }

    let mut numeric = None;
    dm::read_value(dm, path, &mut |_, v| {
        numeric = numeric.or_else(|| v.numeric());
        Ok(())
      }).ok();

    match self.obs.add(path, req.token, reply.format, numeric, now) {
      | Ok(()) => (),
      | Err(Error::NoSpace) => return Reply::code(Code::INTERNAL_SERVER_ERROR),
      | Err(_) => return Reply::code(Code::INTERNAL_SERVER_ERROR),
    }

    let seq = self.find_obs_seq(path, req.token).unwrap_or(0);
    reply.observe = Some(seq);
    reply
  }

  fn find_obs_seq(&self, path: Path, token: Token) -> Option<u32> {
    (0..cap::MAX_OBSERVATIONS).filter_map(|ix| self.obs.get(ix))
                              .find(|o| o.path == path && o.token == token)
                              .map(|o| o.seq())
  }

  fn handle_discover(&mut self, dm: &mut dyn DataModel, path: Path) -> Reply {
    let mut body = ArrayVec::<[u8; cap::STAGING]>::new();
    let obs = &self.obs;
    match crate::link::write_discover(dm, path, &mut |p| obs.attrs_at(p), &mut body) {
      | Ok(()) => match Payload::try_from_slice(&body) {
        | Some(p) => Reply::content(ContentFormat::LinkFormat, p),
        | None => Reply::code(Code::INTERNAL_SERVER_ERROR),
      },
      | Err(Error::Dm(e)) => Reply::from(e),
      | Err(_) => Reply::code(Code::INTERNAL_SERVER_ERROR),
    }
  }

  fn handle_put(&mut self,
                dm: &mut dyn DataModel,
                app: &mut dyn App,
                req: &Message,
                path: Path,
                body: &[u8],
                bootstrap: bool)
                -> Reply {
    // a PUT with attribute queries and no payload is Write-Attributes
    let has_attr_query = req.queries().any(|q| attr::parse(q).is_some());
    if body.is_empty() && has_attr_query {
      return self.handle_write_attrs(req, path);
    }

    if path.len() < 2 {
      return Reply::code(Code::METHOD_NOT_ALLOWED);
    }
    self.apply_write(dm, app, req, path, body, DmOp::WriteReplace, bootstrap)
  }

  fn handle_write_attrs(&mut self, req: &Message, path: Path) -> Reply {
    let mut attrs = self.obs.attrs_at(path);

    for q in req.queries() {
      let (key, value) = match attr::parse(q) {
        | Some(kv) => kv,
        | None => continue,
      };

      macro_rules! num {
        ($t:ty) => {
          if value.is_empty() {
            None
          } else {
            match value.parse::<$t>() {
              | Ok(v) => Some(v),
              | Err(_) => return Reply::code(Code::BAD_REQUEST),
            }
          }
        };
      }

      match key {
        | attr::Key::Pmin => attrs.pmin = num!(u32),
        | attr::Key::Pmax => attrs.pmax = num!(u32),
        | attr::Key::Gt => attrs.gt = num!(f64),
        | attr::Key::Lt => attrs.lt = num!(f64),
        | attr::Key::St => attrs.st = num!(f64),
        | attr::Key::Epmin => attrs.epmin = num!(u32),
        | attr::Key::Epmax => attrs.epmax = num!(u32),
        | _ => return Reply::code(Code::BAD_REQUEST),
      }
    }

    match self.obs.set_attrs(path, attrs) {
      | Ok(()) => Reply::code(Code::CHANGED),
      | Err(_) => Reply::code(Code::INTERNAL_SERVER_ERROR),
    }
  }

  fn handle_post(&mut self,
                 dm: &mut dyn DataModel,
                 app: &mut dyn App,
                 req: &Message,
                 path: Path,
                 body: &[u8],
                 bootstrap: bool)
                 -> Reply {
    match path.len() {
      | 1 => self.handle_create(dm, app, req, path, body),
      | 2 => self.apply_write(dm, app, req, path, body, DmOp::WritePartial, bootstrap),
      | 3 => match dm::execute(dm, path, body) {
        | Ok(()) => Reply::code(Code::CHANGED),
        | Err(e) => Reply::from(e),
      },
      | _ => Reply::code(Code::METHOD_NOT_ALLOWED),
    }
  }

  fn handle_create(&mut self,
                   dm: &mut dyn DataModel,
                   app: &mut dyn App,
                   req: &Message,
                   path: Path,
                   body: &[u8])
                   -> Reply {
    let oid = match path.oid() {
      | Some(oid) => oid,
      | None => return Reply::code(Code::METHOD_NOT_ALLOWED),
    };

    if let Err(e) = self.dispatcher.begin(dm, DmOp::Create, false, path) {
      return begin_error(e);
    }

    let created = if body.is_empty() {
      self.dispatcher.create_instance(dm, oid, INVALID_ID)
    } else {
      self.create_from_payload(dm, app, req, oid, body)
    };

    let created = match created {
      | Ok(iid) => iid,
      | Err(e) => {
        self.dispatcher.end(dm, false).ok();
        return Reply::from(e);
      },
    };

    if self.dispatcher.validate(dm).is_err() {
      self.dispatcher.end(dm, false).ok();
      return Reply::code(Code::BAD_REQUEST);
    }
    if self.dispatcher.end(dm, true).is_err() {
      return Reply::code(Code::INTERNAL_SERVER_ERROR);
    }

    let mut reply = Reply::code(Code::CREATED);
    reply.location = Some((oid, created));
    reply
  }

  fn create_from_payload(&mut self,
                         dm: &mut dyn DataModel,
                         app: &mut dyn App,
                         req: &Message,
                         oid: u16,
                         body: &[u8])
                         -> Result<u16, DmError> {
    let format = req.content_format().unwrap_or(ContentFormat::Text);
    let plain = &mut self.plain;
    let codec: &mut dyn PayloadCodec = if format == ContentFormat::Text {
      plain
    } else {
      app.codec(format).ok_or(DmError::BadRequest)?
    };

    let disp = &mut self.dispatcher;
    let mut created: Option<u16> = None;
    codec.decode(Path::object(oid), body, &mut |p, v| {
           if p.oid() != Some(oid) {
             return Err(DmError::BadRequest);
           }
           let iid = p.iid().ok_or(DmError::BadRequest)?;
           if created.is_none() {
             created = Some(disp.create_instance(dm, oid, iid)?);
           }
           disp.write_entry(dm, p, v)
         })
         .map_err(|e| match e {
           | crate::codec::CodecError::Dm(e) => e,
           | _ => DmError::BadRequest,
         })?;

    created.ok_or(DmError::BadRequest)
  }

  fn handle_delete(&mut self, dm: &mut dyn DataModel, path: Path, bootstrap: bool) -> Reply {
    let valid = match path.len() {
      | 2 => true,
      | 0 | 1 => bootstrap,
      | _ => false,
    };
    if !valid {
      return Reply::code(Code::METHOD_NOT_ALLOWED);
    }

    if let Err(e) = self.dispatcher.begin(dm, DmOp::Delete, bootstrap, path) {
      return begin_error(e);
    }
    match self.dispatcher.end(dm, true) {
      | Ok(()) => Reply::code(Code::DELETED),
      | Err(_) => Reply::code(Code::INTERNAL_SERVER_ERROR),
    }
  }

  fn apply_write(&mut self,
                 dm: &mut dyn DataModel,
                 app: &mut dyn App,
                 req: &Message,
                 base: Path,
                 body: &[u8],
                 op: DmOp,
                 bootstrap: bool)
                 -> Reply {
    let format = req.content_format().unwrap_or(ContentFormat::Text);

    if let Err(e) = self.dispatcher.begin(dm, op, bootstrap, base) {
      return begin_error(e);
    }

    let decoded = {
      let plain = &mut self.plain;
      let codec: Option<&mut dyn PayloadCodec> = if format == ContentFormat::Text {
        Some(plain)
      } else {
        app.codec(format)
      };

      match codec {
        | None => Err(Code::UNSUPPORTED_CONTENT_FORMAT),
        | Some(codec) => {
          let disp = &mut self.dispatcher;
          codec.decode(base, body, &mut |p, v| disp.write_entry(dm, p, v))
               .map_err(|e| match e {
                 | crate::codec::CodecError::Dm(e) => e.code(),
                 | crate::codec::CodecError::Unsupported => Code::UNSUPPORTED_CONTENT_FORMAT,
                 | _ => Code::BAD_REQUEST,
               })
        },
      }
    };

    if let Err(code) = decoded {
      self.dispatcher.end(dm, false).ok();
      return Reply::code(code);
    }

    if let Err(e) = self.dispatcher.validate(dm) {
      self.dispatcher.end(dm, false).ok();
      return Reply::from(e);
    }
    match self.dispatcher.end(dm, true) {
      | Ok(()) => Reply::code(Code::CHANGED),
      | Err(_) => Reply::code(Code::INTERNAL_SERVER_ERROR),
    }
  }

  fn handle_read_composite(&mut self,
                           dm: &mut dyn DataModel,
                           app: &mut dyn App,
                           req: &Message,
                           body: &[u8],
                           now: Instant<C>)
                           -> Reply {
    let req_format = match req.content_format() {
      | Some(f) => f,
      | None => return Reply::code(Code::BAD_REQUEST),
    };

    let mut paths = ArrayVec::<[Path; 16]>::new();
    {
      let codec = match app.codec(req_format) {
        | Some(c) => c,
        | None => return Reply::code(Code::UNSUPPORTED_CONTENT_FORMAT),
      };
      let decoded = codec.decode(Path::root(), body, &mut |p, _| {
                           if paths.is_full() {
                             return Err(DmError::Memory);
                           }
                           paths.push(p);
                           Ok(())
                         });
      if decoded.is_err() {
        return Reply::code(Code::BAD_REQUEST);
      }
    }

    let format = match crate::codec::choose(req.accept(), true, &mut |f| {
            app.codec(f).is_some()
          }) {
      | Some(f) => f,
      | None => return Reply::code(Code::NOT_ACCEPTABLE),
    };

    let mut out = Payload::default();
    let mut numeric = None;
    {
      let codec = match app.codec(format) {
        | Some(c) => c,
        | None => return Reply::code(Code::NOT_ACCEPTABLE),
      };
      if codec.begin_encode(Path::root(), paths.len(), &mut out).is_err() {
        return Reply::code(Code::INTERNAL_SERVER_ERROR);
      }
      for p in paths.iter() {
        let r = dm::iterate(dm, *p, &mut |p, v| {
            numeric = numeric.or_else(|| v.numeric());
            codec.encode_entry(p, &v, &mut out).map_err(|_| DmError::Memory)
          });
        match r {
          // composite reads skip what is absent rather than failing
          | Err(DmError::NotFound) | Ok(()) => (),
          | Err(e) => return Reply::from(e),
        }
      }
      if codec.end_encode(&mut out).is_err() {
        return Reply::code(Code::INTERNAL_SERVER_ERROR);
      }
    }

    let mut reply = Reply::content(format, out);

    // FETCH + Observe is Observe-Composite: register (or cancel) the
    // whole path set under this token
    match req.observe() {
      | Some(0) => {
        match self.obs.add_composite(&paths, req.token, format, now) {
          | Ok(()) => (),
          | Err(Error::InvalidArg) => return Reply::code(Code::BAD_REQUEST),
          | Err(_) => return Reply::code(Code::INTERNAL_SERVER_ERROR),
        }
        reply.observe = Some(self.find_composite_seq(req.token).unwrap_or(0));
      },
      | Some(1) => {
        self.obs.remove_composite_by_token(req.token);
      },
      | _ => (),
    }

    reply
  }

  fn find_composite_seq(&self, token: Token) -> Option<u32> {
    (0..cap::MAX_COMPOSITE_OBSERVATIONS).filter_map(|ix| self.obs.composite(ix))
                                        .find(|c| c.token == token)
                                        .map(|c| c.seq())
  }

  fn handle_write_composite(&mut self,
                            dm: &mut dyn DataModel,
                            app: &mut dyn App,
                            req: &Message,
                            body: &[u8],
                            bootstrap: bool)
                            -> Reply {
    match req.content_format() {
      | Some(f) if f.is_multi_entry() => {
        self.apply_write_with_format(dm, app, f, Path::root(), body, DmOp::WriteComp, bootstrap)
      },
      | _ => Reply::code(Code::UNSUPPORTED_CONTENT_FORMAT),
    }
  }

  fn apply_write_with_format(&mut self,
                             dm: &mut dyn DataModel,
                             app: &mut dyn App,
                             format: ContentFormat,
                             base: Path,
                             body: &[u8],
                             op: DmOp,
                             bootstrap: bool)
                             -> Reply {
    if let Err(e) = self.dispatcher.begin(dm, op, bootstrap, base) {
      return begin_error(e);
    }

    let decoded = {
      let codec = match app.codec(format) {
        | Some(c) => c,
        | None => {
          self.dispatcher.end(dm, false).ok();
          return Reply::code(Code::UNSUPPORTED_CONTENT_FORMAT);
        },
      };
      let disp = &mut self.dispatcher;
      codec.decode(base, body, &mut |p, v| disp.write_entry(dm, p, v))
    };

    if decoded.is_err() {
      self.dispatcher.end(dm, false).ok();
      return Reply::code(Code::BAD_REQUEST);
    }
    if let Err(e) = self.dispatcher.validate(dm) {
      self.dispatcher.end(dm, false).ok();
      return Reply::from(e);
    }
    match self.dispatcher.end(dm, true) {
      | Ok(()) => Reply::code(Code::CHANGED),
      | Err(_) => Reply::code(Code::INTERNAL_SERVER_ERROR),
    }
  }

  // ---- block-wise plumbing ----

  fn assemble(&mut self, req: &Message, now: Instant<C>) -> Assembly {
    let b1 = match req.block1() {
      | Some(b) => b,
      | None => return Assembly::NotBlockwise,
    };

    let expected = match &self.srv_assembly {
      | Some(a) if a.token == req.token => a.next_num,
      | Some(_) | None => 0,
    };

    if b1.num() != expected {
      self.srv_assembly = None;
      self.staging.clear();
      return Assembly::Mismatch;
    }

    if b1.num() == 0 {
      self.staging.clear();
    }

    let payload = req.payload.as_bytes();
    if self.staging.len() + payload.len() > cap::STAGING {
      self.srv_assembly = None;
      self.staging.clear();
      return Assembly::Overflow;
    }
    self.staging.extend_from_slice(payload);

    if b1.more() {
      self.srv_assembly = Some(SrvAssembly { token: req.token,
                                             next_num: b1.num() + 1,
                                             deadline:
                                               time::add(now,
                                                         self.cfg.exchange_request_timeout) });

      let mut cont = Reply::code(Code::CONTINUE);
      cont.payload = Payload::default();
      self.respond_with_block1(req, cont, b1, now);
      return Assembly::Continue;
    }

    self.srv_assembly = None;
    let body = core::mem::take(&mut self.staging);
    Assembly::Complete(body)
  }

  fn respond_with_block1(&mut self, req: &Message, reply: Reply, b1: Block, now: Instant<C>) {
    let mut m = self.response_shell(req, reply.code);
    m.set_block1(b1.size(), b1.num(), b1.more()).ok();
    self.finalize(req, m, now);
  }

  fn continue_block2(&mut self, req: &Message, b2: Block) -> Reply {
    let stored = match &self.srv_block2 {
      | Some(s) if s.token == req.token => s,
      | _ => return Reply::code(Code::REQUEST_ENTITY_INCOMPLETE),
    };

    let size = b2.size() as usize;
    let off = b2.num() as usize * size;
    if off >= stored.body.0.len() {
      return Reply::code(Code::BAD_OPTION);
    }

    let end = (off + size).min(stored.body.0.len());
    let mut reply = Reply { code: stored.code,
                            format: stored.format,
                            payload: Payload(stored.body.0[off..end].iter().copied().collect()),
                            observe: None,
                            location: None };
    let more = end < stored.body.0.len();
    if !more {
      // transfer complete; forget the stored body after building the
      // final slice
      reply.observe = None;
      self.srv_block2 = None;
    }
    reply
  }

  // ---- response shaping ----

  fn response_shell(&mut self, req: &Message, code: Code) -> Message {
    match req.ty {
      | Type::Con => Message::new(Type::Ack, code, req.id, req.token),
      | _ => {
        let mid = self.next_mid();
        Message::new(Type::Non, code, mid, req.token)
      },
    }
  }

  fn respond(&mut self, req: &Message, reply: Reply, now: Instant<C>) {
    let block_size = exchange::negotiated_block_size(self.sock.inner_mtu()) as usize;

    let mut m = self.response_shell(req, reply.code);

    if let Some(seq) = reply.observe {
      m.set_observe(seq).ok();
    }
    if let Some((oid, iid)) = reply.location {
      for id in [oid, iid] {
        let mut seg = ArrayVec::<[u8; 8]>::new();
        {
          use core::fmt::Write;
          let mut w = crate::writable::Writable::new(&mut seg);
          write!(w, "{}", id).ok();
        }
        if let Some(v) = OptValue::try_from_slice(&seg) {
          m.add(newt_msg::known::repeat::LOCATION_PATH, v).ok();
        }
      }
    }
    if let Some(f) = reply.format {
      m.set_content_format(f).ok();
    }

    if reply.payload.0.len() > block_size {
      // serve the body block-wise; remember it for the follow-up GETs
      m.set_block2(block_size as u16, 0, true).ok();
      m.payload = Payload(reply.payload.0[..block_size].iter().copied().collect());
      self.srv_block2 = Some(SrvBlock2 { token: req.token,
                                         body: reply.payload,
                                         format: reply.format,
                                         code: reply.code });
    } else {
      if req.block2().is_some() && req.block2().map(|b| b.num()).unwrap_or(0) > 0 {
        if let Some(b2) = req.block2() {
          let more = self.srv_block2.is_some();
          m.set_block2(b2.size(), b2.num(), more).ok();
        }
      }
      m.payload = reply.payload;
    }

    self.finalize(req, m, now);
  }

  /// Serialize, cache, transmit
  fn finalize(&mut self, req: &Message, m: Message, now: Instant<C>) {
    let n = match m.try_into_bytes(&mut self.outbuf) {
      | Ok(n) => n,
      | Err(e) => {
        log::error!("response does not fit the outbound buffer: {:?}", e);
        return;
      },
    };

    let lifetime = self.cfg.tx.exchange_lifetime();
    self.cache.insert(req.id, &self.outbuf[..n], now, lifetime);
    self.sock.send(&self.outbuf[..n]).ok();
    self.reg.touch(now);
  }
}

enum Assembly {
  NotBlockwise,
  Continue,
  Mismatch,
  Overflow,
  Complete(ArrayVec<[u8; cap::STAGING]>),
}

fn begin_error(e: Error) -> Reply {
  match e {
    | Error::Dm(e) => Reply::from(e),
    | Error::Logic => Reply::code(Code::SERVICE_UNAVAILABLE),
    | _ => Reply::code(Code::INTERNAL_SERVER_ERROR),
  }
}

//! The top-level engine: owns the socket, the clock, and every driver,
//! and advances them all from one non-blocking [`Client::step`].

use core::fmt::Write as _;

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use newt_msg::{Code, ContentFormat, Id, Message, Payload, Token, Type};
use no_std_net::SocketAddr;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tinyvec::ArrayVec;

use crate::bootstrap::{Bootstrap, BsState};
use crate::cache::ResponseCache;
use crate::codec::{self, PayloadCodec, PlainText};
use crate::config::{cap, Config};
use crate::dm::{self, DataModel, Dispatcher, DmError};
use crate::error::Error;
use crate::exchange::{self, Action, BlockUpload, Exchange, Kind, Outcome, Recv};
use crate::link;
use crate::net::{SockErrorKind, Socket};
use crate::observe::Observations;
use crate::path::Path;
use crate::reg::{self, ConnStatus, Registration, UpdateReason};
use crate::retry::SeqVerdict;
use crate::send::{SendQueue, SendResult};
use crate::time::{self, Clock, Millis};
use crate::writable::Writable;

mod serve;

#[cfg(test)]
mod tests;

/// Where and who: the one management server (and optionally one
/// bootstrap server) this client talks to.
///
/// The `endpoint` str must outlive the engine; the engine stores the
/// reference, not a copy.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig<'a> {
  /// Endpoint client name (`ep=` on register/bootstrap)
  pub endpoint: &'a str,
  /// The management server
  pub server: SocketAddr,
  /// The bootstrap server, if provisioning is possible
  pub bootstrap_server: Option<SocketAddr>,
  /// Registration lifetime in seconds
  pub lifetime_s: u32,
  /// Enabler version advertised as `lwm2m=`
  pub lwm2m_version: &'a str,
  /// Start with client-initiated bootstrap instead of going straight to
  /// register
  pub initiate_bootstrap: bool,
}

/// The host side of the engine: completion callbacks and pluggable
/// codecs. The data model travels separately (see [`DataModel`]) so a
/// codec borrow can't alias an object borrow.
pub trait App {
  /// The connection life-cycle moved
  fn connection_status_changed(&mut self, _status: ConnStatus) {}

  /// A queued Send finished
  fn send_finished(&mut self, _id: u16, _result: SendResult) {}

  /// An observation was cancelled (Reset, entity removal, session end)
  fn observation_cancelled(&mut self, _path: Path) {}

  /// Mirror of the Server object's Mute-Send resource
  fn mute_send(&mut self) -> bool {
    false
  }

  /// Mirror of the Server object's Bootstrap-on-Registration-Failure
  /// resource; the default models its absent-resource default
  fn bootstrap_on_registration_failure(&mut self) -> bool {
    true
  }

  /// Hand out the codec for `format`, if this host carries one
  fn codec(&mut self, _format: ContentFormat) -> Option<&mut dyn PayloadCodec> {
    None
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeregGoal {
  Suspend {
    until: Option<u32>,
  },
  Restart,
}

/// Inbound Block1 assembly state for one server request
#[derive(Debug)]
struct SrvAssembly<C: Clock> {
  token: Token,
  next_num: u32,
  deadline: Instant<C>,
}

/// Stored response body being served to the peer block-wise (Block2)
#[derive(Debug)]
struct SrvBlock2 {
  token: Token,
  body: Payload,
  format: Option<ContentFormat>,
  code: Code,
}

/// The LwM2M client engine.
///
/// Single-threaded and cooperative: the host calls [`Client::step`] when
/// it likes (at the latest when [`Client::next_step_time`] elapses), and
/// every step runs until the next suspension point, meaning a socket
/// that would block or a timer still in the future.
#[derive(Debug)]
pub struct Client<'a, S: Socket, C: Clock> {
  cfg: Config,
  server: ServerConfig<'a>,
  sock: S,
  clock: C,

  status: ConnStatus,
  connected: bool,
  closing: bool,

  exchange: Option<Exchange<C>>,
  cache: ResponseCache<C>,
  obs: Observations<C>,
  send_q: SendQueue,
  dispatcher: Dispatcher,
  bootstrap: Bootstrap<C>,
  reg: Registration<C>,

  pending_dereg: Option<DeregGoal>,
  srv_assembly: Option<SrvAssembly<C>>,
  srv_block2: Option<SrvBlock2>,

  rng: ChaCha8Rng,
  mid: Id,
  plain: PlainText,

  inbuf: [u8; cap::MSG_BUF],
  outbuf: [u8; cap::MSG_BUF],
  staging: ArrayVec<[u8; cap::STAGING]>,
}

impl<'a, S: Socket, C: Clock> Client<'a, S, C> {
  /// Build an engine. Nothing touches the network until the first
  /// [`Client::step`].
  pub fn new(cfg: Config, server: ServerConfig<'a>, sock: S, clock: C) -> Self {
    let seed = clock.try_now()
                    .ok()
                    .and_then(|t| Millis::try_from(t.duration_since_epoch()).ok())
                    .map(|Milliseconds(ms)| ms)
                    .unwrap_or(0)
               ^ ((cfg.token_seed as u64) << 48);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mid = Id(rng.next_u32() as u16);
    let lifetime = server.lifetime_s;

    Self { cfg,
           server,
           sock,
           clock,
           status: ConnStatus::Initial,
           connected: false,
           closing: false,
           exchange: None,
           cache: ResponseCache::default(),
           obs: Observations::default(),
           send_q: SendQueue::default(),
           dispatcher: Dispatcher::default(),
           bootstrap: Bootstrap::default(),
           reg: Registration::new(lifetime),
           pending_dereg: None,
           srv_assembly: None,
           srv_block2: None,
           rng,
           mid,
           plain: PlainText,
           inbuf: [0; cap::MSG_BUF],
           outbuf: [0; cap::MSG_BUF],
           staging: ArrayVec::new() }
  }

  /// The externally-visible connection status
  pub fn conn_status(&self) -> ConnStatus {
    self.status
  }

  /// Advance everything that can advance without blocking
  pub fn step(&mut self, dm: &mut dyn DataModel, app: &mut dyn App) -> Result<(), Error> {
    let now = self.now()?;

    self.check_suspension(app, now);
    self.drop_stale_assembly(dm, now);

    // pump until nothing moves: each pass may unblock the next (a
    // response arrives -> an exchange finishes -> a driver starts the
    // next exchange)
    for _ in 0..8 {
      let mut progressed = false;
      progressed |= self.pump_inbound(dm, app, now);
      progressed |= self.finish_exchange(dm, app, now);
      progressed |= self.advance_drivers(dm, app, now);
      progressed |= self.pump_outbound(dm, app, now);
      if !progressed {
        break;
      }
    }

    self.check_queue_mode(app, now);
    Ok(())
  }

  /// Smallest positive duration until the soonest scheduled action, or
  /// `None` when nothing is scheduled (the host may sleep until traffic
  /// or its own events arrive)
  pub fn next_step_time(&self) -> Option<Millis> {
    let now = self.clock.try_now().ok()?;

    let mut soonest = self.exchange.as_ref().and_then(|e| e.next_deadline());
    soonest = time::min_instant(soonest, self.reg.next_deadline());
    soonest = time::min_instant(soonest, self.bootstrap.next_deadline());
    soonest = time::min_instant(soonest, self.srv_assembly.as_ref().map(|a| a.deadline));

    if self.is_session_live() {
      soonest = time::min_instant(soonest, self.obs.next_deadline(now));
      if let Some(qm) = self.cfg.registration.queue_mode {
        if self.status == ConnStatus::Registered {
          soonest = time::min_instant(soonest, self.reg.queue_mode_closes_at(qm.timeout));
        }
      }
    }

    soonest.map(|at| time::since(now, at).max(Milliseconds(1)))
  }

  /// Queue a Send report of the current values at `paths`
  pub fn send(&mut self,
              app: &mut dyn App,
              paths: &[Path],
              format: ContentFormat)
              -> Result<u16, Error> {
    if !self.is_session_live() {
      return Err(Error::NotAllowed);
    }
    if app.mute_send() {
      return Err(Error::NotAllowed);
    }
    self.send_q.enqueue(paths, format)
  }

  /// Abort one queued Send (or all with `None`); each aborted request's
  /// callback fires with [`SendResult::Abort`]
  pub fn send_abort(&mut self, app: &mut dyn App, id: Option<u16>) {
    // the in-flight one, if targeted, terminates through the exchange
    if let Some(ex) = &mut self.exchange {
      if let Kind::Send { id: active } = ex.kind {
        if id.is_none() || id == Some(active) {
          ex.terminate();
        }
      }
    }

    let mut dropped = ArrayVec::<[u16; cap::SEND_QUEUE]>::new();
    self.send_q.abort(id, &mut |i| {
               if !dropped.is_full() {
                 dropped.push(i);
               }
             });
    for id in dropped {
      app.send_finished(id, SendResult::Abort);
    }
  }

  /// The application changed a value (or the server did, via us):
  /// re-evaluate observations, and track shape for the next Update
  pub fn data_model_changed(&mut self, dm: &mut dyn DataModel, path: Path) {
    let numeric = if path.len() >= 3 {
      let mut v = None;
      dm::read_value(dm, path, &mut |_, value| {
          v = v.or_else(|| value.numeric());
          Ok(())
        }).ok();
      v
    } else {
      None
    };
    self.obs.data_changed(path, numeric);

    // shape changes (instance add/remove) schedule an Update, but never
    // while bootstrap is rewriting the model
    if self.is_session_live() && !self.bootstrap.in_progress() {
      let shape = reg::shape_hash(dm);
      if self.reg.shape_changed(shape) {
        self.reg.request_update(UpdateReason::Shape);
      }
    }
  }

  /// The data model removed an entity; observations under it die
  pub fn entity_removed(&mut self, app: &mut dyn App, path: Path) {
    let mut cancelled = ArrayVec::<[Path; cap::MAX_OBSERVATIONS]>::new();
    self.obs.remove_under(path, &mut |p, _| {
               if !cancelled.is_full() {
                 cancelled.push(p);
               }
             });
    for p in cancelled {
      app.observation_cancelled(p);
    }
  }

  /// The application changed the registration lifetime
  pub fn lifetime_changed(&mut self, lifetime_s: u32) {
    if self.reg.lifetime_s != lifetime_s {
      self.reg.lifetime_s = lifetime_s;
      self.reg.request_update(UpdateReason::Lifetime);
    }
  }

  /// Server/x/8 (Registration Update Trigger) was executed
  pub fn registration_update_trigger_executed(&mut self) {
    self.reg.request_update(UpdateReason::Trigger);
  }

  /// Server/x/4 (Disable) was executed: deregister and stay away for
  /// `timeout_s` (Disable Timeout)
  pub fn server_obj_disable_executed(&mut self, timeout_s: u32) {
    self.pending_dereg = Some(DeregGoal::Suspend { until: Some(timeout_s) });
  }

  /// Client-side disable; `None` suspends indefinitely
  pub fn disable_server(&mut self, timeout_s: Option<u32>) {
    self.pending_dereg = Some(DeregGoal::Suspend { until: timeout_s });
  }

  /// Deregister cleanly and return to `Initial`
  pub fn restart(&mut self) {
    self.pending_dereg = Some(DeregGoal::Restart);
  }

  // ---- internals ----

  fn now(&self) -> Result<Instant<C>, Error> {
    self.clock.try_now().map_err(Error::from)
  }

  fn is_session_live(&self) -> bool {
    matches!(self.status, ConnStatus::Registered | ConnStatus::QueueMode)
  }

  fn set_status(&mut self, app: &mut dyn App, status: ConnStatus) {
    if self.status != status {
      log::debug!("conn status {:?} -> {:?}", self.status, status);
      self.status = status;
      app.connection_status_changed(status);
    }
  }

  fn next_mid(&mut self) -> Id {
    self.mid = self.mid.next();
    self.mid
  }

  fn next_token(&mut self) -> Token {
    Token::from_bytes(&self.rng.next_u64().to_be_bytes())
  }

  fn check_suspension(&mut self, app: &mut dyn App, now: Instant<C>) {
    if self.status == ConnStatus::Suspended && self.reg.suspension_over(now) {
      self.reg.resume();
      self.begin_registering(app);
    }
  }

  fn begin_registering(&mut self, app: &mut dyn App) {
    self.end_session(app);
    self.set_status(app, ConnStatus::Registering);
  }

  /// Tear down session state (observations, cache, location); socket
  /// handling is the caller's business
  fn end_session(&mut self, app: &mut dyn App) {
    let mut cancelled = ArrayVec::<[Path; cap::MAX_OBSERVATIONS]>::new();
    self.obs.remove_under(Path::root(), &mut |p, _| {
               if !cancelled.is_full() {
                 cancelled.push(p);
               }
             });
    for p in cancelled {
      app.observation_cancelled(p);
    }
    self.obs.clear();
    self.cache.clear();
    self.reg.session_ended();
    self.srv_assembly = None;
    self.srv_block2 = None;
  }

  fn drop_stale_assembly(&mut self, dm: &mut dyn DataModel, now: Instant<C>) {
    if let Some(a) = &self.srv_assembly {
      if now >= a.deadline {
        self.srv_assembly = None;
        self.staging.clear();
        if self.dispatcher.in_progress() {
          self.dispatcher.end(dm, false).ok();
        }
      }
    }
  }

  fn target_addr(&self) -> SocketAddr {
    match self.status {
      | ConnStatus::Bootstrapping => self.server.bootstrap_server.unwrap_or(self.server.server),
      | _ => self.server.server,
    }
  }

  /// True when the socket is connected; drives connect/close toward the
  /// state the status machine wants
  fn ensure_connected(&mut self, now: Instant<C>) -> bool {
    if self.closing {
      match self.sock.close() {
        | Ok(()) | Err(nb::Error::Other(_)) => {
          self.closing = false;
          self.connected = false;
        },
        | Err(nb::Error::WouldBlock) => return false,
      }
    }
    if self.connected {
      return true;
    }

    match self.sock.connect(self.target_addr()) {
      | Ok(()) => {
        self.connected = true;
        self.reg.touch(now);
        true
      },
      | Err(nb::Error::WouldBlock) => false,
      | Err(nb::Error::Other(e)) => {
        log::warn!("connect failed: {:?}", e);
        false
      },
    }
  }

  /// Receive and handle at most one datagram; true when one arrived
  fn pump_inbound(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    if !self.connected {
      return false;
    }

    let n = match self.sock.recv(&mut self.inbuf) {
      | Ok(n) => n,
      | Err(nb::Error::WouldBlock) => return false,
      | Err(nb::Error::Other(e)) => {
        log::warn!("recv failed: {:?}", e);
        self.net_error(dm, app, now);
        return false;
      },
    };

    let msg = match Message::try_from_bytes(&self.inbuf[..n]) {
      | Ok(m) => m,
      | Err(e) => {
        // hostile or truncated datagrams are dropped without an answer
        log::trace!("dropping undecodable datagram: {:?}", e);
        return true;
      },
    };

    log::trace!("recv {}", crate::logging::MsgSummary(&msg));
    self.reg.touch(now);

    if let Some(ex) = &mut self.exchange {
      match ex.on_dgram(&msg, now) {
        | Recv::AckedEmpty => return true,
        | Recv::Finished { needs_ack } => {
          if needs_ack {
            let ack = msg.ack();
            self.transmit(&ack, now);
          }
          return true;
        },
        | Recv::Continue { size } => {
          self.advance_block1(size);
          return true;
        },
        | Recv::NotMine => (),
      }
    }

    self.serve(dm, app, &msg, now);
    true
  }

  /// Advance the Block1 upload window after a 2.31 Continue
  fn advance_block1(&mut self, size: u16) {
    let mid = self.next_mid();
    let staging = &self.staging;
    if let Some(ex) = &mut self.exchange {
      if let Some(mut up) = ex.block() {
        up.off += up.size as usize;
        up.size = size;
        let end = (up.off + size as usize).min(up.total);

        let req = ex.request_mut();
        req.id = mid;
        req.set_block1(size, up.num(), up.more()).ok();
        req.payload = Payload(staging[up.off..end].iter().copied().collect());
        ex.set_block(up);
      }
    }
  }

  /// Collect a finished exchange's outcome and route it; true when one
  /// was handled
  fn finish_exchange(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    let finished = self.exchange
                       .as_ref()
                       .map(|e| e.is_finished())
                       .unwrap_or(false);
    if !finished {
      return false;
    }

    let mut ex = match self.exchange.take() {
      | Some(e) => e,
      | None => return false,
    };
    self.staging.clear();

    let kind = ex.kind;
    let outcome = match ex.take_outcome() {
      | Some(o) => o,
      // outcome already delivered by whoever terminated the exchange
      | None => return true,
    };

    match kind {
      | Kind::Register => self.finish_register(dm, app, outcome, now),
      | Kind::Update => self.finish_update(dm, app, outcome, now),
      | Kind::Deregister => self.finish_deregister(app, outcome, now),
      | Kind::BootstrapRequest => self.finish_bootstrap_request(dm, app, outcome, now),
      | Kind::Notify { slot, con } => self.finish_notify(app, slot, con, outcome),
      | Kind::NotifyComposite { slot, con } => self.finish_notify_composite(app, slot, con, outcome),
      | Kind::Send { id } => self.finish_send(app, id, outcome),
    }
    true
  }

  fn finish_register(&mut self,
                     dm: &mut dyn DataModel,
                     app: &mut dyn App,
                     outcome: Outcome,
                     now: Instant<C>) {
    match outcome {
      | Outcome::Done(resp) if resp.code == Code::CREATED => {
        if self.reg.location_mut().set_from(resp.location_paths()).is_err()
           || !self.reg.location().is_set()
        {
          log::warn!("register response location unusable");
          self.register_attempt_failed(app, now);
          return;
        }
        let shape = reg::shape_hash(dm);
        self.reg.registered(now, &self.cfg.tx, shape);
        self.set_status(app, ConnStatus::Registered);
        log::info!("registered, lifetime {}s", self.reg.lifetime_s);
      },
      | Outcome::Done(_) | Outcome::Timeout | Outcome::Reset => {
        self.register_attempt_failed(app, now);
      },
      | Outcome::Sent | Outcome::Terminated => (),
    }
  }

  fn register_attempt_failed(&mut self, app: &mut dyn App, now: Instant<C>) {
    match self.reg.retry().fail(now, &self.cfg.registration.retry) {
      | SeqVerdict::Backoff | SeqVerdict::NextSequence => {
        log::warn!("register attempt failed, backing off");
      },
      | SeqVerdict::Exhausted => {
        if app.bootstrap_on_registration_failure() && self.server.bootstrap_server.is_some() {
          log::warn!("registration exhausted, falling back to bootstrap");
          self.enter_bootstrap(app);
        } else {
          self.set_status(app, ConnStatus::Failure);
        }
      },
    }
  }

  fn enter_bootstrap(&mut self, app: &mut dyn App) {
    self.end_session(app);
    self.bootstrap.begin();
    self.set_status(app, ConnStatus::Bootstrapping);
    // the bootstrap server is a different peer
    self.closing = true;
  }

  fn finish_update(&mut self,
                   dm: &mut dyn DataModel,
                   app: &mut dyn App,
                   outcome: Outcome,
                   now: Instant<C>) {
    match outcome {
      | Outcome::Done(resp) if resp.code == Code::CHANGED => {
        let shape = reg::shape_hash(dm);
        self.reg.set_shape(shape);
        self.reg.schedule_refresh(now, &self.cfg.tx);
        self.reg.touch(now);
      },
      | Outcome::Done(_) | Outcome::Timeout | Outcome::Reset => {
        // a failed Update degrades to a fresh Register; the register
        // attempt itself counts against the retry budget
        log::warn!("update failed, re-registering");
        self.begin_registering(app);
      },
      | Outcome::Sent | Outcome::Terminated => (),
    }
  }

  fn finish_deregister(&mut self, app: &mut dyn App, outcome: Outcome, now: Instant<C>) {
    // any outcome ends the session; the server either knows or will
    // time the registration out
    let _ = outcome;
    let goal = self.pending_dereg.take();
    self.end_session(app);

    match goal {
      | Some(DeregGoal::Suspend { until }) => {
        let until = until.map(|s| time::add(now, Milliseconds(s as u64 * 1_000)));
        self.reg.suspend(until);
        self.set_status(app, ConnStatus::Suspended);
        self.closing = true;
      },
      | Some(DeregGoal::Restart) | None => {
        self.set_status(app, ConnStatus::Initial);
        self.closing = true;
      },
    }
  }

  fn finish_bootstrap_request(&mut self,
                              _dm: &mut dyn DataModel,
                              app: &mut dyn App,
                              outcome: Outcome,
                              now: Instant<C>) {
    match outcome {
      | Outcome::Done(resp) if resp.code == Code::CHANGED => {
        self.bootstrap.request_accepted();
        log::info!("bootstrap request accepted");
      },
      | Outcome::Done(_) | Outcome::Timeout | Outcome::Reset => {
        self.bootstrap_attempt_failed(app, now);
      },
      | Outcome::Sent | Outcome::Terminated => (),
    }
  }

  fn bootstrap_attempt_failed(&mut self, app: &mut dyn App, now: Instant<C>) {
    match self.bootstrap.attempt_failed(now, &self.cfg.bootstrap) {
      | SeqVerdict::Backoff | SeqVerdict::NextSequence => (),
      | SeqVerdict::Exhausted => self.set_status(app, ConnStatus::Failure),
    }
  }

  fn finish_notify(&mut self, app: &mut dyn App, slot: usize, _con: bool, outcome: Outcome) {
    match outcome {
      | Outcome::Reset if self.cfg.cancel_observe_on_reset => {
        if let Some(o) = self.obs.get(slot) {
          let token = o.token;
          if let Some(path) = self.obs.remove_by_token(token) {
            log::debug!("observation {} cancelled by reset", path);
            app.observation_cancelled(path);
          }
        }
      },
      | _ => (),
    }
  }

  fn finish_notify_composite(&mut self,
                             app: &mut dyn App,
                             slot: usize,
                             _con: bool,
                             outcome: Outcome) {
    match outcome {
      | Outcome::Reset if self.cfg.cancel_observe_on_reset => {
        let token = match self.obs.composite(slot) {
          | Some(c) => c.token,
          | None => return,
        };
        if let Some(dead) = self.obs.remove_composite_by_token(token) {
          log::debug!("composite observation cancelled by reset");
          for m in dead.paths.iter() {
            app.observation_cancelled(*m);
          }
        }
      },
      | _ => (),
    }
  }

  fn finish_send(&mut self, app: &mut dyn App, id: u16, outcome: Outcome) {
    let result = match outcome {
      | Outcome::Done(resp) if resp.code == Code::CHANGED => SendResult::Success,
      | Outcome::Done(_) | Outcome::Reset => SendResult::Rejected,
      | Outcome::Timeout => SendResult::Timeout,
      | Outcome::Terminated => SendResult::Abort,
      | Outcome::Sent => SendResult::Success,
    };
    app.send_finished(id, result);
  }

  /// Start new exchanges as the state machine allows; true when
  /// anything started or a state moved
  fn advance_drivers(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    match self.status {
      | ConnStatus::Initial => {
        if self.server.initiate_bootstrap && self.server.bootstrap_server.is_some() {
          self.enter_bootstrap(app);
        } else {
          self.set_status(app, ConnStatus::Registering);
        }
        true
      },
      | ConnStatus::Bootstrapping => self.advance_bootstrap(dm, app, now),
      | ConnStatus::Registering => self.advance_register(dm, app, now),
      | ConnStatus::Registered => self.advance_session(dm, app, now),
      | ConnStatus::QueueMode => self.advance_queue_mode(dm, app, now),
      | ConnStatus::Suspended if self.pending_dereg.is_some() => {
        self.finish_deregister(app, Outcome::Sent, now);
        true
      },
      | ConnStatus::Suspended | ConnStatus::Failure => false,
    }
  }

  fn advance_bootstrap(&mut self, _dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    if self.bootstrap.timed_out(now) {
      if let Some(ex) = &mut self.exchange {
        ex.terminate();
        ex.take_outcome();
      }
      self.exchange = None;
      self.bootstrap_attempt_failed(app, now);
      return true;
    }

    match self.bootstrap.state() {
      | BsState::Connecting if self.exchange.is_none() && self.bootstrap.ready(now) => {
        if !self.ensure_connected(now) {
          return false;
        }
        self.bootstrap.attempt_started(now, &self.cfg.bootstrap);
        self.start_bootstrap_request(app, now);
        true
      },
      | BsState::Finished => {
        // provisioning done; the management server may have changed
        self.begin_registering(app);
        self.closing = true;
        true
      },
      | BsState::Failed => {
        self.set_status(app, ConnStatus::Failure);
        true
      },
      | _ => false,
    }
  }

  fn start_bootstrap_request(&mut self, app: &mut dyn App, now: Instant<C>) {
    let (mid, token) = (self.next_mid(), self.next_token());
    let mut m = Message::new(Type::Con, Code::POST, mid, token);
    m.set_path("bs").ok();

    let mut q = ArrayVec::<[u8; 64]>::new();
    let mut w = Writable::new(&mut q);
    write!(w, "ep={}", self.server.endpoint).ok();
    if let Ok(s) = core::str::from_utf8(&q) {
      m.add_query(s).ok();
    }

    let pct = codec::choose(None, true, &mut |f| app.codec(f).is_some());
    if let Some(f) = pct {
      let mut q = ArrayVec::<[u8; 16]>::new();
      let mut w = Writable::new(&mut q);
      write!(w, "pct={}", u16::from(&f)).ok();
      if let Ok(s) = core::str::from_utf8(&q) {
        m.add_query(s).ok();
      }
    }

    let mut ex = Exchange::new(Kind::BootstrapRequest, m);
    ex.set_deadline(time::add(now, self.cfg.bootstrap.timeout));
    self.exchange = Some(ex);
  }

  fn advance_register(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    // a Disable/restart issued before registration completes short-
    // circuits; there is no registration to tear down yet
    if self.pending_dereg.is_some() {
      if let Some(ex) = &mut self.exchange {
        ex.terminate();
        ex.take_outcome();
      }
      self.exchange = None;
      self.finish_deregister(app, Outcome::Sent, now);
      return true;
    }

    if self.exchange.is_some() || !self.reg.retry().ready(now) {
      return false;
    }
    if !self.ensure_connected(now) {
      return false;
    }

    match self.start_register(dm, now) {
      | Ok(()) => true,
      | Err(e) => {
        log::error!("cannot build register request: {:?}", e);
        false
      },
    }
  }

  fn start_register(&mut self, dm: &mut dyn DataModel, now: Instant<C>) -> Result<(), Error> {
    self.staging.clear();
    link::write_registration(dm, &mut self.staging)?;

    let (mid, token) = (self.next_mid(), self.next_token());
    let mut m = Message::new(Type::Con, Code::POST, mid, token);
    m.set_path("rd")?;
    m.set_content_format(ContentFormat::LinkFormat)?;

    self.add_reg_queries(&mut m)?;

    self.reg.retry().attempt_started();
    self.start_staged(Kind::Register, m, now);
    Ok(())
  }

  fn add_reg_queries(&mut self, m: &mut Message) -> Result<(), Error> {
    let mut buf = ArrayVec::<[u8; 64]>::new();

    {
      let mut w = Writable::new(&mut buf);
      write!(w, "ep={}", self.server.endpoint).ok();
      if w.overflowed() {
        return Err(Error::Memory);
      }
    }
    m.add_query(core::str::from_utf8(&buf).map_err(|_| Error::InvalidArg)?)?;

    buf.clear();
    {
      let mut w = Writable::new(&mut buf);
      write!(w, "lt={}", self.reg.lifetime_s).ok();
    }
    m.add_query(core::str::from_utf8(&buf).map_err(|_| Error::InvalidArg)?)?;

    buf.clear();
    {
      let mut w = Writable::new(&mut buf);
      write!(w, "lwm2m={}", self.server.lwm2m_version).ok();
    }
    m.add_query(core::str::from_utf8(&buf).map_err(|_| Error::InvalidArg)?)?;

    buf.clear();
    {
      let mut w = Writable::new(&mut buf);
      write!(w, "b={}", self.sock.transport().binding()).ok();
    }
    m.add_query(core::str::from_utf8(&buf).map_err(|_| Error::InvalidArg)?)?;

    if self.cfg.registration.queue_mode.is_some() {
      m.add_query("Q")?;
    }
    Ok(())
  }

  /// Hand a request whose body sits in `staging` to the exchange,
  /// block-wise when it doesn't fit one block
  fn start_staged(&mut self, kind: Kind, mut m: Message, _now: Instant<C>) {
    let block_size = exchange::negotiated_block_size(self.sock.inner_mtu());
    let total = self.staging.len();

    let mut ex = if total > block_size as usize {
      let up = BlockUpload { size: block_size,
                             off: 0,
                             total };
      m.set_block1(block_size, 0, true).ok();
      m.payload = Payload(self.staging[..block_size as usize].iter().copied().collect());
      let mut ex = Exchange::new(kind, m);
      ex.set_block(up);
      ex
    } else {
      if total > 0 {
        m.payload = Payload(self.staging.iter().copied().collect());
      }
      Exchange::new(kind, m)
    };

    if kind == Kind::Register || kind == Kind::Update {
      // overall bound so a half-dead server cannot wedge the driver
      ex.set_deadline(time::add(_now, self.cfg.tx.exchange_lifetime()));
    }

    self.exchange = Some(ex);
  }

  fn advance_session(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    if self.exchange.is_some() {
      return false;
    }
    if !self.ensure_connected(now) {
      return false;
    }

    // priority: deregister > register/update > notification > send
    if self.pending_dereg.is_some() {
      return self.start_deregister(app, now);
    }

    if let Some(reason) = self.reg.update_due(now) {
      return self.start_update(dm, now, reason).is_ok();
    }

    if let Some((slot, force_con)) = self.obs.poll_due(now) {
      return self.start_notify(dm, app, slot, force_con, now);
    }

    if let Some((slot, force_con)) = self.obs.poll_due_composite(now) {
      return self.start_notify_composite(dm, app, slot, force_con, now);
    }

    if !self.send_q.is_empty() && !app.mute_send() {
      return self.start_send(dm, app, now);
    }

    false
  }

  fn advance_queue_mode(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    let wants_out = self.pending_dereg.is_some()
                    || self.reg.update_due(now).is_some()
                    || self.obs.poll_due(now).is_some()
                    || self.obs.poll_due_composite(now).is_some()
                    || (!self.send_q.is_empty() && !app.mute_send());
    if !wants_out {
      return false;
    }

    if !self.connected {
      self.sock.reuse_last_port().ok();
    }
    if !self.ensure_connected(now) {
      return false;
    }

    self.reg.touch(now);
    self.set_status(app, ConnStatus::Registered);
    true
  }

  fn start_deregister(&mut self, app: &mut dyn App, now: Instant<C>) -> bool {
    if !self.reg.location().is_set() {
      // never actually registered; jump straight to the goal state
      self.finish_deregister(app, Outcome::Sent, now);
      return true;
    }

    let (mid, token) = (self.next_mid(), self.next_token());
    let mut m = Message::new(Type::Con, Code::DELETE, mid, token);
    for seg in self.reg.location().iter() {
      m.add_path_segment(seg).ok();
    }

    self.staging.clear();
    self.start_staged(Kind::Deregister, m, now);
    true
  }

  fn start_update(&mut self,
                  dm: &mut dyn DataModel,
                  now: Instant<C>,
                  reason: UpdateReason)
                  -> Result<(), Error> {
    self.reg.update_started();

    let shape = reg::shape_hash(dm);
    self.staging.clear();
    if self.reg.shape_changed(shape) {
      link::write_registration(dm, &mut self.staging)?;
    }

    let (mid, token) = (self.next_mid(), self.next_token());
    let mut m = Message::new(Type::Con, Code::POST, mid, token);
    for seg in self.reg.location().iter() {
      m.add_path_segment(seg)?;
    }
    if !self.staging.is_empty() {
      m.set_content_format(ContentFormat::LinkFormat)?;
    }

    if reason == UpdateReason::Lifetime {
      let mut buf = ArrayVec::<[u8; 32]>::new();
      {
        let mut w = Writable::new(&mut buf);
        write!(w, "lt={}", self.reg.lifetime_s).ok();
      }
      m.add_query(core::str::from_utf8(&buf).map_err(|_| Error::InvalidArg)?)?;
    }

    log::debug!("update ({:?})", reason);
    self.start_staged(Kind::Update, m, now);
    Ok(())
  }

  fn start_notify(&mut self,
                  dm: &mut dyn DataModel,
                  app: &mut dyn App,
                  slot: usize,
                  force_con: bool,
                  now: Instant<C>)
                  -> bool {
    let (path, token, format, seq) = match self.obs.get(slot) {
      | Some(o) => (o.path, o.token, o.format, o.next_seq()),
      | None => return false,
    };

    let mut body = Payload::default();
    let mut numeric = None;
    let format = format.unwrap_or(ContentFormat::Text);
    match self.encode_read(dm, app, path, format, &mut body, &mut numeric) {
      | Ok(()) => (),
      | Err(_) => {
        // the entity went away under the observation
        self.entity_removed(app, path);
        return true;
      },
    }

    let ty = if force_con { Type::Con } else { Type::Non };
    let mid = self.next_mid();
    let mut m = Message::new(ty, Code::CONTENT, mid, token);
    m.set_observe(seq).ok();
    m.set_content_format(format).ok();
    m.payload = body;

    let mut ex = Exchange::new(Kind::Notify { slot,
                                             con: force_con },
                               m);
    if force_con {
      ex.complete_on_ack();
    }
    self.exchange = Some(ex);
    self.obs.mark_sent(slot, now, force_con, numeric);
    true
  }

  fn start_notify_composite(&mut self,
                            dm: &mut dyn DataModel,
                            app: &mut dyn App,
                            slot: usize,
                            force_con: bool,
                            now: Instant<C>)
                            -> bool {
    let (token, format, paths, seq) = match self.obs.composite(slot) {
      | Some(c) => (c.token, c.format, c.paths, c.next_seq()),
      | None => return false,
    };

    let mut body = Payload::default();
    let encoded = match app.codec(format) {
      | Some(codec) => {
        let mut ok = codec.begin_encode(Path::root(), paths.len(), &mut body)
                          .is_ok();
        if ok {
          for p in paths.iter() {
            let r = dm::iterate(dm, *p, &mut |p, v| {
                codec.encode_entry(p, &v, &mut body)
                     .map_err(|_| DmError::Memory)
              });
            match r {
              // absent members are skipped, not fatal
              | Err(DmError::NotFound) | Ok(()) => (),
              | Err(_) => {
                ok = false;
                break;
              },
            }
          }
        }
        ok && codec.end_encode(&mut body).is_ok()
      },
      | None => false,
    };

    if !encoded {
      // the codec went away or the body cannot be built; the
      // observation cannot be honored any more
      if let Some(dead) = self.obs.remove_composite_by_token(token) {
        log::warn!("composite observation dropped: encoding failed");
        for m in dead.paths.iter() {
          app.observation_cancelled(*m);
        }
      }
      return true;
    }

    let ty = if force_con { Type::Con } else { Type::Non };
    let mid = self.next_mid();
    let mut m = Message::new(ty, Code::CONTENT, mid, token);
    m.set_observe(seq).ok();
    m.set_content_format(format).ok();
    m.payload = body;

    let mut ex = Exchange::new(Kind::NotifyComposite { slot,
                                                       con: force_con },
                               m);
    if force_con {
      ex.complete_on_ack();
    }
    self.exchange = Some(ex);
    self.obs.mark_composite_sent(slot, now, force_con);
    true
  }

  fn start_send(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    let req = match self.send_q.pop_front() {
      | Some(r) => r,
      | None => return false,
    };

    let mut body = Payload::default();
    let result = self.encode_send_body(dm, app, &req, &mut body);
    if let Err(e) = result {
      log::warn!("send {} encoding failed: {:?}", req.id, e);
      app.send_finished(req.id, SendResult::Internal);
      return true;
    }

    let (mid, token) = (self.next_mid(), self.next_token());
    let mut m = Message::new(Type::Con, Code::POST, mid, token);
    m.set_path("dp").ok();
    m.set_content_format(req.format).ok();
    m.payload = body;

    self.staging.clear();
    let mut ex = Exchange::new(Kind::Send { id: req.id }, m);
    ex.set_deadline(time::add(now, self.cfg.tx.exchange_lifetime()));
    self.exchange = Some(ex);
    true
  }

  fn encode_send_body(&mut self,
                      dm: &mut dyn DataModel,
                      app: &mut dyn App,
                      req: &crate::send::SendRequest,
                      out: &mut Payload)
                      -> Result<(), Error> {
    let codec = match app.codec(req.format) {
      | Some(c) => c,
      | None => return Err(Error::NotImplemented),
    };

    codec.begin_encode(Path::root(), req.paths.len(), out)
         .map_err(|_| Error::Memory)?;
    for path in req.paths.iter() {
      dm::read_value(dm, *path, &mut |p, v| {
          codec.encode_entry(p, &v, out).map_err(|_| DmError::Memory)
        }).map_err(Error::Dm)?;
    }
    codec.end_encode(out).map_err(|_| Error::Memory)
  }

  /// Encode the current value(s) under `base` with `format` into `out`;
  /// also reports the first numeric value seen (observation snapshot)
  fn encode_read(&mut self,
                 dm: &mut dyn DataModel,
                 app: &mut dyn App,
                 base: Path,
                 format: ContentFormat,
                 out: &mut Payload,
                 numeric: &mut Option<f64>)
                 -> Result<(), DmError> {
    let plain = &mut self.plain;
    let codec: &mut dyn PayloadCodec = if format == ContentFormat::Text {
      plain
    } else {
      match app.codec(format) {
        | Some(c) => c,
        | None => return Err(DmError::NotImplemented),
      }
    };

    let hint = if base.len() >= 3 { 1 } else { 2 };
    codec.begin_encode(base, hint, out).map_err(|_| DmError::Memory)?;

    let mut any = false;
    dm::iterate(dm, base, &mut |p, v| {
        any = true;
        *numeric = numeric.or_else(|| v.numeric());
        codec.encode_entry(p, &v, out).map_err(|_| DmError::Memory)
      })?;

    if !any && base.len() >= 3 {
      return Err(DmError::NotFound);
    }
    codec.end_encode(out).map_err(|_| DmError::Memory)
  }

  /// Push the active exchange's datagram out; true when bytes moved
  fn pump_outbound(&mut self, dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) -> bool {
    if !self.connected {
      return false;
    }

    let action = match &mut self.exchange {
      | Some(ex) => ex.poll(now),
      | None => return false,
    };

    match action {
      | Some(Action::Transmit) => {
        let n = match self.exchange
                          .as_ref()
                          .map(|ex| ex.request().try_into_bytes(&mut self.outbuf))
        {
          | Some(Ok(n)) => n,
          | _ => {
            log::error!("request does not fit the outbound buffer");
            if let Some(ex) = &mut self.exchange {
              ex.terminate();
            }
            return true;
          },
        };

        match self.sock.send(&self.outbuf[..n]) {
          | Ok(_) => {
            let tx = self.cfg.tx;
            if let Some(ex) = &mut self.exchange {
              ex.on_transmitted(now, &tx, &mut self.rng);
            }
            self.reg.touch(now);
            true
          },
          | Err(nb::Error::WouldBlock) => false,
          | Err(nb::Error::Other(e)) => {
            log::warn!("send failed: {:?}", e);
            match S::error_kind(&e) {
              // too big for the link: retrying the same datagram cannot
              // help, but the connection itself is fine
              | SockErrorKind::Msgsize => {
                if let Some(ex) = &mut self.exchange {
                  ex.terminate();
                }
              },
              | _ => self.net_error(dm, app, now),
            }
            true
          },
        }
      },
      | None => false,
    }
  }

  /// Fire-and-forget transmit for ACKs, RSTs, and cached replays
  fn transmit(&mut self, msg: &Message, _now: Instant<C>) {
    if let Ok(n) = msg.try_into_bytes(&mut self.outbuf) {
      self.sock.send(&self.outbuf[..n]).ok();
    }
  }

  /// A hard socket error; what happens next depends on the phase
  fn net_error(&mut self, _dm: &mut dyn DataModel, app: &mut dyn App, now: Instant<C>) {
    if let Some(mut ex) = self.exchange.take() {
      ex.terminate();
      ex.take_outcome();
      // completion callbacks still fire exactly once
      if let Kind::Send { id } = ex.kind {
        app.send_finished(id, SendResult::Network);
      }
    }
    self.connected = false;

    match self.status {
      | ConnStatus::Registered | ConnStatus::QueueMode => {
        // active session: try to re-register
        self.begin_registering(app);
      },
      | ConnStatus::Registering => self.register_attempt_failed(app, now),
      | ConnStatus::Bootstrapping => self.bootstrap_attempt_failed(app, now),
      | _ => (),
    }
  }

  fn check_queue_mode(&mut self, app: &mut dyn App, now: Instant<C>) {
    let timeout = match self.cfg.registration.queue_mode {
      | Some(qm) => qm.timeout,
      | None => return,
    };
    if self.status != ConnStatus::Registered || self.exchange.is_some() {
      return;
    }

    if let Some(at) = self.reg.queue_mode_closes_at(timeout) {
      if now >= at {
        log::debug!("queue mode: closing socket");
        match self.sock.close() {
          | Ok(()) | Err(nb::Error::Other(_)) => self.connected = false,
          | Err(nb::Error::WouldBlock) => {
            self.closing = true;
            self.connected = false;
          },
        }
        self.set_status(app, ConnStatus::QueueMode);
      }
    }
  }
}

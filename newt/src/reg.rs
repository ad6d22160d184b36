//! Registration driver bookkeeping: the registration session's location,
//! lifetime scheduling, update triggers, retry budget, and queue-mode
//! timing. The engine (`client`) owns the status machine and the I/O.

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use tinyvec::ArrayVec;

use crate::config::{cap, TxParams};
use crate::dm::DataModel;
use crate::retry::Sequence;
use crate::time::{self, Clock, Millis};

/// The externally-visible connection status, reported through
/// [`crate::client::App::connection_status_changed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
  /// Engine constructed, nothing attempted yet
  Initial,
  /// Talking to the bootstrap server
  Bootstrapping,
  /// Register (or re-register) in progress
  Registering,
  /// Registered and reachable
  Registered,
  /// Registered, but the socket is closed until we have something to
  /// say
  QueueMode,
  /// Deregistered on purpose for a while (Disable)
  Suspended,
  /// Out of options
  Failure,
}

/// The Location-Path segments a Register response assigned us, replayed
/// on Update and Deregister.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Locations {
  segs: ArrayVec<[ArrayVec<[u8; cap::MAX_LOCATION_PATH_LEN]>; cap::MAX_LOCATION_PATHS]>,
}

impl Locations {
  /// Store the segments of a Register response, bounded by the
  /// compile-time caps
  pub fn set_from<'a>(&mut self, segs: impl Iterator<Item = &'a str>) -> Result<(), crate::Error> {
    self.segs.clear();
    for seg in segs {
      if seg.len() > cap::MAX_LOCATION_PATH_LEN || self.segs.len() == cap::MAX_LOCATION_PATHS {
        self.segs.clear();
        return Err(crate::Error::NoSpace);
      }
      self.segs.push(seg.as_bytes().iter().copied().collect());
    }
    Ok(())
  }

  /// The stored segments, in order
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.segs
        .iter()
        .filter_map(|s| core::str::from_utf8(s).ok())
  }

  /// Do we hold a registration location?
  pub fn is_set(&self) -> bool {
    !self.segs.is_empty()
  }

  /// Forget the location (session ended)
  pub fn clear(&mut self) {
    self.segs.clear();
  }
}

/// Why the next Update will be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
  /// The scheduled lifetime refresh came due
  Refresh,
  /// The application changed the lifetime
  Lifetime,
  /// The data-model shape changed (instance added/removed)
  Shape,
  /// Server/x/8 Registration Update Trigger was executed
  Trigger,
}

/// Session bookkeeping for the registration driver
#[derive(Debug)]
pub struct Registration<C: Clock> {
  /// Registration lifetime in seconds, as last told to the server
  pub lifetime_s: u32,
  location: Locations,
  seq: Sequence<C>,
  next_refresh: Option<Instant<C>>,
  pending_update: Option<UpdateReason>,
  shape: u64,
  last_activity: Option<Instant<C>>,
  suspended_until: Option<Option<Instant<C>>>,
}

impl<C: Clock> Registration<C> {
  /// Fresh session state with the configured lifetime
  pub fn new(lifetime_s: u32) -> Self {
    Self { lifetime_s,
           location: Locations::default(),
           seq: Sequence::default(),
           next_refresh: None,
           pending_update: None,
           shape: 0,
           last_activity: None,
           suspended_until: None }
  }

  #[allow(missing_docs)]
  pub fn location(&self) -> &Locations {
    &self.location
  }

  #[allow(missing_docs)]
  pub fn location_mut(&mut self) -> &mut Locations {
    &mut self.location
  }

  #[allow(missing_docs)]
  pub fn retry(&mut self) -> &mut Sequence<C> {
    &mut self.seq
  }

  /// Register succeeded: record the shape we told the server, schedule
  /// the refresh, and clear retry history
  pub fn registered(&mut self, now: Instant<C>, tx: &TxParams, shape: u64) {
    self.seq.reset();
    self.shape = shape;
    self.pending_update = None;
    self.schedule_refresh(now, tx);
    self.touch(now);
  }

  /// Schedule the periodic Update: at `lifetime − MAX_TRANSMIT_WAIT`,
  /// or at half the lifetime when the lifetime is too short for that
  pub fn schedule_refresh(&mut self, now: Instant<C>, tx: &TxParams) {
    let lifetime = Milliseconds(self.lifetime_s as u64 * 1_000);
    let Milliseconds(wait) = tx.max_transmit_wait();
    let Milliseconds(life) = lifetime;

    let delay = if life < 2 * wait {
      Milliseconds(life / 2)
    } else {
      Milliseconds(life - wait)
    };
    self.next_refresh = Some(time::add(now, delay));
  }

  /// Ask for an Update (the scheduler sends it when the exchange slot
  /// frees up). Refresh never overrides a stronger reason.
  pub fn request_update(&mut self, reason: UpdateReason) {
    self.pending_update = match (self.pending_update, reason) {
      | (Some(prev), UpdateReason::Refresh) => Some(prev),
      | _ => Some(reason),
    };
  }

  /// Is an Update wanted right now?
  pub fn update_due(&mut self, now: Instant<C>) -> Option<UpdateReason> {
    if let Some(at) = self.next_refresh {
      if now >= at {
        self.next_refresh = None;
        self.request_update(UpdateReason::Refresh);
      }
    }
    self.pending_update
  }

  /// The pending Update made it onto the wire
  pub fn update_started(&mut self) -> Option<UpdateReason> {
    self.pending_update.take()
  }

  /// Does the data model's current shape require a payload on Update?
  pub fn shape_changed(&self, shape: u64) -> bool {
    self.shape != shape
  }

  /// Remember the shape last conveyed to the server
  pub fn set_shape(&mut self, shape: u64) {
    self.shape = shape;
  }

  /// Note traffic on the connection (for queue-mode accounting)
  pub fn touch(&mut self, now: Instant<C>) {
    self.last_activity = Some(now);
  }

  /// When the queue-mode timeout lands, if queue mode is on and the
  /// session is live
  pub fn queue_mode_closes_at(&self, timeout: Millis) -> Option<Instant<C>> {
    self.last_activity.map(|t| time::add(t, timeout))
  }

  /// Suspend until `until` (`None` = indefinitely) after a Disable
  pub fn suspend(&mut self, until: Option<Instant<C>>) {
    self.suspended_until = Some(until);
  }

  /// Clear suspension; yields true when we were suspended
  pub fn resume(&mut self) -> bool {
    self.suspended_until.take().is_some()
  }

  /// Is the suspension over?
  pub fn suspension_over(&self, now: Instant<C>) -> bool {
    match self.suspended_until {
      | Some(Some(until)) => now >= until,
      | Some(None) => false,
      | None => true,
    }
  }

  /// When suspension ends, if it does
  pub fn suspension_deadline(&self) -> Option<Instant<C>> {
    self.suspended_until.flatten()
  }

  /// The session ended (deregister, failure, restart)
  pub fn session_ended(&mut self) {
    self.location.clear();
    self.next_refresh = None;
    self.pending_update = None;
    self.last_activity = None;
  }

  /// When this driver needs attention next
  pub fn next_deadline(&self) -> Option<Instant<C>> {
    time::min_instant(self.next_refresh,
                      time::min_instant(self.seq.next_at(), self.suspension_deadline()))
  }
}

/// A cheap fingerprint of the data-model shape (objects, versions,
/// instances): when it changes, the next Update carries a fresh
/// registration payload.
pub fn shape_hash(dm: &mut dyn DataModel) -> u64 {
  // FNV-1a over the id stream
  const BASIS: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;

  let mut h = BASIS;
  let mut mix = |h: &mut u64, b: u8| {
    *h ^= b as u64;
    *h = h.wrapping_mul(PRIME);
  };

  let mut ix = 0;
  while let Some(oid) = dm.oid_at(ix) {
    ix += 1;
    for b in oid.to_be_bytes() {
      mix(&mut h, b);
    }
    if let Some(obj) = dm.object(oid) {
      if let Some(ver) = obj.version() {
        for b in ver.as_bytes() {
          mix(&mut h, *b);
        }
      }
      obj.instance_ids(&mut |iid| {
           for b in iid.to_be_bytes() {
             mix(&mut h, b);
           }
         });
    }
    mix(&mut h, 0xFF);
  }
  h
}

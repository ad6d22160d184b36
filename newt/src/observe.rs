use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use newt_msg::{ContentFormat, Token};
use tinyvec::ArrayVec;

use crate::config::cap;
use crate::error::Error;
use crate::path::Path;
use crate::time::{self, Clock, Millis};

/// A non-confirmable observation must send one confirmable notification
/// at least this often, so a silently-vanished observer is eventually
/// noticed.
pub const CONFIRMABLE_EVERY: Millis = Milliseconds(24 * 60 * 60 * 1_000);

/// Notification attributes attachable to any path (LwM2M
/// Write-Attributes).
///
/// `None` means "not set here"; resolution walks up the path hierarchy
/// with the most specific level winning ([`Observations::effective`]).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attributes {
  /// Minimum seconds between notifications
  pub pmin: Option<u32>,
  /// Maximum seconds between notifications
  pub pmax: Option<u32>,
  /// Notify when the value crosses this threshold upward
  pub gt: Option<f64>,
  /// Notify when the value crosses this threshold downward
  pub lt: Option<f64>,
  /// Notify only when the value moved at least this far
  pub st: Option<f64>,
  /// Minimum evaluation period for composite observations
  pub epmin: Option<u32>,
  /// Maximum evaluation period for composite observations
  pub epmax: Option<u32>,
}

impl Attributes {
  /// No attribute set at all?
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// `self` where set, `fallback` otherwise
  pub fn overlay(&self, fallback: &Attributes) -> Attributes {
    Attributes { pmin: self.pmin.or(fallback.pmin),
                 pmax: self.pmax.or(fallback.pmax),
                 gt: self.gt.or(fallback.gt),
                 lt: self.lt.or(fallback.lt),
                 st: self.st.or(fallback.st),
                 epmin: self.epmin.or(fallback.epmin),
                 epmax: self.epmax.or(fallback.epmax) }
  }

  /// Does a move from `last` to `new` count as a significant change
  /// under these attributes?
  ///
  /// With none of `st`/`gt`/`lt` set, every change is significant. With
  /// any set, the change must satisfy at least one: a big enough step,
  /// or a threshold crossing.
  pub fn significant(&self, last: Option<f64>, new: Option<f64>) -> bool {
    let (last, new) = match (last, new) {
      // non-numeric values (or the very first sample) always count
      | (None, _) | (_, None) => return true,
      | (Some(l), Some(n)) => (l, n),
    };

    if self.st.is_none() && self.gt.is_none() && self.lt.is_none() {
      return last != new;
    }

    let stepped = self.st.map(|st| (new - last).abs() >= st).unwrap_or(false);
    let crossed_gt = self.gt
                         .map(|gt| (last < gt) != (new < gt))
                         .unwrap_or(false);
    let crossed_lt = self.lt
                         .map(|lt| (last < lt) != (new < lt))
                         .unwrap_or(false);

    stepped || crossed_gt || crossed_lt
  }
}

/// One active observation, keyed by `(path, token)`.
#[derive(Debug)]
pub struct Observation<C: Clock> {
  /// The observed path
  pub path: Path,
  /// The token the server chose in its Observe request; every
  /// notification echoes it
  pub token: Token,
  /// Content format negotiated when the observation was made
  pub format: Option<ContentFormat>,
  seq: u32,
  last_value: Option<f64>,
  pending: bool,
  last_sent: Instant<C>,
  last_con: Instant<C>,
}

// not derived: deriving would demand C: Copy, and clocks are rarely Copy
impl<C: Clock> Copy for Observation<C> {}
impl<C: Clock> Clone for Observation<C> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<C: Clock> Observation<C> {
  /// The sequence number the next notification must carry
  pub fn next_seq(&self) -> u32 {
    newt_msg::observe::seq(self.seq.wrapping_add(1))
  }

  /// The sequence number most recently sent
  pub fn seq(&self) -> u32 {
    self.seq
  }
}

/// One active composite observation (Observe-Composite, LwM2M 1.2):
/// several paths reported together under a single token, paced by the
/// `epmin`/`epmax` attributes.
#[derive(Debug)]
pub struct CompositeObservation<C: Clock> {
  /// The server-chosen token every notification echoes
  pub token: Token,
  /// The multi-entry format the response negotiated
  pub format: ContentFormat,
  /// The member paths, in request order
  pub paths: ArrayVec<[Path; cap::COMPOSITE_PATHS]>,
  seq: u32,
  pending: bool,
  last_sent: Instant<C>,
  last_con: Instant<C>,
}

impl<C: Clock> Copy for CompositeObservation<C> {}
impl<C: Clock> Clone for CompositeObservation<C> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<C: Clock> CompositeObservation<C> {
  /// The sequence number the next notification must carry
  pub fn next_seq(&self) -> u32 {
    newt_msg::observe::seq(self.seq.wrapping_add(1))
  }

  /// The sequence number most recently sent
  pub fn seq(&self) -> u32 {
    self.seq
  }
}

/// Fixed tables of observations and write-attributes.
#[derive(Debug)]
pub struct Observations<C: Clock> {
  obs: [Option<Observation<C>>; cap::MAX_OBSERVATIONS],
  comp: [Option<CompositeObservation<C>>; cap::MAX_COMPOSITE_OBSERVATIONS],
  attrs: [Option<(Path, Attributes)>; cap::MAX_WRITE_ATTRS],
}

impl<C: Clock> Default for Observations<C> {
  fn default() -> Self {
    Self { obs: [None; cap::MAX_OBSERVATIONS],
           comp: [None; cap::MAX_COMPOSITE_OBSERVATIONS],
           attrs: [None; cap::MAX_WRITE_ATTRS] }
  }
}

impl<C: Clock> Observations<C> {
  /// Start (or restart) observing `path` with the server-chosen `token`
  pub fn add(&mut self,
             path: Path,
             token: Token,
             format: Option<ContentFormat>,
             initial_value: Option<f64>,
             now: Instant<C>)
             -> Result<(), Error> {
    if let Some(slot) = self.find_mut(path, token) {
      slot.format = format;
      slot.last_value = initial_value;
      slot.pending = false;
      slot.last_sent = now;
      return Ok(());
    }

    let slot = self.obs
                   .iter_mut()
                   .find(|s| s.is_none())
                   .ok_or(Error::NoSpace)?;
    *slot = Some(Observation { path,
                               token,
                               format,
                               seq: 0,
                               last_value: initial_value,
                               pending: false,
                               last_sent: now,
                               last_con: now });
    Ok(())
  }

  fn find_mut(&mut self, path: Path, token: Token) -> Option<&mut Observation<C>> {
    self.obs
        .iter_mut()
        .flatten()
        .find(|o| o.path == path && o.token == token)
  }

  /// Cancel the observation using `token`, yielding its path
  pub fn remove_by_token(&mut self, token: Token) -> Option<Path> {
    for slot in self.obs.iter_mut() {
      if slot.map(|o| o.token == token).unwrap_or(false) {
        return slot.take().map(|o| o.path);
      }
    }
    None
  }

  /// Cancel every observation under `prefix` (the entity was removed),
  /// reporting each through `cancelled`.
  ///
  /// A composite observation sheds the members under `prefix` and lives
  /// on; it is cancelled only when its last member goes.
  pub fn remove_under(&mut self, prefix: Path, cancelled: &mut dyn FnMut(Path, Token)) {
    for slot in self.obs.iter_mut() {
      if slot.map(|o| o.path.starts_with(&prefix)).unwrap_or(false) {
        if let Some(o) = slot.take() {
          cancelled(o.path, o.token);
        }
      }
    }

    for slot in self.comp.iter_mut() {
      let mut c = match slot {
        | Some(c) => *c,
        | None => continue,
      };
      let before = c.paths.len();
      c.paths.retain(|m| !m.starts_with(&prefix));
      if c.paths.len() == before {
        continue;
      }
      if c.paths.is_empty() {
        if let Some(dead) = slot.take() {
          for m in dead.paths.iter() {
            cancelled(*m, dead.token);
          }
        }
      } else {
        *slot = Some(c);
      }
    }
  }

  /// Cancel everything (the registration session ended)
  pub fn clear(&mut self) {
    self.obs = [None; cap::MAX_OBSERVATIONS];
    self.comp = [None; cap::MAX_COMPOSITE_OBSERVATIONS];
  }

  /// Start (or restart) a composite observation over `paths` with the
  /// server-chosen `token`
  pub fn add_composite(&mut self,
                       paths: &[Path],
                       token: Token,
                       format: ContentFormat,
                       now: Instant<C>)
                       -> Result<(), Error> {
    if paths.is_empty() || paths.len() > cap::COMPOSITE_PATHS {
      return Err(Error::InvalidArg);
    }

    if let Some(c) = self.comp
                         .iter_mut()
                         .flatten()
                         .find(|c| c.token == token)
    {
      c.format = format;
      c.paths = paths.iter().copied().collect();
      c.pending = false;
      c.last_sent = now;
      return Ok(());
    }

    let slot = self.comp
                   .iter_mut()
                   .find(|s| s.is_none())
                   .ok_or(Error::NoSpace)?;
    *slot = Some(CompositeObservation { token,
                                        format,
                                        paths: paths.iter().copied().collect(),
                                        seq: 0,
                                        pending: false,
                                        last_sent: now,
                                        last_con: now });
    Ok(())
  }

  /// Cancel the composite observation using `token`, yielding it
  pub fn remove_composite_by_token(&mut self, token: Token) -> Option<CompositeObservation<C>> {
    for slot in self.comp.iter_mut() {
      if slot.map(|c| c.token == token).unwrap_or(false) {
        return slot.take();
      }
    }
    None
  }

  /// Borrow a composite slot by index
  pub fn composite(&self, ix: usize) -> Option<&CompositeObservation<C>> {
    self.comp.get(ix).and_then(Option::as_ref)
  }

  /// How many composite observations are active
  pub fn composite_len(&self) -> usize {
    self.comp.iter().flatten().count()
  }

  /// The evaluation window a composite observation runs under: the
  /// strictest `epmin` (largest) and strictest `epmax` (smallest) of its
  /// members' effective attributes
  fn composite_window(&self, c: &CompositeObservation<C>) -> (Option<u32>, Option<u32>) {
    let mut epmin: Option<u32> = None;
    let mut epmax: Option<u32> = None;
    for m in c.paths.iter() {
      let a = self.effective(*m);
      epmin = match (epmin, a.epmin) {
        | (Some(x), Some(y)) => Some(x.max(y)),
        | (x, y) => x.or(y),
      };
      epmax = match (epmax, a.epmax) {
        | (Some(x), Some(y)) => Some(x.min(y)),
        | (x, y) => x.or(y),
      };
    }
    (epmin, epmax)
  }

  /// Find a composite observation whose notification is due: a pending
  /// change past `epmin`, or an `epmax` deadline reached with no change
  pub fn poll_due_composite(&self, now: Instant<C>) -> Option<(usize, bool)> {
    for (ix, slot) in self.comp.iter().enumerate() {
      let c = match slot {
        | Some(c) => c,
        | None => continue,
      };

      let (epmin, epmax) = self.composite_window(c);
      let since_sent = time::since(c.last_sent, now);

      let epmin_ok = since_sent >= Milliseconds(epmin.unwrap_or(0) as u64 * 1_000);
      let change_due = c.pending && epmin_ok;
      let epmax_due = epmax.map(|e| since_sent >= Milliseconds(e as u64 * 1_000))
                           .unwrap_or(false);

      if change_due || epmax_due {
        let force_con = time::since(c.last_con, now) >= CONFIRMABLE_EVERY;
        return Some((ix, force_con));
      }
    }
    None
  }

  /// A composite notification for slot `ix` was handed to the exchange
  /// engine
  pub fn mark_composite_sent(&mut self, ix: usize, now: Instant<C>, was_con: bool) {
    if let Some(c) = self.comp.get_mut(ix).and_then(Option::as_mut) {
      c.seq = c.next_seq();
      c.pending = false;
      c.last_sent = now;
      if was_con {
        c.last_con = now;
      }
    }
  }

  /// How many observations are active
  pub fn len(&self) -> usize {
    self.obs.iter().flatten().count()
  }

  /// Is the table empty?
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Store write-attributes for `path`; writing all-empty attributes
  /// deletes the entry
  pub fn set_attrs(&mut self, path: Path, attrs: Attributes) -> Result<(), Error> {
    if let Some(slot) = self.attrs
                            .iter_mut()
                            .find(|s| s.map(|(p, _)| p == path).unwrap_or(false))
    {
      if attrs.is_empty() {
        *slot = None;
      } else {
        *slot = Some((path, attrs));
      }
      return Ok(());
    }

    if attrs.is_empty() {
      return Ok(());
    }

    let slot = self.attrs
                   .iter_mut()
                   .find(|s| s.is_none())
                   .ok_or(Error::NoSpace)?;
    *slot = Some((path, attrs));
    Ok(())
  }

  /// Attributes stored exactly at `path`
  pub fn attrs_at(&self, path: Path) -> Attributes {
    self.attrs
        .iter()
        .flatten()
        .find(|(p, _)| *p == path)
        .map(|(_, a)| *a)
        .unwrap_or_default()
  }

  /// Effective attributes for `path`: the most specific level wins,
  /// walking resource-instance → resource → instance → object
  pub fn effective(&self, path: Path) -> Attributes {
    let mut merged = Attributes::default();
    let mut p = path;
    loop {
      merged = merged.overlay(&self.attrs_at(p));
      if p.is_root() {
        return merged;
      }
      p = p.parent();
    }
  }

  /// The application told us a value changed; decide which observations
  /// now have a notification pending
  pub fn data_changed(&mut self, path: Path, new_value: Option<f64>) {
    for ix in 0..self.obs.len() {
      let (obs_path, last) = match &self.obs[ix] {
        | Some(o) if path.starts_with(&o.path) || o.path.starts_with(&path) => {
          (o.path, o.last_value)
        },
        | _ => continue,
      };

      let attrs = self.effective(obs_path);
      if attrs.significant(last, new_value) {
        if let Some(o) = &mut self.obs[ix] {
          o.pending = true;
        }
      }
    }

    // composite observations pace purely on epmin/epmax; any change to a
    // member marks them pending
    for slot in self.comp.iter_mut() {
      let touched = slot.map(|c| {
                          c.paths
                           .iter()
                           .any(|m| path.starts_with(m) || m.starts_with(&path))
                        })
                        .unwrap_or(false);
      if touched {
        if let Some(c) = slot.as_mut() {
          c.pending = true;
        }
      }
    }
  }

  /// Find an observation whose notification is due: a pending change
  /// past its `pmin`, or a `pmax` deadline reached with no change at
  /// all. Yields the slot index and whether the 24-h rule forces a
  /// confirmable notification.
  pub fn poll_due(&self, now: Instant<C>) -> Option<(usize, bool)> {
    for (ix, slot) in self.obs.iter().enumerate() {
      let o = match slot {
        | Some(o) => o,
        | None => continue,
      };

      let attrs = self.effective(o.path);
      let since_sent = time::since(o.last_sent, now);

      let pmin_ok = since_sent >= Milliseconds(attrs.pmin.unwrap_or(0) as u64 * 1_000);
      let change_due = o.pending && pmin_ok;
      let pmax_due = attrs.pmax
                          .map(|pmax| since_sent >= Milliseconds(pmax as u64 * 1_000))
                          .unwrap_or(false);

      if change_due || pmax_due {
        let force_con = time::since(o.last_con, now) >= CONFIRMABLE_EVERY;
        return Some((ix, force_con));
      }
    }
    None
  }

  /// Borrow a slot by index
  pub fn get(&self, ix: usize) -> Option<&Observation<C>> {
    self.obs.get(ix).and_then(Option::as_ref)
  }

  /// A notification for slot `ix` was handed to the exchange engine
  pub fn mark_sent(&mut self, ix: usize, now: Instant<C>, was_con: bool, value: Option<f64>) {
    if let Some(o) = self.obs.get_mut(ix).and_then(Option::as_mut) {
      o.seq = o.next_seq();
      o.pending = false;
      o.last_sent = now;
      o.last_value = value;
      if was_con {
        o.last_con = now;
      }
    }
  }

  /// When the scheduler must look at observations next
  pub fn next_deadline(&self, now: Instant<C>) -> Option<Instant<C>> {
    let mut soonest = None;
    for o in self.obs.iter().flatten() {
      let attrs = self.effective(o.path);

      if o.pending {
        let at = time::add(o.last_sent,
                           Milliseconds(attrs.pmin.unwrap_or(0) as u64 * 1_000));
        soonest = time::min_instant(soonest, Some(at.max(now)));
      }
      if let Some(pmax) = attrs.pmax {
        let at = time::add(o.last_sent, Milliseconds(pmax as u64 * 1_000));
        soonest = time::min_instant(soonest, Some(at.max(now)));
      }
    }

    for c in self.comp.iter().flatten() {
      let (epmin, epmax) = self.composite_window(c);

      if c.pending {
        let at = time::add(c.last_sent,
                           Milliseconds(epmin.unwrap_or(0) as u64 * 1_000));
        soonest = time::min_instant(soonest, Some(at.max(now)));
      }
      if let Some(epmax) = epmax {
        let at = time::add(c.last_sent, Milliseconds(epmax as u64 * 1_000));
        soonest = time::min_instant(soonest, Some(at.max(now)));
      }
    }
    soonest
  }
}

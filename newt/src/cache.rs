use embedded_time::Instant;
use newt_msg::Id;
use tinyvec::ArrayVec;

use crate::config::cap;
use crate::time::{add, Clock, Millis};

/// History slots kept beside the one full-copy "recent" slot
const HISTORY: usize = cap::CACHE_ENTRIES - 1;

#[derive(Debug)]
struct Seen<C: Clock> {
  id: Id,
  expires: Instant<C>,
}

impl<C: Clock> Copy for Seen<C> {}
impl<C: Clock> Clone for Seen<C> {
  fn clone(&self) -> Self {
    *self
  }
}

#[derive(Debug)]
struct Recent<C: Clock> {
  id: Id,
  expires: Instant<C>,
  response: ArrayVec<[u8; cap::MSG_BUF]>,
}

/// Result of a duplicate-detection lookup
#[derive(Debug, PartialEq, Eq)]
pub enum Hit<'a> {
  /// The id matches the most recent response; replay these exact bytes
  Recent(&'a [u8]),
  /// The id matches an older response we no longer hold; drop the
  /// duplicate silently
  Seen,
  /// Not a duplicate
  Miss,
}

/// Duplicate suppression for server-initiated requests (RFC 7252
/// section 4.5).
///
/// The most recent response is kept byte-for-byte so a retransmitted
/// request gets the identical answer; older ids are remembered (without
/// their bytes) for `EXCHANGE_LIFETIME`, long enough to know the
/// duplicate should be ignored rather than re-processed.
#[derive(Debug)]
pub struct ResponseCache<C: Clock> {
  recent: Option<Recent<C>>,
  seen: [Option<Seen<C>>; HISTORY],
}

impl<C: Clock> Default for ResponseCache<C> {
  fn default() -> Self {
    Self { recent: None,
           seen: [None; HISTORY] }
  }
}

impl<C: Clock> ResponseCache<C> {
  /// Is `id` a duplicate of something we already answered?
  pub fn lookup(&self, id: Id, now: Instant<C>) -> Hit<'_> {
    match &self.recent {
      | Some(r) if r.id == id && r.expires > now => return Hit::Recent(&r.response),
      | _ => (),
    }

    let seen = self.seen
                   .iter()
                   .flatten()
                   .any(|s| s.id == id && s.expires > now);
    if seen {
      Hit::Seen
    } else {
      Hit::Miss
    }
  }

  /// Record the response just sent for `id`.
  ///
  /// The previous recent entry is demoted into the history slot whose
  /// expiry is nearest (after dropping already-expired slots), and the
  /// new response becomes recent with an expiry of `now + lifetime`.
  pub fn insert(&mut self, id: Id, response: &[u8], now: Instant<C>, lifetime: Millis) {
    for slot in self.seen.iter_mut() {
      if slot.map(|s| s.expires <= now).unwrap_or(false) {
        *slot = None;
      }
    }

    if let Some(old) = self.recent.take() {
      let demoted = Seen { id: old.id,
                           expires: old.expires };
      match self.seen.iter_mut().find(|s| s.is_none()) {
        | Some(free) => *free = Some(demoted),
        | None => {
          if let Some(nearest) =
            self.seen
                .iter_mut()
                .min_by_key(|s| s.map(|s| s.expires).unwrap_or(now))
          {
            *nearest = Some(demoted);
          }
        },
      }
    }

    self.recent = Some(Recent { id,
                                expires: add(now, lifetime),
                                response: response.iter()
                                                  .copied()
                                                  .take(cap::MSG_BUF)
                                                  .collect() });
  }

  /// Forget everything (connection teardown)
  pub fn clear(&mut self) {
    self.recent = None;
    self.seen = [None; HISTORY];
  }
}

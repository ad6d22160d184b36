use newt_msg::ContentFormat;
use tinyvec::ArrayVec;

use crate::config::cap;
use crate::error::Error;
use crate::path::Path;

/// How a Send request ended, delivered to
/// [`crate::client::App::send_finished`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
  /// 2.04 Changed from the server
  Success,
  /// The exchange ran out of retransmissions
  Timeout,
  /// Aborted locally before or during the exchange
  Abort,
  /// The server answered with an error code
  Rejected,
  /// A hard socket error
  Network,
  /// Encoding failed or the engine lost the session
  Internal,
}

/// One queued "Send" report: which values to sample and how to encode
/// them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendRequest {
  /// Queue id handed back to the caller for abort/completion matching
  pub id: u16,
  /// Caller-chosen content format
  pub format: ContentFormat,
  /// The resource paths to report
  pub paths: ArrayVec<[Path; cap::SEND_PATHS]>,
}

/// Is this format keyed by path (so duplicate paths are unencodable)?
fn map_keyed(format: ContentFormat) -> bool {
  matches!(format, ContentFormat::Lwm2mCbor | ContentFormat::Lwm2mJson)
}

/// Fixed-depth FIFO of pending Send reports.
///
/// Eligibility to actually start (registered, no higher-priority
/// exchange, Mute-Send off) is the engine's call; the queue just holds
/// and orders requests.
#[derive(Debug)]
pub struct SendQueue {
  slots: [Option<SendRequest>; cap::SEND_QUEUE],
  next_id: u16,
}

impl Default for SendQueue {
  fn default() -> Self {
    Self { slots: [None; cap::SEND_QUEUE],
           next_id: 1 }
  }
}

impl SendQueue {
  /// Queue a report, yielding its id.
  ///
  /// Fails with [`Error::InvalidArg`] for an empty path list, a path
  /// above resource level, or duplicate paths under a map-keyed format;
  /// [`Error::NoSpace`] when the FIFO is full.
  pub fn enqueue(&mut self, paths: &[Path], format: ContentFormat) -> Result<u16, Error> {
    if paths.is_empty() || paths.len() > cap::SEND_PATHS {
      return Err(Error::InvalidArg);
    }
    if paths.iter().any(|p| p.len() < 3) {
      return Err(Error::InvalidArg);
    }
    if map_keyed(format) {
      let duplicate = paths.iter()
                           .enumerate()
                           .any(|(ix, p)| paths[..ix].contains(p));
      if duplicate {
        return Err(Error::InvalidArg);
      }
    }

    let slot = self.slots
                   .iter_mut()
                   .find(|s| s.is_none())
                   .ok_or(Error::NoSpace)?;

    let id = self.next_id;
    self.next_id = self.next_id.wrapping_add(1).max(1);

    *slot = Some(SendRequest { id,
                               format,
                               paths: paths.iter().copied().collect() });
    Ok(id)
  }

  /// Drop one request by id, or all of them; every dropped id is
  /// reported through `dropped` so completion callbacks can fire with
  /// [`SendResult::Abort`]
  pub fn abort(&mut self, id: Option<u16>, dropped: &mut dyn FnMut(u16)) {
    for slot in self.slots.iter_mut() {
      let matches = match (slot.as_ref(), id) {
        | (Some(req), Some(want)) => req.id == want,
        | (Some(_), None) => true,
        | (None, _) => false,
      };
      if matches {
        if let Some(req) = slot.take() {
          dropped(req.id);
        }
      }
    }
  }

  /// The request that has waited longest (FIFO order by id age)
  pub fn front(&self) -> Option<&SendRequest> {
    self.slots.iter().flatten().min_by_key(|r| r.age(self.next_id))
  }

  /// Remove and yield the front request
  pub fn pop_front(&mut self) -> Option<SendRequest> {
    let front_id = self.front()?.id;
    self.slots
        .iter_mut()
        .find(|s| s.map(|r| r.id == front_id).unwrap_or(false))?
        .take()
  }

  /// Is anything waiting?
  pub fn is_empty(&self) -> bool {
    self.slots.iter().all(Option::is_none)
  }
}

impl SendRequest {
  /// Distance behind the id counter; orders the FIFO even across id
  /// wraparound
  fn age(&self, next_id: u16) -> u16 {
    next_id.wrapping_sub(self.id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn paths2() -> [Path; 2] {
    [Path::resource(3, 0, 9), Path::resource(1, 0, 1)]
  }

  #[test]
  fn fifo_order() {
    let mut q = SendQueue::default();
    let a = q.enqueue(&paths2(), ContentFormat::SenmlCbor).unwrap();
    let b = q.enqueue(&paths2(), ContentFormat::SenmlCbor).unwrap();

    assert_eq!(q.front().unwrap().id, a);
    assert_eq!(q.pop_front().unwrap().id, a);
    assert_eq!(q.pop_front().unwrap().id, b);
    assert!(q.pop_front().is_none());
    assert!(q.is_empty());
  }

  #[test]
  fn rejects_bad_paths() {
    let mut q = SendQueue::default();
    assert_eq!(q.enqueue(&[], ContentFormat::SenmlCbor),
               Err(Error::InvalidArg));
    assert_eq!(q.enqueue(&[Path::instance(3, 0)], ContentFormat::SenmlCbor),
               Err(Error::InvalidArg));
  }

  #[test]
  fn duplicate_paths_invalid_for_map_keyed_formats() {
    let mut q = SendQueue::default();
    let dup = [Path::resource(3, 0, 9), Path::resource(3, 0, 9)];

    assert_eq!(q.enqueue(&dup, ContentFormat::Lwm2mCbor),
               Err(Error::InvalidArg));
    // a list-shaped format tolerates repeats
    assert!(q.enqueue(&dup, ContentFormat::SenmlCbor).is_ok());
  }

  #[test]
  fn fills_up() {
    let mut q = SendQueue::default();
    for _ in 0..cap::SEND_QUEUE {
      q.enqueue(&paths2(), ContentFormat::SenmlCbor).unwrap();
    }
    assert_eq!(q.enqueue(&paths2(), ContentFormat::SenmlCbor),
               Err(Error::NoSpace));
  }

  #[test]
  fn abort_one_and_all() {
    let mut q = SendQueue::default();
    let a = q.enqueue(&paths2(), ContentFormat::SenmlCbor).unwrap();
    let b = q.enqueue(&paths2(), ContentFormat::SenmlCbor).unwrap();
    let c = q.enqueue(&paths2(), ContentFormat::SenmlCbor).unwrap();

    let mut dropped = Vec::new();
    q.abort(Some(b), &mut |id| dropped.push(id));
    assert_eq!(dropped, vec![b]);

    q.abort(None, &mut |id| dropped.push(id));
    assert_eq!(dropped, vec![b, a, c]);
    assert!(q.is_empty());
  }
}

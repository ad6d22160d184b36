//! Client-initiated bootstrap: request provisioning, absorb the server's
//! writes, wait for Bootstrap-Finish.
//!
//! The driver owns the state machine and its timers; the engine performs
//! the I/O. One whole attempt (request → finish) is bounded by
//! [`crate::config::Bootstrap::timeout`], attempts back off exponentially,
//! and spent sequences re-run after the sequence delay, all through
//! [`crate::retry::Sequence`].

use embedded_time::Instant;

use crate::config;
use crate::retry::{SeqVerdict, Sequence};
use crate::time::{self, Clock};

/// Where the bootstrap procedure stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsState {
  /// Not bootstrapping
  Idle,
  /// Waiting for the socket to reach the bootstrap server
  Connecting,
  /// Bootstrap-Request is in flight
  RequestSent,
  /// Request was accepted; the server is writing to us
  WaitingFinish,
  /// Bootstrap-Finish arrived and validated
  Finished,
  /// Every attempt and sequence is spent
  Failed,
}

/// The bootstrap driver
#[derive(Debug)]
pub struct Bootstrap<C: Clock> {
  state: BsState,
  seq: Sequence<C>,
  deadline: Option<Instant<C>>,
}

impl<C: Clock> Default for Bootstrap<C> {
  fn default() -> Self {
    Self { state: BsState::Idle,
           seq: Sequence::default(),
           deadline: None }
  }
}

impl<C: Clock> Bootstrap<C> {
  #[allow(missing_docs)]
  pub fn state(&self) -> BsState {
    self.state
  }

  /// Enter the procedure (from `Initial`, or after registration
  /// exhausted its retries)
  pub fn begin(&mut self) {
    self.state = BsState::Connecting;
    self.seq.reset();
    self.deadline = None;
  }

  /// May a (re)connection attempt start now?
  pub fn ready(&self, now: Instant<C>) -> bool {
    self.state == BsState::Connecting && self.seq.ready(now)
  }

  /// The socket is connected: one attempt starts, bounded by the
  /// configured timeout
  pub fn attempt_started(&mut self, now: Instant<C>, cfg: &config::Bootstrap) {
    self.seq.attempt_started();
    self.deadline = Some(time::add(now, cfg.timeout));
    self.state = BsState::RequestSent;
  }

  /// The server accepted our Bootstrap-Request (2.04)
  pub fn request_accepted(&mut self) {
    if self.state == BsState::RequestSent {
      self.state = BsState::WaitingFinish;
    }
  }

  /// Are we inside the window where server writes are bootstrap-scoped?
  pub fn in_progress(&self) -> bool {
    matches!(self.state,
             BsState::RequestSent | BsState::WaitingFinish)
  }

  /// Bootstrap-Finish arrived and the data model validated
  pub fn finished(&mut self) {
    self.state = BsState::Finished;
    self.deadline = None;
    self.seq.reset();
  }

  /// The current attempt failed (timeout, network error, error
  /// response); schedule the next one or give up
  pub fn attempt_failed(&mut self, now: Instant<C>, cfg: &config::Bootstrap) -> SeqVerdict {
    self.deadline = None;
    let verdict = self.seq.fail(now, &cfg.retry);
    self.state = match verdict {
      | SeqVerdict::Exhausted => BsState::Failed,
      | _ => BsState::Connecting,
    };
    verdict
  }

  /// Has the whole-attempt timeout expired?
  pub fn timed_out(&self, now: Instant<C>) -> bool {
    self.in_progress() && self.deadline.map(|d| now >= d).unwrap_or(false)
  }

  /// When this driver needs attention next
  pub fn next_deadline(&self) -> Option<Instant<C>> {
    time::min_instant(self.deadline,
                      if self.state == BsState::Connecting {
                        self.seq.next_at()
                      } else {
                        None
                      })
  }
}

#[cfg(test)]
mod tests {
  use embedded_time::duration::Milliseconds;

  use super::*;
  use crate::retry::Attempts;
  use crate::test::ClockMock;

  fn at(ms: u64) -> Instant<ClockMock> {
    ClockMock::instant(ms)
  }

  fn cfg() -> config::Bootstrap {
    config::Bootstrap { retry: config::RetryPolicy { retry_count: Attempts(2),
                                                     retry_timer: Milliseconds(1_000),
                                                     seq_retry_count: Attempts(1),
                                                     seq_delay_timer:
                                                       Milliseconds(60_000) },
                        timeout: Milliseconds(10_000) }
  }

  #[test]
  fn happy_path() {
    let mut bs = Bootstrap::<ClockMock>::default();
    assert_eq!(bs.state(), BsState::Idle);

    bs.begin();
    assert!(bs.ready(at(0)));

    bs.attempt_started(at(0), &cfg());
    assert_eq!(bs.state(), BsState::RequestSent);
    assert!(bs.in_progress());

    bs.request_accepted();
    assert_eq!(bs.state(), BsState::WaitingFinish);

    bs.finished();
    assert_eq!(bs.state(), BsState::Finished);
    assert!(!bs.in_progress());
  }

  #[test]
  fn attempt_timeout_backs_off_then_fails() {
    let mut bs = Bootstrap::<ClockMock>::default();
    bs.begin();
    bs.attempt_started(at(0), &cfg());

    assert!(!bs.timed_out(at(9_999)));
    assert!(bs.timed_out(at(10_000)));

    assert_eq!(bs.attempt_failed(at(10_000), &cfg()), SeqVerdict::Backoff);
    assert_eq!(bs.state(), BsState::Connecting);
    assert!(!bs.ready(at(10_500)));
    assert!(bs.ready(at(11_000)));

    bs.attempt_started(at(11_000), &cfg());
    assert_eq!(bs.attempt_failed(at(21_000), &cfg()), SeqVerdict::Exhausted);
    assert_eq!(bs.state(), BsState::Failed);
  }
}

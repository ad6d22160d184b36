use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use rand::Rng;

use crate::time::{self, Clock, Millis};

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempts(pub u16);

/// Result of [`RetryTimer::poll`]: what the owner of the retried work
/// should do now.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Verdict {
  /// Perform another attempt
  Retry,
  /// Attempts are exhausted and the final wait has elapsed; the work is
  /// poisoned
  GiveUp,
}

/// Strategy to employ when retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Draw the initial delay uniformly from `[init_min, init_max]`, then
  /// double it after every attempt.
  ///
  /// This is the CoAP retransmission schedule when the bounds are
  /// `[ACK_TIMEOUT, ACK_TIMEOUT × ACK_RANDOM_FACTOR]`, and the LwM2M
  /// communication-retry schedule when both bounds are the retry timer.
  Exponential {
    /// Minimum (inclusive) initial delay
    init_min: Millis,
    /// Maximum (inclusive) initial delay
    init_max: Millis,
  },
  /// Draw a delay from `[min, max]` once and wait that long between every
  /// pair of attempts.
  Delay {
    /// Minimum (inclusive) delay
    min: Millis,
    /// Maximum (inclusive) delay
    max: Millis,
  },
}

impl Strategy {
  /// Get the min & max initial delays as an inclusive range
  pub fn range(&self) -> RangeInclusive<u64> {
    match self {
      | &Self::Delay { min: Milliseconds(min),
                       max: Milliseconds(max), } => min..=max,
      | &Self::Exponential { init_min: Milliseconds(min),
                             init_max: Milliseconds(max), } => min..=max,
    }
  }

  /// Are min & max delays distinct? If not we can skip drawing a random
  /// number.
  pub fn has_jitter(&self) -> bool {
    let rng = self.range();
    rng.start() != rng.end()
  }

  fn next_delay(&self, Milliseconds(current): Millis) -> Millis {
    match self {
      | Self::Exponential { .. } => Milliseconds(current.saturating_mul(2)),
      | Self::Delay { .. } => Milliseconds(current),
    }
  }

  /// Total time from the first attempt until [`Verdict::GiveUp`], if
  /// every attempt fails and the maximum initial delay was drawn
  pub fn max_time(&self, Attempts(n): Attempts) -> Millis {
    let init = *self.range().end();
    Milliseconds(match self {
                   // init * (2^(n+1) - 1): every wait doubles, including the
                   // final one after the last attempt
                   | Self::Exponential { .. } => init * ((1u64 << (n + 1)) - 1),
                   | Self::Delay { .. } => init * (n as u64 + 1),
                 })
  }
}

/// A non-blocking timer pacing the retries of some fallible operation.
///
/// It does not _contain_ the work to be done (there is no allocator to box
/// a closure into); it answers "should I try again yet?".
///
/// The first attempt is made by the caller before constructing the timer.
/// Each [`poll`](RetryTimer::poll) that lands past the current deadline
/// yields [`Verdict::Retry`] and pushes the deadline out by the
/// strategy's next delay; when `max_attempts` retries have fired and the
/// final wait has also elapsed, [`Verdict::GiveUp`] is yielded forever
/// after.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer<C: Clock> {
  fires_at: Instant<C>,
  delay: Millis,
  strategy: Strategy,
  attempts_made: u16,
  max_attempts: Attempts,
}

impl<C: Clock> RetryTimer<C> {
  /// Create a new retrier whose first attempt just happened at `start`
  pub fn new<R: Rng>(start: Instant<C>,
                     strategy: Strategy,
                     max_attempts: Attempts,
                     rng: &mut R)
                     -> Self {
    let init = if strategy.has_jitter() {
      Milliseconds(rng.gen_range(strategy.range()))
    } else {
      Milliseconds(*strategy.range().start())
    };

    Self { fires_at: time::add(start, init),
           delay: init,
           strategy,
           attempts_made: 0,
           max_attempts }
  }

  /// The work failed again (or hasn't succeeded yet): should another
  /// attempt be made now?
  ///
  /// Returns `nb::Error::WouldBlock` while the appropriate wait has not
  /// yet passed.
  pub fn poll(&mut self, now: Instant<C>) -> nb::Result<Verdict, core::convert::Infallible> {
    if now < self.fires_at {
      return Err(nb::Error::WouldBlock);
    }

    if self.attempts_made >= self.max_attempts.0 {
      return Ok(Verdict::GiveUp);
    }

    self.attempts_made += 1;
    self.delay = self.strategy.next_delay(self.delay);
    self.fires_at = time::add(self.fires_at, self.delay);
    Ok(Verdict::Retry)
  }

  /// When the next verdict becomes available
  pub fn next_fire(&self) -> Instant<C> {
    self.fires_at
  }

  /// How many retries have fired so far
  pub fn attempts_made(&self) -> u16 {
    self.attempts_made
  }
}

/// Verdict of [`Sequence::fail`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
  /// Wait out the back-off, then run the next attempt
  Backoff,
  /// This sequence is spent; a fresh one starts after the sequence delay
  NextSequence,
  /// Attempt and sequence budgets are both spent
  Exhausted,
}

/// Attempt/sequence bookkeeping for a whole procedure (registration,
/// bootstrap) under a [`crate::config::RetryPolicy`].
///
/// Attempt `k` of a sequence backs off `retry_timer × 2^(k−1)`; a spent
/// sequence waits `seq_delay_timer` and starts over, up to
/// `seq_retry_count` sequences in total.
#[derive(Debug)]
pub struct Sequence<C: Clock> {
  attempts_made: u16,
  sequences_done: u16,
  next_at: Option<Instant<C>>,
}

impl<C: Clock> Default for Sequence<C> {
  fn default() -> Self {
    Self { attempts_made: 0,
           sequences_done: 0,
           next_at: None }
  }
}

impl<C: Clock> Sequence<C> {
  /// May the next attempt start now?
  pub fn ready(&self, now: Instant<C>) -> bool {
    self.next_at.map(|at| now >= at).unwrap_or(true)
  }

  /// An attempt just started
  pub fn attempt_started(&mut self) {
    self.attempts_made += 1;
    self.next_at = None;
  }

  /// The running attempt failed; schedule what happens next
  pub fn fail(&mut self, now: Instant<C>, policy: &crate::config::RetryPolicy) -> SeqVerdict {
    if self.attempts_made >= policy.retry_count.0 {
      self.sequences_done += 1;
      self.attempts_made = 0;

      if self.sequences_done >= policy.seq_retry_count.0 {
        return SeqVerdict::Exhausted;
      }

      self.next_at = Some(time::add(now, policy.seq_delay_timer));
      return SeqVerdict::NextSequence;
    }

    let Milliseconds(timer) = policy.retry_timer;
    let backoff = Milliseconds(timer << self.attempts_made.saturating_sub(1).min(16));
    self.next_at = Some(time::add(now, backoff));
    SeqVerdict::Backoff
  }

  /// The procedure succeeded; forget all history
  pub fn reset(&mut self) {
    *self = Self::default();
  }

  /// When the next attempt may start, if a wait is scheduled
  pub fn next_at(&self) -> Option<Instant<C>> {
    self.next_at
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test::{seeded_rng, ClockMock};

  fn at(ms: u64) -> Instant<ClockMock> {
    ClockMock::instant(ms)
  }

  #[test]
  fn delay_retrier() {
    let mut rng = seeded_rng();
    let mut retry = RetryTimer::new(at(0),
                                    Strategy::Delay { min: Milliseconds(1_000),
                                                      max: Milliseconds(1_000) },
                                    Attempts(2),
                                    &mut rng);

    assert_eq!(retry.poll(at(999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(1_000)).unwrap(), Verdict::Retry);
    assert_eq!(retry.poll(at(1_999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(2_000)).unwrap(), Verdict::Retry);
    assert_eq!(retry.poll(at(2_999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(3_000)).unwrap(), Verdict::GiveUp);
    assert_eq!(retry.poll(at(9_000)).unwrap(), Verdict::GiveUp);
  }

  #[test]
  fn exponential_retrier() {
    let mut rng = seeded_rng();
    let mut retry = RetryTimer::new(at(0),
                                    Strategy::Exponential { init_min: Milliseconds(1_000),
                                                            init_max: Milliseconds(1_000) },
                                    Attempts(3),
                                    &mut rng);

    // waits double: 1s, 2s, 4s, then a final 8s before giving up
    assert_eq!(retry.poll(at(999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(1_000)).unwrap(), Verdict::Retry);
    assert_eq!(retry.poll(at(2_999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(3_000)).unwrap(), Verdict::Retry);
    assert_eq!(retry.poll(at(6_999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(7_000)).unwrap(), Verdict::Retry);
    assert_eq!(retry.poll(at(14_999)).unwrap_err(), nb::Error::WouldBlock);
    assert_eq!(retry.poll(at(15_000)).unwrap(), Verdict::GiveUp);
  }

  #[test]
  fn late_polls_stay_on_schedule() {
    let mut rng = seeded_rng();
    let mut retry = RetryTimer::new(at(0),
                                    Strategy::Exponential { init_min: Milliseconds(1_000),
                                                            init_max: Milliseconds(1_000) },
                                    Attempts(3),
                                    &mut rng);

    // a poll that arrives very late fires, and the next deadline is
    // anchored to the schedule, not to the late poll
    assert_eq!(retry.poll(at(2_500)).unwrap(), Verdict::Retry);
    assert_eq!(retry.next_fire(), at(3_000));
  }

  #[test]
  fn jitter_stays_in_bounds() {
    for seed in 0..32 {
      let mut rng = crate::test::rng_from(seed);
      let retry = RetryTimer::new(at(0),
                                  Strategy::Exponential { init_min: Milliseconds(2_000),
                                                          init_max: Milliseconds(3_000) },
                                  Attempts(4),
                                  &mut rng);
      let fire = crate::time::since(at(0), retry.next_fire());
      assert!(fire >= Milliseconds(2_000u32) && fire <= Milliseconds(3_000u32));
    }
  }

  #[test]
  fn sequence_backoff_doubles_then_rolls_over() {
    use crate::config::RetryPolicy;

    let policy = RetryPolicy { retry_count: Attempts(3),
                               retry_timer: Milliseconds(1_000),
                               seq_retry_count: Attempts(2),
                               seq_delay_timer: Milliseconds(60_000) };
    let mut seq = Sequence::<ClockMock>::default();

    assert!(seq.ready(at(0)));
    seq.attempt_started();
    assert_eq!(seq.fail(at(10), &policy), SeqVerdict::Backoff);
    assert_eq!(seq.next_at(), Some(at(1_010)));
    assert!(!seq.ready(at(1_000)));
    assert!(seq.ready(at(1_010)));

    seq.attempt_started();
    assert_eq!(seq.fail(at(1_020), &policy), SeqVerdict::Backoff);
    assert_eq!(seq.next_at(), Some(at(3_020)));

    seq.attempt_started();
    assert_eq!(seq.fail(at(3_030), &policy), SeqVerdict::NextSequence);
    assert_eq!(seq.next_at(), Some(at(63_030)));

    // second (and last) sequence
    seq.attempt_started();
    assert_eq!(seq.fail(at(63_100), &policy), SeqVerdict::Backoff);
    seq.attempt_started();
    assert_eq!(seq.fail(at(65_000), &policy), SeqVerdict::Backoff);
    seq.attempt_started();
    assert_eq!(seq.fail(at(70_000), &policy), SeqVerdict::Exhausted);
  }

  #[test]
  fn max_time() {
    let exp = Strategy::Exponential { init_min: Milliseconds(100),
                                      init_max: Milliseconds(100) };
    assert_eq!(exp.max_time(Attempts(4)), Milliseconds(3_100u32));

    let delay = Strategy::Delay { min: Milliseconds(100),
                                  max: Milliseconds(100) };
    assert_eq!(delay.max_time(Attempts(4)), Milliseconds(500u32));
  }
}

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;

/// A duration, in milliseconds
pub type Millis = Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the type of "ticks" to
/// u64.
///
/// Every internal deadline of the engine lives on this monotonic clock; it
/// must never decrease across `step()` calls.
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// Calendar time, for hosts and payload codecs that stamp readings with
/// wall-clock seconds (SenML basetime). The engine itself schedules purely
/// on the monotonic [`Clock`]; set calendar time before constructing the
/// engine if a codec needs it.
pub trait WallClock {
  /// Milliseconds since the unix epoch, if calendar time has been set
  fn real_now(&self) -> Option<Millis>;
}

/// Timeout configuration allowing for "never time out" as an option
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum Timeout {
  /// Timeout after some number of milliseconds has elapsed
  Millis(u64),
  /// Never time out
  Never,
}

/// Milliseconds elapsed from `from` to `to`, saturating at zero when `to`
/// is not later
pub fn since<C: Clock>(from: Instant<C>, to: Instant<C>) -> Millis {
  to.checked_duration_since(&from)
    .and_then(|d| Millis::try_from(d).ok())
    .unwrap_or(Milliseconds(0))
}

/// The instant `dur` after `t`, saturating at `t` if the sum is not
/// representable
pub fn add<C: Clock>(t: Instant<C>, dur: Millis) -> Instant<C> {
  t.checked_add(dur).unwrap_or(t)
}

/// The earlier of two optional instants
pub fn min_instant<C: Clock>(a: Option<Instant<C>>, b: Option<Instant<C>>) -> Option<Instant<C>> {
  match (a, b) {
    | (Some(a), Some(b)) => Some(if a <= b { a } else { b }),
    | (a, None) => a,
    | (None, b) => b,
  }
}

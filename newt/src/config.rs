use embedded_time::duration::Milliseconds;

use crate::retry::Attempts;
use crate::time::Millis;

/// Compile-time table capacities.
///
/// The engine never allocates: every variable-size collection is a
/// fixed-capacity array sized here, the way the C heritage sized them with
/// preprocessor knobs. Behavioral knobs (timeouts, retry budgets) live in
/// [`Config`] instead and can differ per engine instance.
pub mod cap {
  /// Installed data-model objects the engine will address
  pub const MAX_OBJECTS: usize = 16;
  /// Concurrent observations
  pub const MAX_OBSERVATIONS: usize = 8;
  /// Write-attributes entries for paths that are not (yet) observed
  pub const MAX_WRITE_ATTRS: usize = 8;
  /// Concurrent composite observations (Observe-Composite)
  pub const MAX_COMPOSITE_OBSERVATIONS: usize = 4;
  /// Member paths one composite observation may cover
  pub const COMPOSITE_PATHS: usize = 8;
  /// Depth of the Send FIFO
  pub const SEND_QUEUE: usize = 4;
  /// Paths one Send request may carry
  pub const SEND_PATHS: usize = 8;
  /// Response-cache depth (one recent slot + history)
  pub const CACHE_ENTRIES: usize = 4;
  /// Location-Path segments stored from a Register response
  pub const MAX_LOCATION_PATHS: usize = 4;
  /// Bytes per stored Location-Path segment
  pub const MAX_LOCATION_PATH_LEN: usize = 32;
  /// Network I/O staging buffers, sized for one datagram
  pub const MSG_BUF: usize = 1280;
  /// Payload staging for block-wise transfers (the largest body the
  /// engine will assemble or slice)
  pub const STAGING: usize = 4096;
}

/// CoAP transmission parameters (RFC 7252 section 4.8), overridable per
/// engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
  /// Base ACK timeout.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().ack_timeout, Milliseconds(2_000u64));
  /// ```
  pub ack_timeout: Millis,

  /// `ACK_RANDOM_FACTOR`, expressed in percent to keep the arithmetic
  /// integral (150 = the RFC's 1.5).
  ///
  /// ```
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().ack_random_factor_pct, 150);
  /// ```
  pub ack_random_factor_pct: u16,

  /// Number of retransmissions of an unacknowledged CON before the
  /// exchange fails with `Timeout`.
  ///
  /// ```
  /// use newt::config::TxParams;
  /// use newt::retry::Attempts;
  ///
  /// assert_eq!(TxParams::default().max_retransmit, Attempts(4));
  /// ```
  pub max_retransmit: Attempts,
}

impl Default for TxParams {
  fn default() -> Self {
    TxParams { ack_timeout: Milliseconds(2_000),
               ack_random_factor_pct: 150,
               max_retransmit: Attempts(4) }
  }
}

impl TxParams {
  /// Initial retransmission timeout bounds: `[ack_timeout, ack_timeout ×
  /// ack_random_factor]`
  pub fn initial_timeout_range(&self) -> core::ops::RangeInclusive<u64> {
    let Milliseconds(ack) = self.ack_timeout;
    ack..=(ack * self.ack_random_factor_pct as u64 / 100)
  }

  /// `MAX_TRANSMIT_SPAN = ACK_TIMEOUT × (2^MAX_RETRANSMIT − 1) ×
  /// ACK_RANDOM_FACTOR`
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().max_transmit_span(),
  ///            Milliseconds(45_000u64));
  /// ```
  pub fn max_transmit_span(&self) -> Millis {
    let Milliseconds(ack) = self.ack_timeout;
    let doublings = (1u64 << self.max_retransmit.0) - 1;
    Milliseconds(ack * doublings * self.ack_random_factor_pct as u64 / 100)
  }

  /// `MAX_TRANSMIT_WAIT = ACK_TIMEOUT × (2^(MAX_RETRANSMIT+1) − 1) ×
  /// ACK_RANDOM_FACTOR`: how long a sender might keep trying.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().max_transmit_wait(),
  ///            Milliseconds(93_000u64));
  /// ```
  pub fn max_transmit_wait(&self) -> Millis {
    let Milliseconds(ack) = self.ack_timeout;
    let doublings = (1u64 << (self.max_retransmit.0 + 1)) - 1;
    Milliseconds(ack * doublings * self.ack_random_factor_pct as u64 / 100)
  }

  /// `MAX_LATENCY`: fixed at the RFC's 100 seconds
  pub fn max_latency(&self) -> Millis {
    Milliseconds(100_000)
  }

  /// `EXCHANGE_LIFETIME = MAX_TRANSMIT_SPAN + 2 × MAX_LATENCY +
  /// ACK_TIMEOUT`: the window during which a message id stays in the
  /// response cache.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().exchange_lifetime(),
  ///            Milliseconds(247_000u64));
  /// ```
  pub fn exchange_lifetime(&self) -> Millis {
    let Milliseconds(span) = self.max_transmit_span();
    let Milliseconds(lat) = self.max_latency();
    let Milliseconds(ack) = self.ack_timeout;
    Milliseconds(span + 2 * lat + ack)
  }
}

/// Attempt-level and sequence-level retry budget for a whole procedure
/// (registration, bootstrap).
///
/// Attempt `k` of a sequence waits `retry_timer × 2^(k−1)`; when
/// `retry_count` attempts are exhausted the sequence fails, and up to
/// `seq_retry_count` whole sequences are run with `seq_delay_timer`
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  #[allow(missing_docs)]
  pub retry_count: Attempts,
  #[allow(missing_docs)]
  pub retry_timer: Millis,
  #[allow(missing_docs)]
  pub seq_retry_count: Attempts,
  #[allow(missing_docs)]
  pub seq_delay_timer: Millis,
}

/// Queue mode: close the socket after a quiet period, reopen on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMode {
  /// Inactivity period after which the connection is closed.
  ///
  /// Defaults to `MAX_TRANSMIT_WAIT` for the default transmission
  /// parameters, so a server retrying a request has given up by the time
  /// we stop listening.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::QueueMode;
  ///
  /// assert_eq!(QueueMode::default().timeout, Milliseconds(93_000u64));
  /// ```
  pub timeout: Millis,
}

impl Default for QueueMode {
  fn default() -> Self {
    QueueMode { timeout: Milliseconds(93_000) }
  }
}

/// Configuration of the registration driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
  /// Communication retry budget, defaulting to the LwM2M core defaults
  /// (5 attempts starting at 60 s, one sequence re-run a day later).
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::Registration;
  /// use newt::retry::Attempts;
  ///
  /// let retry = Registration::default().retry;
  /// assert_eq!(retry.retry_count, Attempts(5));
  /// assert_eq!(retry.retry_timer, Milliseconds(60_000u64));
  /// assert_eq!(retry.seq_retry_count, Attempts(1));
  /// assert_eq!(retry.seq_delay_timer, Milliseconds(86_400_000u64));
  /// ```
  pub retry: RetryPolicy,

  /// `Some` enables queue mode (binding suffix `Q`)
  pub queue_mode: Option<QueueMode>,
}

impl Default for Registration {
  fn default() -> Self {
    Registration { retry: RetryPolicy { retry_count: Attempts(5),
                                        retry_timer: Milliseconds(60_000),
                                        seq_retry_count: Attempts(1),
                                        seq_delay_timer: Milliseconds(86_400_000) },
                   queue_mode: None }
  }
}

/// Configuration of the bootstrap driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrap {
  /// Per-attempt and sequence retry budget for the bootstrap procedure
  pub retry: RetryPolicy,

  /// Upper bound on one whole bootstrap attempt, from Bootstrap-Request
  /// until Bootstrap-Finish.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::Bootstrap;
  ///
  /// assert_eq!(Bootstrap::default().timeout, Milliseconds(247_000u64));
  /// ```
  pub timeout: Millis,
}

impl Default for Bootstrap {
  fn default() -> Self {
    Bootstrap { retry: RetryPolicy { retry_count: Attempts(3),
                                     retry_timer: Milliseconds(3_000),
                                     seq_retry_count: Attempts(1),
                                     seq_delay_timer: Milliseconds(86_400_000) },
                timeout: Milliseconds(247_000) }
  }
}

/// Runtime config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// See [`TxParams`]
  pub tx: TxParams,
  /// See [`Registration`]
  pub registration: Registration,
  /// See [`Bootstrap`]
  pub bootstrap: Bootstrap,

  /// Inactivity bound for assembling a multi-block inbound request; when
  /// the server goes quiet mid-Block1 the partial body is discarded.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::Config;
  ///
  /// assert_eq!(Config::default().exchange_request_timeout,
  ///            Milliseconds(247_000u64));
  /// ```
  pub exchange_request_timeout: Millis,

  /// Seed mixed into token generation so two devices with the same
  /// firmware produce different token streams.
  ///
  /// ```
  /// use newt::config::Config;
  ///
  /// assert_eq!(Config::default().token_seed, 0);
  /// ```
  pub token_seed: u16,

  /// Cancel an observation when the server answers one of its
  /// non-confirmable notifications with Reset.
  ///
  /// ```
  /// use newt::config::Config;
  ///
  /// assert!(Config::default().cancel_observe_on_reset);
  /// ```
  pub cancel_observe_on_reset: bool,
}

impl Default for Config {
  fn default() -> Self {
    Config { tx: TxParams::default(),
             registration: Registration::default(),
             bootstrap: Bootstrap::default(),
             exchange_request_timeout: Milliseconds(247_000),
             token_seed: 0,
             cancel_observe_on_reset: true }
  }
}

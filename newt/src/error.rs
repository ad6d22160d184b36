use newt_msg::{Code, EncodeError, ParseError};

/// Everything that can go wrong in the engine, as one tagged result kind.
///
/// Would-block is **not** here: operations that can suspend return
/// [`nb::Result`] and express "try again later" as
/// [`nb::Error::WouldBlock`]. An `Error` always means the operation will
/// not succeed by waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// An argument was outside its domain (bad path, bad id, bad length)
  InvalidArg,
  /// A fixed-capacity table is full
  NoSpace,
  /// The operation is not legal in the current connection state
  NotAllowed,
  /// Another operation of the same kind is already running
  InProgress,
  /// API misuse (re-entrant transaction, step re-entry)
  Logic,

  /// The socket failed with a hard error
  Network,
  /// The datagram exceeded what the link will carry
  Msgsize,
  /// No connection is established
  NotConnected,

  /// The peer did not answer within the retransmission budget
  Timeout,
  /// The peer answered with something that is not a valid response to
  /// what we sent
  InvalidResponse,
  /// The peer answered with a 4.xx/5.xx code
  CoapError(Code),
  /// A resumed block transfer no longer matches the representation we
  /// started with
  EtagMismatch,
  /// The peer rejected the message with a Reset
  Rejected,

  /// A bug or unexpected condition inside the engine
  Internal,
  /// A buffer could not hold what the protocol required
  Memory,
  /// The feature this entry point belongs to is compiled out or not part
  /// of this engine
  NotImplemented,

  /// The exchange was cancelled locally
  Terminated,
  /// The queued request was aborted before it started
  Abort,

  /// A data-model handler failed
  Dm(crate::dm::DmError),
  /// The inbound datagram was not a CoAP message
  Parse(ParseError),
  /// The outbound message did not fit its buffer
  Encode(EncodeError),
  /// The monotonic clock failed
  Clock,
}

impl From<crate::dm::DmError> for Error {
  fn from(e: crate::dm::DmError) -> Self {
    Error::Dm(e)
  }
}

impl From<ParseError> for Error {
  fn from(e: ParseError) -> Self {
    Error::Parse(e)
  }
}

impl From<EncodeError> for Error {
  fn from(e: EncodeError) -> Self {
    Error::Encode(e)
  }
}

impl From<embedded_time::clock::Error> for Error {
  fn from(_: embedded_time::clock::Error) -> Self {
    Error::Clock
  }
}

impl From<newt_msg::SetError> for Error {
  fn from(e: newt_msg::SetError) -> Self {
    match e {
      | newt_msg::SetError::TooManyOptions => Error::Encode(EncodeError::OptionsOverflow),
      | newt_msg::SetError::ValueTooLong => Error::Memory,
    }
  }
}

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use newt_msg::{Block, Code, CodeKind, Message, Token, Type};
use rand::Rng;

use crate::config::TxParams;
use crate::retry::{Attempts, RetryTimer, Strategy, Verdict};
use crate::time::Clock;

/// Which client-initiated request an exchange is carrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  /// POST /rd
  Register,
  /// POST /rd/<location>
  Update,
  /// DELETE /rd/<location>
  Deregister,
  /// POST /bs?ep=...
  BootstrapRequest,
  /// An observation notification, naming its slot
  Notify {
    #[allow(missing_docs)]
    slot: usize,
    /// Confirmable per the 24-h rule
    con: bool,
  },
  /// A composite-observation notification, naming its slot
  NotifyComposite {
    #[allow(missing_docs)]
    slot: usize,
    /// Confirmable per the 24-h rule
    con: bool,
  },
  /// A queued Send report, naming its queue id
  Send {
    #[allow(missing_docs)]
    id: u16,
  },
}

/// How an exchange ended. Delivered exactly once via
/// [`Exchange::take_outcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// A response arrived (any code; the driver inspects it)
  Done(Message),
  /// A fire-and-forget message left the socket and nothing further is
  /// expected
  Sent,
  /// The retransmission budget or the overall deadline ran out
  Timeout,
  /// The peer answered with Reset
  Reset,
  /// [`Exchange::terminate`] was called
  Terminated,
}

/// What [`Exchange::poll`] wants the owner to do
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
  /// Put the current request on the wire (again)
  Transmit,
}

/// What [`Exchange::on_dgram`] made of an inbound message
#[derive(Debug, PartialEq, Eq)]
pub enum Recv {
  /// Not addressed to this exchange; probably a server request
  NotMine,
  /// Empty-ACK: retransmission stops, the response will come separately
  AckedEmpty,
  /// 2.31 Continue for our Block1: advance the upload window
  Continue {
    /// Block size the peer confirmed (it may shrink ours)
    size: u16,
  },
  /// The exchange reached a terminal state; collect the outcome
  Finished {
    /// The response was confirmable and needs an Empty-ACK back
    needs_ack: bool,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  ToSend,
  Waiting,
  Finished,
}

/// Progress of a Block1 upload out of the engine's staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockUpload {
  /// Negotiated block size
  pub size: u16,
  /// Offset of the current block within the staged body
  pub off: usize,
  /// Staged body length
  pub total: usize,
}

impl BlockUpload {
  /// Does another block follow the current one?
  pub fn more(&self) -> bool {
    self.off + (self.size as usize) < self.total
  }

  /// The current block number
  pub fn num(&self) -> u32 {
    (self.off / self.size as usize) as u32
  }
}

/// One in-flight client exchange: a request, its retransmission state,
/// and its terminal outcome. The engine owns at most one of these at a
/// time.
///
/// The exchange does not touch the socket itself; the owner transmits
/// when [`poll`](Exchange::poll) says [`Action::Transmit`] and feeds
/// every inbound datagram through [`on_dgram`](Exchange::on_dgram).
#[derive(Debug)]
pub struct Exchange<C: Clock> {
  /// See [`Kind`]
  pub kind: Kind,
  req: Message,
  state: State,
  outcome: Option<Outcome>,
  retry: Option<RetryTimer<C>>,
  acked: bool,
  ack_completes: bool,
  deadline: Option<Instant<C>>,
  block: Option<BlockUpload>,
}

impl<C: Clock> Exchange<C> {
  /// Wrap a fully-built request (id and token already assigned)
  pub fn new(kind: Kind, req: Message) -> Self {
    Self { kind,
           req,
           state: State::ToSend,
           outcome: None,
           retry: None,
           acked: false,
           ack_completes: false,
           deadline: None,
           block: None }
  }

  /// A confirmable message whose whole job is done once the peer ACKs
  /// it (a CON notification elicits no response)
  pub fn complete_on_ack(&mut self) {
    self.ack_completes = true;
  }

  /// Bound the whole exchange, independent of retransmission
  pub fn set_deadline(&mut self, at: Instant<C>) {
    self.deadline = Some(at);
  }

  /// Begin a Block1 upload; the owner re-slices the staged body into
  /// [`Exchange::request_mut`] before each transmit
  pub fn set_block(&mut self, block: BlockUpload) {
    self.block = Some(block);
  }

  #[allow(missing_docs)]
  pub fn block(&self) -> Option<BlockUpload> {
    self.block
  }

  #[allow(missing_docs)]
  pub fn token(&self) -> Token {
    self.req.token
  }

  /// The request as currently staged
  pub fn request(&self) -> &Message {
    &self.req
  }

  /// Mutable access for block re-slicing and id refresh
  pub fn request_mut(&mut self) -> &mut Message {
    &mut self.req
  }

  /// Does the owner need to transmit now?
  pub fn poll(&mut self, now: Instant<C>) -> Option<Action> {
    if self.state == State::Finished {
      return None;
    }

    if let Some(deadline) = self.deadline {
      if now >= deadline {
        self.finish(Outcome::Timeout);
        return None;
      }
    }

    match self.state {
      | State::ToSend => Some(Action::Transmit),
      | State::Waiting if !self.acked => match self.retry.as_mut().map(|r| r.poll(now)) {
        | Some(Ok(Verdict::Retry)) => Some(Action::Transmit),
        | Some(Ok(Verdict::GiveUp)) => {
          self.finish(Outcome::Timeout);
          None
        },
        | _ => None,
      },
      | _ => None,
    }
  }

  /// The datagram for the current request left the socket
  pub fn on_transmitted<R: Rng>(&mut self, now: Instant<C>, tx: &TxParams, rng: &mut R) {
    match self.req.ty {
      | Type::Con => {
        if self.state == State::ToSend {
          let range = tx.initial_timeout_range();
          self.retry = Some(RetryTimer::new(now,
                                            Strategy::Exponential { init_min:
                                                                      Milliseconds(*range.start()),
                                                                    init_max:
                                                                      Milliseconds(*range.end()) },
                                            tx.max_retransmit,
                                            rng));
          self.state = State::Waiting;
        }
      },
      | _ => {
        // fire-and-forget: a NON notification completes on send
        self.finish(Outcome::Sent);
      },
    }
  }

  /// Feed an inbound datagram through this exchange
  pub fn on_dgram(&mut self, msg: &Message, _now: Instant<C>) -> Recv {
    if self.state != State::Waiting {
      return Recv::NotMine;
    }

    match (msg.ty, msg.code.kind()) {
      | (Type::Ack, CodeKind::Empty) if msg.id == self.req.id => {
        self.acked = true;
        if self.ack_completes {
          self.finish(Outcome::Sent);
          return Recv::Finished { needs_ack: false };
        }
        Recv::AckedEmpty
      },
      | (Type::Reset, _) if msg.id == self.req.id || msg.token == self.req.token => {
        self.finish(Outcome::Reset);
        Recv::Finished { needs_ack: false }
      },
      | (_, CodeKind::Response) if msg.token == self.req.token => {
        if msg.code == Code::CONTINUE {
          if let (Some(up), Some(b1)) = (self.block, msg.block1()) {
            if b1.num() == up.num() && up.more() {
              // the peer may negotiate the block size down
              let size = b1.size().min(up.size);
              self.acked = false;
              self.retry = None;
              self.state = State::ToSend;
              return Recv::Continue { size };
            }
          }
        }

        let needs_ack = msg.ty == Type::Con;
        self.finish(Outcome::Done(msg.clone()));
        Recv::Finished { needs_ack }
      },
      | _ => Recv::NotMine,
    }
  }

  /// Force the exchange to end now with [`Outcome::Terminated`]; any
  /// later reply on this token is dropped
  pub fn terminate(&mut self) {
    if self.state != State::Finished {
      self.finish(Outcome::Terminated);
    }
  }

  /// Collect the terminal outcome; yields `Some` exactly once
  pub fn take_outcome(&mut self) -> Option<Outcome> {
    self.outcome.take()
  }

  /// Has the exchange reached a terminal state?
  pub fn is_finished(&self) -> bool {
    self.state == State::Finished
  }

  /// When this exchange needs attention next
  pub fn next_deadline(&self) -> Option<Instant<C>> {
    let retrans = match (&self.retry, self.acked, self.state) {
      | (Some(r), false, State::Waiting) => Some(r.next_fire()),
      | _ => None,
    };
    crate::time::min_instant(retrans, self.deadline)
  }

  fn finish(&mut self, outcome: Outcome) {
    self.state = State::Finished;
    self.outcome = Some(outcome);
  }
}

/// Pick the block size for an upload: the largest RFC 7959 size that
/// fits the link MTU minus a header/options budget
pub fn negotiated_block_size(inner_mtu: usize) -> u16 {
  const HEADER_BUDGET: usize = 128;
  Block::size_fitting(inner_mtu.saturating_sub(HEADER_BUDGET))
}

use no_std_net::SocketAddr;

/// Which datagram transport a socket speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
  /// Plain UDP
  Udp,
  /// DTLS over UDP; the implementing type owns the handshake and
  /// record-layer work
  Dtls,
}

impl Transport {
  /// The binding letter this transport contributes to the registration
  /// `b=` parameter
  pub fn binding(&self) -> char {
    'U'
  }
}

/// Classification of a hard socket error, so the engine can map it onto
/// its own error taxonomy without knowing the implementor's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockErrorKind {
  /// The datagram exceeds what this link will carry in one piece
  Msgsize,
  /// The socket is not connected
  NotConnected,
  /// Anything else
  Other,
}

/// A connected datagram socket: the engine's one window onto the network.
///
/// An LwM2M client talks to exactly one server at a time, so unlike a
/// general CoAP socket this trait is connection-oriented: `connect` pins
/// the remote address and `send`/`recv` work on that conversation only.
///
/// Every I/O operation is non-blocking and returns [`nb::Result`];
/// `nb::Error::WouldBlock` is a suspension point, never a failure, and
/// must be kept distinct from hard errors.
pub trait Socket {
  /// The error yielded by socket operations
  type Error: core::fmt::Debug;

  /// Establish (or re-establish) the conversation with `addr`.
  ///
  /// For UDP this is address pinning and may complete immediately; for
  /// DTLS it drives the handshake and is expected to return `WouldBlock`
  /// across several `step()` calls.
  fn connect(&mut self, addr: SocketAddr) -> nb::Result<(), Self::Error>;

  /// Send one datagram to the connected peer
  fn send(&mut self, msg: &[u8]) -> nb::Result<usize, Self::Error>;

  /// Receive one datagram from the connected peer.
  ///
  /// Datagrams from other senders are dropped by the implementor. A
  /// datagram larger than `buf` is truncated, like
  /// `std::net::UdpSocket::recv`.
  fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error>;

  /// Close the conversation, releasing transport resources.
  ///
  /// `WouldBlock` means teardown needs more `step()` calls (e.g. a DTLS
  /// close-notify in flight).
  fn close(&mut self) -> nb::Result<(), Self::Error>;

  /// Largest payload one `send` will carry without fragmenting
  fn inner_mtu(&self) -> usize;

  /// On the next `connect`, bind to the same local port as the previous
  /// conversation (so a NAT'd server can still reach us after a
  /// queue-mode reopen)
  fn reuse_last_port(&mut self) -> Result<(), Self::Error>;

  /// See [`Transport`]
  fn transport(&self) -> Transport;

  /// Classify a hard error; the default lumps everything into
  /// [`SockErrorKind::Other`]
  fn error_kind(_: &Self::Error) -> SockErrorKind {
    SockErrorKind::Other
  }
}

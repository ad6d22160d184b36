//! Batteries for hosts that have `std`: a non-blocking
//! [`UdpSocket`](std::net::UdpSocket)-backed [`Socket`] implementation
//! and address conversions between `no_std_net` and `std::net`.

use std::io;
use std::net::UdpSocket as StdUdp;

use crate::net::{SockErrorKind, Socket, Transport};

/// Convert a `no_std_net` address (what the engine speaks) into the
/// `std` flavor
pub fn std_addr(addr: no_std_net::SocketAddr) -> std::net::SocketAddr {
  use no_std_net::SocketAddr::*;

  match addr {
    | V4(a) => {
      let [b0, b1, b2, b3] = a.ip().octets();
      std::net::SocketAddr::from(([b0, b1, b2, b3], a.port()))
    },
    | V6(a) => {
      std::net::SocketAddr::from((a.ip().octets(), a.port()))
    },
  }
}

/// A connected, non-blocking UDP socket for the engine.
///
/// Created unbound; `connect` binds (reusing the previous local port
/// after [`Socket::reuse_last_port`]), switches to non-blocking mode,
/// and pins the peer.
#[derive(Debug, Default)]
pub struct UdpSocket {
  sock: Option<StdUdp>,
  last_port: Option<u16>,
  reuse_port: bool,
  mtu: usize,
}

impl UdpSocket {
  /// An unconnected socket that will report `mtu` as its inner MTU
  pub fn new(mtu: usize) -> Self {
    Self { sock: None,
           last_port: None,
           reuse_port: false,
           mtu }
  }
}

fn io_to_nb(e: io::Error) -> nb::Error<io::Error> {
  if e.kind() == io::ErrorKind::WouldBlock {
    nb::Error::WouldBlock
  } else {
    nb::Error::Other(e)
  }
}

impl Socket for UdpSocket {
  type Error = io::Error;

  fn connect(&mut self, addr: no_std_net::SocketAddr) -> nb::Result<(), io::Error> {
    if self.sock.is_some() {
      return Ok(());
    }

    let port = if self.reuse_port {
      self.last_port.unwrap_or(0)
    } else {
      0
    };
    self.reuse_port = false;

    let sock = StdUdp::bind(("0.0.0.0", port)).map_err(io_to_nb)?;
    sock.set_nonblocking(true).map_err(io_to_nb)?;
    sock.connect(std_addr(addr)).map_err(io_to_nb)?;
    self.last_port = sock.local_addr().ok().map(|a| a.port());
    self.sock = Some(sock);
    Ok(())
  }

  fn send(&mut self, msg: &[u8]) -> nb::Result<usize, io::Error> {
    match &self.sock {
      | Some(s) => s.send(msg).map_err(io_to_nb),
      | None => Err(nb::Error::Other(io::ErrorKind::NotConnected.into())),
    }
  }

  fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, io::Error> {
    match &self.sock {
      | Some(s) => s.recv(buf).map_err(io_to_nb),
      | None => Err(nb::Error::Other(io::ErrorKind::NotConnected.into())),
    }
  }

  fn close(&mut self) -> nb::Result<(), io::Error> {
    self.sock = None;
    Ok(())
  }

  fn inner_mtu(&self) -> usize {
    self.mtu
  }

  fn reuse_last_port(&mut self) -> Result<(), io::Error> {
    self.reuse_port = true;
    Ok(())
  }

  fn transport(&self) -> Transport {
    Transport::Udp
  }

  fn error_kind(e: &io::Error) -> SockErrorKind {
    match e.kind() {
      | io::ErrorKind::NotConnected => SockErrorKind::NotConnected,
      | io::ErrorKind::InvalidInput => SockErrorKind::Msgsize,
      | _ => SockErrorKind::Other,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn addr_conversion() {
    let addr = no_std_net::SocketAddr::V4(no_std_net::SocketAddrV4::new(
      no_std_net::Ipv4Addr::new(127, 0, 0, 1), 5683));
    assert_eq!(std_addr(addr),
               std::net::SocketAddr::from(([127, 0, 0, 1], 5683)));
  }

  #[test]
  fn connect_then_reuse_keeps_port() {
    let target = no_std_net::SocketAddr::V4(no_std_net::SocketAddrV4::new(
      no_std_net::Ipv4Addr::new(127, 0, 0, 1), 5683));

    let mut sock = UdpSocket::new(1152);
    nb::block!(sock.connect(target)).unwrap();
    let port = sock.last_port.unwrap();

    nb::block!(sock.close()).unwrap();
    sock.reuse_last_port().unwrap();
    nb::block!(sock.connect(target)).unwrap();
    assert_eq!(sock.last_port, Some(port));
  }
}

use std::io;
use std::net::{
  IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket,
};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Upper bound on any single blocking receive, so a loop re-checks its stop
/// flag even if the wake-up datagram is lost.
pub(crate) const RECV_POLL: Duration = Duration::from_millis(100);

// Large enough for any protocol frame plus unrelated traffic.
pub(crate) const RECV_BUF_LEN: usize = 2048;

/// Resolves `host:port`, preferring IPv4 results.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
  let addrs: Vec<SocketAddr> = (host, port)
    .to_socket_addrs()
    .map_err(|source| SyncError::Resolve {
      host: host.to_string(),
      source,
    })?
    .collect();
  addrs
    .iter()
    .find(|a| a.is_ipv4())
    .or_else(|| addrs.first())
    .copied()
    .ok_or_else(|| SyncError::InvalidAddress(format!("{host}:{port}")))
}

/// Binds a UDP socket whose receives time out after [`RECV_POLL`].
pub(crate) fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
  let socket =
    UdpSocket::bind(addr).map_err(|source| SyncError::Bind { addr, source })?;
  socket
    .set_read_timeout(Some(RECV_POLL))
    .map_err(SyncError::Socket)?;
  Ok(socket)
}

/// Unspecified address of the same family as `peer`, port 0.
pub(crate) fn ephemeral_for(peer: &SocketAddr) -> SocketAddr {
  match peer {
    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
  }
}

/// Sends an empty datagram to a loop's own socket so a blocked receive
/// returns. Empty datagrams never decode, so the loop discards it.
pub(crate) fn wake(local: SocketAddr) {
  let target: SocketAddr = match local.ip() {
    ip if !ip.is_unspecified() => local,
    IpAddr::V4(_) => (Ipv4Addr::LOCALHOST, local.port()).into(),
    IpAddr::V6(_) => (Ipv6Addr::LOCALHOST, local.port()).into(),
  };
  let sent = UdpSocket::bind(ephemeral_for(&target))
    .and_then(|s| s.send_to(&[], target));
  if let Err(e) = sent {
    log::debug!("wake-up datagram to {target} failed: {e}");
  }
}

/// Receive errors that are part of normal operation on a shared, lossy
/// network: timeouts and ICMP port-unreachable echoes while a peer restarts.
pub(crate) fn is_transient(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::WouldBlock
      | io::ErrorKind::TimedOut
      | io::ErrorKind::Interrupted
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionRefused
  )
}

pub(crate) fn boost_current_thread_priority() {
  use thread_priority::{set_current_thread_priority, ThreadPriority};

  if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
    log::warn!("could not raise thread priority: {e:?}");
  }
}

use std::io;
use std::net::SocketAddr;

/// Errors surfaced by configuration and by `start()`.
///
/// Network conditions in the steady-state loops (lost, malformed or stale
/// datagrams, timeouts) are never reported here.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  /// Probe interval must be finite and positive.
  #[error("invalid probe interval: {0} s")]
  InvalidInterval(f64),
  #[error("invalid address: {0}")]
  InvalidAddress(String),
  #[error("failed to resolve {host}: {source}")]
  Resolve {
    host: String,
    #[source]
    source: io::Error,
  },
  #[error("failed to bind socket on {addr}: {source}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("socket setup failed: {0}")]
  Socket(#[source] io::Error),
  #[error("failed to spawn worker thread: {0}")]
  Spawn(#[source] io::Error),
  #[error("already running")]
  AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, SyncError>;

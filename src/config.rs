use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const DEFAULT_PORT: u16 = 5810;
const MIN_REPLY_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ResponderConfig {
  pub bind_addr: IpAddr,
  pub port: u16,
  /// Raise the receive thread's OS priority to reduce timestamp jitter.
  pub boost_priority: bool,
}

impl ResponderConfig {
  pub fn new(port: u16) -> Self {
    Self {
      port,
      ..Default::default()
    }
  }
}

impl Default for ResponderConfig {
  fn default() -> Self {
    Self {
      bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      port: DEFAULT_PORT,
      boost_priority: false,
    }
  }
}

#[derive(Debug, Clone)]
pub struct InitiatorConfig {
  pub host: String,
  pub port: u16,
  interval: Duration,
  reply_timeout: Option<Duration>,
  pub boost_priority: bool,
}

impl InitiatorConfig {
  /// `interval_secs` may be fractional; it must be finite and positive.
  pub fn new(
    host: impl Into<String>,
    port: u16,
    interval_secs: f64,
  ) -> Result<Self> {
    let host = host.into();
    if host.trim().is_empty() {
      return Err(SyncError::InvalidAddress(host));
    }
    Ok(Self {
      host,
      port,
      interval: interval_from_secs(interval_secs)?,
      reply_timeout: None,
      boost_priority: false,
    })
  }

  /// Caps how long each cycle waits for its reply. Values above the
  /// interval are clamped to it.
  pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
    self.reply_timeout = Some(timeout);
    self
  }

  pub fn with_boost_priority(mut self, boost: bool) -> Self {
    self.boost_priority = boost;
    self
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Bounded wait for a reply. Defaults to the full interval; kept within
  /// 1 ms and the interval.
  pub fn reply_timeout(&self) -> Duration {
    self
      .reply_timeout
      .unwrap_or(self.interval)
      .clamp(MIN_REPLY_TIMEOUT, self.interval.max(MIN_REPLY_TIMEOUT))
  }
}

fn interval_from_secs(secs: f64) -> Result<Duration> {
  if !secs.is_finite() || secs <= 0.0 {
    return Err(SyncError::InvalidInterval(secs));
  }
  let interval = Duration::try_from_secs_f64(secs)
    .map_err(|_| SyncError::InvalidInterval(secs))?;
  if interval.is_zero() {
    return Err(SyncError::InvalidInterval(secs));
  }
  Ok(interval)
}

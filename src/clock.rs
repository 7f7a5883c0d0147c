use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of protocol timestamps, in microseconds.
pub trait Clock: Send + Sync {
  fn now_micros(&self) -> i64;
}

/// Wall clock: microseconds since the UNIX epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_micros(&self) -> i64 {
    let since_epoch = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_else(|_| Duration::from_micros(0));
    i64::try_from(since_epoch.as_micros()).unwrap_or(i64::MAX)
  }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::timesync::TimeSyncSample;

/// Latest synchronization estimate, handed out by value.
///
/// All zero until the first reply has been accepted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncMetadata {
  pub offset_micros: i64,
  pub round_trip_micros: i64,
  /// Client-clock time (t3) at which the reply behind this estimate arrived.
  pub last_reply_time_micros: i64,
  /// Sequence number of the accepted reply. Never 0 once published.
  pub sequence_number: u32,
}

impl TimeSyncMetadata {
  /// True once a reply has been accepted. Keyed on the sequence number,
  /// since any timestamp (including 0) is a valid clock reading.
  pub fn has_estimate(&self) -> bool {
    self.sequence_number != 0
  }

  /// Microseconds since the reply behind this estimate, or `None` before
  /// the first reply.
  pub fn age_micros(&self, now_micros: i64) -> Option<i64> {
    self
      .has_estimate()
      .then(|| now_micros.saturating_sub(self.last_reply_time_micros))
  }

  /// True when there is no estimate or it is older than `max_age`.
  pub fn is_stale(&self, now_micros: i64, max_age: Duration) -> bool {
    let max_age = i64::try_from(max_age.as_micros()).unwrap_or(i64::MAX);
    match self.age_micros(now_micros) {
      Some(age) => age > max_age,
      None => true,
    }
  }

  /// Translates a client-clock timestamp into the server's clock.
  pub fn to_server_time(&self, local_micros: i64) -> i64 {
    local_micros.saturating_add(self.offset_micros)
  }
}

/// Single-writer publish cell for [`TimeSyncMetadata`].
///
/// The timing loop replaces the whole value under the lock; readers copy it
/// out. The critical section is a plain copy on both sides.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedMetadata {
  inner: Arc<Mutex<TimeSyncMetadata>>,
}

impl SharedMetadata {
  pub(crate) fn snapshot(&self) -> TimeSyncMetadata {
    *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn publish(
    &self,
    sample: TimeSyncSample,
    reply_time_micros: i64,
    sequence_number: u32,
  ) -> TimeSyncMetadata {
    let next = TimeSyncMetadata {
      offset_micros: sample.offset_us,
      round_trip_micros: sample.round_trip_us,
      last_reply_time_micros: reply_time_micros,
      sequence_number,
    };
    *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = next;
    next
  }
}

/// Per-initiator diagnostic counters.
///
/// Kept apart from [`TimeSyncMetadata`] so the estimate only changes when a
/// reply is accepted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InitiatorStats {
  pub probes_sent: u64,
  pub replies_received: u64,
  pub timeouts: u64,
  /// Replies for another or an already settled probe.
  pub stale_replies: u64,
  /// Matched replies whose sample was rejected (negative round trip).
  pub discarded_samples: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
  probes_sent: AtomicU64,
  replies_received: AtomicU64,
  timeouts: AtomicU64,
  stale_replies: AtomicU64,
  discarded_samples: AtomicU64,
}

impl StatsCounters {
  pub(crate) fn probe_sent(&self) {
    self.probes_sent.fetch_add(1, Ordering::Relaxed);
  }
  pub(crate) fn reply_received(&self) {
    self.replies_received.fetch_add(1, Ordering::Relaxed);
  }
  pub(crate) fn timed_out(&self) {
    self.timeouts.fetch_add(1, Ordering::Relaxed);
  }
  pub(crate) fn stale_reply(&self) {
    self.stale_replies.fetch_add(1, Ordering::Relaxed);
  }
  pub(crate) fn sample_discarded(&self) {
    self.discarded_samples.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self) -> InitiatorStats {
    InitiatorStats {
      probes_sent: self.probes_sent.load(Ordering::Relaxed),
      replies_received: self.replies_received.load(Ordering::Relaxed),
      timeouts: self.timeouts.load(Ordering::Relaxed),
      stale_replies: self.stale_replies.load(Ordering::Relaxed),
      discarded_samples: self.discarded_samples.load(Ordering::Relaxed),
    }
  }
}

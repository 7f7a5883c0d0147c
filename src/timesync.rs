// Clock offset / round-trip estimation from one probe exchange.

/// Result of one probe/reply exchange, in microseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncSample {
  /// Server clock minus client clock.
  pub offset_us: i64,
  /// Network transit time, excluding time spent inside the responder.
  pub round_trip_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
  /// Clock or framing corruption; the exchange cannot be trusted.
  NegativeRoundTrip(i64),
  Overflow,
}

impl core::fmt::Display for SampleRejection {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      SampleRejection::NegativeRoundTrip(rtt) => {
        write!(f, "negative round trip ({rtt} us)")
      }
      SampleRejection::Overflow => write!(f, "timestamps out of range"),
    }
  }
}

// NTP-like: t0=client send, t1=server recv, t2=server send, t3=client recv
pub fn compute_sample(
  t0_us: i64,
  t1_us: i64,
  t2_us: i64,
  t3_us: i64,
) -> Result<TimeSyncSample, SampleRejection> {
  let t0 = t0_us as i128;
  let t1 = t1_us as i128;
  let t2 = t2_us as i128;
  let t3 = t3_us as i128;

  let round_trip = (t3 - t0) - (t2 - t1);
  let offset = ((t1 - t0) + (t2 - t3)) / 2;

  let round_trip_us =
    i64::try_from(round_trip).map_err(|_| SampleRejection::Overflow)?;
  let offset_us =
    i64::try_from(offset).map_err(|_| SampleRejection::Overflow)?;
  if round_trip_us < 0 {
    return Err(SampleRejection::NegativeRoundTrip(round_trip_us));
  }
  Ok(TimeSyncSample {
    offset_us,
    round_trip_us,
  })
}

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use time_sync::{Initiator, InitiatorConfig, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "time_sync_client")]
#[command(
  about = "Estimates clock offset and round trip to a time sync server"
)]
struct Args {
  #[arg(long, default_value = "127.0.0.1")]
  host: String,

  #[arg(short, long, default_value_t = DEFAULT_PORT)]
  port: u16,

  #[arg(short, long, default_value_t = 0.1, help = "Probe interval in seconds")]
  interval: f64,

  #[arg(long, help = "Reply timeout in seconds (defaults to the interval)")]
  reply_timeout: Option<f64>,

  #[arg(short, long, help = "Exit after this many new estimates")]
  count: Option<u64>,

  #[arg(long, help = "Raise the timing thread's OS priority")]
  boost_priority: bool,
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();
  let args = Args::parse();

  let mut config = InitiatorConfig::new(&args.host, args.port, args.interval)
    .context("invalid client configuration")?
    .with_boost_priority(args.boost_priority);
  if let Some(secs) = args.reply_timeout {
    let timeout = Duration::try_from_secs_f64(secs)
      .with_context(|| format!("invalid reply timeout: {secs}"))?;
    config = config.with_reply_timeout(timeout);
  }
  let interval = config.interval();

  let initiator = Initiator::new(config);
  initiator.start().with_context(|| {
    format!("failed to start client for {}:{}", args.host, args.port)
  })?;

  let mut last_seq = 0;
  let mut reported = 0u64;
  loop {
    thread::sleep(interval);
    let m = initiator.metadata();
    if !m.has_estimate() || m.sequence_number == last_seq {
      continue;
    }
    last_seq = m.sequence_number;
    reported += 1;

    let stats = initiator.stats();
    log::info!(
      "seq {} | offset {:+} us | rtt {} us | sent {} | recv {} | timeouts {}",
      m.sequence_number,
      m.offset_micros,
      m.round_trip_micros,
      stats.probes_sent,
      stats.replies_received,
      stats.timeouts,
    );
    if args.count.is_some_and(|n| reported >= n) {
      break;
    }
  }

  initiator.stop();
  Ok(())
}

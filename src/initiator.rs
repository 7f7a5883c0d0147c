// Client side of the time sync protocol.
//
// A background thread sends one probe per interval, waits a bounded time
// for the matching reply and publishes the resulting offset / round-trip
// estimate. Lost replies are retried on the next cycle, and a restarted
// peer is picked up again by the first reply that gets through.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::InitiatorConfig;
use crate::error::{Result, SyncError};
use crate::metadata::{
  InitiatorStats, SharedMetadata, StatsCounters, TimeSyncMetadata,
};
use crate::net;
use crate::packet::{self, Message, Probe, Reply};
use crate::timesync::compute_sample;

struct Worker {
  stop: Arc<AtomicBool>,
  local_addr: SocketAddr,
  handle: JoinHandle<()>,
}

/// Periodically probes a [`Responder`](crate::Responder) and keeps the
/// latest clock estimate.
pub struct Initiator {
  config: InitiatorConfig,
  clock: Arc<dyn Clock>,
  metadata: SharedMetadata,
  stats: Arc<StatsCounters>,
  // Survives restarts so sequence numbers never repeat within an instance.
  next_seq: Arc<AtomicU32>,
  worker: Mutex<Option<Worker>>,
}

impl Initiator {
  pub fn new(config: InitiatorConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock))
  }

  pub fn with_clock(config: InitiatorConfig, clock: Arc<dyn Clock>) -> Self {
    Self {
      config,
      clock,
      metadata: SharedMetadata::default(),
      stats: Arc::new(StatsCounters::default()),
      next_seq: Arc::new(AtomicU32::new(1)),
      worker: Mutex::new(None),
    }
  }

  /// Resolves the responder, binds a local socket and spawns the timing
  /// loop.
  ///
  /// The responder does not need to be up yet; probes are sent on schedule
  /// regardless.
  ///
  /// # Errors
  /// Fails if the target cannot be resolved, the socket cannot be bound, or
  /// the thread cannot be spawned; [`SyncError::AlreadyRunning`] if already
  /// started.
  pub fn start(&self) -> Result<()> {
    let mut worker = self.lock_worker();
    if worker.is_some() {
      return Err(SyncError::AlreadyRunning);
    }

    let target = net::resolve(&self.config.host, self.config.port)?;
    let socket = net::bind_udp(net::ephemeral_for(&target))?;
    let local_addr = socket.local_addr().map_err(SyncError::Socket)?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut timing = TimingLoop {
      socket,
      target,
      clock: Arc::clone(&self.clock),
      metadata: self.metadata.clone(),
      stats: Arc::clone(&self.stats),
      stop: Arc::clone(&stop),
      interval: self.config.interval(),
      reply_timeout: self.config.reply_timeout(),
      next_seq: Arc::clone(&self.next_seq),
      last_matched_seq: None,
    };
    let boost = self.config.boost_priority;
    let handle = thread::Builder::new()
      .name("time-sync-initiator".into())
      .spawn(move || {
        if boost {
          net::boost_current_thread_priority();
        }
        log::info!(
          "initiator probing {} every {:?} from {}",
          timing.target,
          timing.interval,
          local_addr
        );
        timing.run();
        log::info!("initiator for {} exiting", timing.target);
      })
      .map_err(SyncError::Spawn)?;

    *worker = Some(Worker {
      stop,
      local_addr,
      handle,
    });
    Ok(())
  }

  /// Stops the timing loop and waits for it to exit. The socket is closed
  /// by the time this returns. Safe to call repeatedly or before `start`.
  pub fn stop(&self) {
    let Some(worker) = self.lock_worker().take() else {
      return;
    };
    worker.stop.store(true, Ordering::SeqCst);
    // interrupts either the reply wait or the inter-probe sleep
    net::wake(worker.local_addr);
    worker.handle.thread().unpark();
    if worker.handle.join().is_err() {
      log::error!("initiator thread panicked");
    }
  }

  pub fn is_running(&self) -> bool {
    self.lock_worker().is_some()
  }

  /// Latest published estimate, by value.
  pub fn metadata(&self) -> TimeSyncMetadata {
    self.metadata.snapshot()
  }

  pub fn stats(&self) -> InitiatorStats {
    self.stats.snapshot()
  }

  /// Current local time expressed on the responder's clock.
  pub fn server_time_micros(&self) -> i64 {
    self.metadata().to_server_time(self.clock.now_micros())
  }

  pub fn config(&self) -> &InitiatorConfig {
    &self.config
  }

  fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
    self.worker.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Drop for Initiator {
  fn drop(&mut self) {
    self.stop();
  }
}

enum WaitOutcome {
  Matched { reply: Reply, t3_us: i64 },
  TimedOut,
  Stopped,
}

struct TimingLoop {
  socket: UdpSocket,
  target: SocketAddr,
  clock: Arc<dyn Clock>,
  metadata: SharedMetadata,
  stats: Arc<StatsCounters>,
  stop: Arc<AtomicBool>,
  interval: Duration,
  reply_timeout: Duration,
  next_seq: Arc<AtomicU32>,
  last_matched_seq: Option<u32>,
}

impl TimingLoop {
  fn run(&mut self) {
    let mut next_probe = Instant::now();
    while !self.stopped() {
      let cycle_start = Instant::now();
      let probe = self.send_probe();

      match self.await_reply(&probe, cycle_start + self.reply_timeout) {
        WaitOutcome::Matched { reply, t3_us } => self.accept(reply, t3_us),
        WaitOutcome::TimedOut => {
          self.stats.timed_out();
          log::debug!("probe {} to {} timed out", probe.seq, self.target);
        }
        WaitOutcome::Stopped => break,
      }

      next_probe += self.interval;
      let now = Instant::now();
      if next_probe + self.interval < now {
        // fell more than a cycle behind; resume the cadence from now
        next_probe = now;
      }
      self.sleep_until(next_probe);
    }
  }

  fn stopped(&self) -> bool {
    self.stop.load(Ordering::SeqCst)
  }

  fn send_probe(&self) -> Probe {
    let probe = Probe {
      seq: self.allocate_seq(),
      t0_us: self.clock.now_micros(),
    };

    let frame = packet::encode(&Message::Probe(probe));
    match self.socket.send_to(&frame, self.target) {
      Ok(_) => self.stats.probe_sent(),
      // no route / peer gone: the cycle just ends in a timeout
      Err(e) => {
        log::debug!("probe {} to {} failed: {e}", probe.seq, self.target)
      }
    }
    probe
  }

  // 0 marks "no estimate" in the snapshot, so it is skipped on wrap-around.
  fn allocate_seq(&self) -> u32 {
    match self.next_seq.fetch_add(1, Ordering::Relaxed) {
      0 => self.next_seq.fetch_add(1, Ordering::Relaxed),
      seq => seq,
    }
  }

  fn await_reply(&self, probe: &Probe, deadline: Instant) -> WaitOutcome {
    let mut buf = [0u8; net::RECV_BUF_LEN];
    loop {
      if self.stopped() {
        return WaitOutcome::Stopped;
      }
      let now = Instant::now();
      if now >= deadline {
        return WaitOutcome::TimedOut;
      }
      let wait = (deadline - now).min(net::RECV_POLL);
      if let Err(e) = self.socket.set_read_timeout(Some(wait)) {
        log::warn!("setting receive timeout failed: {e}");
      }

      let (len, src) = match self.socket.recv_from(&mut buf) {
        Ok(received) => received,
        Err(e) if net::is_transient(&e) => continue,
        Err(e) => {
          log::warn!("initiator receive failed: {e}");
          thread::sleep(wait);
          continue;
        }
      };
      let t3_us = self.clock.now_micros();
      if self.stopped() {
        return WaitOutcome::Stopped;
      }

      match packet::decode(&buf[..len]) {
        Ok(Message::Reply(reply)) if reply.answers(probe) => {
          return WaitOutcome::Matched { reply, t3_us };
        }
        Ok(Message::Reply(reply)) => {
          self.stats.stale_reply();
          let older = self
            .last_matched_seq
            .is_some_and(|last| reply.seq <= last);
          log::debug!(
            "discarding {} reply {} from {src} while waiting for {}",
            if older { "stale" } else { "unmatched" },
            reply.seq,
            probe.seq
          );
        }
        Ok(Message::Probe(_)) => {
          log::trace!("ignoring probe datagram from {src}");
        }
        Err(e) => {
          log::trace!("discarding {len} byte datagram from {src}: {e}");
        }
      }
    }
  }

  fn accept(&mut self, reply: Reply, t3_us: i64) {
    self.stats.reply_received();
    self.last_matched_seq = Some(reply.seq);
    match compute_sample(reply.t0_us, reply.t1_us, reply.t2_us, t3_us) {
      Ok(sample) => {
        let published = self.metadata.publish(sample, t3_us, reply.seq);
        log::debug!(
          "seq {}: offset {} us, rtt {} us",
          published.sequence_number,
          published.offset_micros,
          published.round_trip_micros
        );
      }
      Err(rejection) => {
        self.stats.sample_discarded();
        log::debug!("discarding sample for seq {}: {rejection}", reply.seq);
      }
    }
  }

  fn sleep_until(&self, when: Instant) {
    loop {
      if self.stopped() {
        return;
      }
      let now = Instant::now();
      if now >= when {
        return;
      }
      // stop() unparks; spurious wakeups just go round again
      thread::park_timeout(when - now);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  /// Scripted responder: answers each probe via `respond`, on a raw socket.
  fn scripted_peer<F>(
    respond: F,
  ) -> (SocketAddr, JoinHandle<()>, Arc<AtomicBool>)
  where
    F: Fn(Probe) -> Vec<Vec<u8>> + Send + 'static,
  {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
      .set_read_timeout(Some(Duration::from_millis(20)))
      .unwrap();
    let addr = socket.local_addr().unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let thread_done = Arc::clone(&done);
    let handle = thread::spawn(move || {
      let mut buf = [0u8; 128];
      while !thread_done.load(Ordering::SeqCst) {
        let Ok((n, src)) = socket.recv_from(&mut buf) else {
          continue;
        };
        if let Ok(Message::Probe(p)) = packet::decode(&buf[..n]) {
          for datagram in respond(p) {
            let _ = socket.send_to(&datagram, src);
          }
        }
      }
    });
    (addr, handle, done)
  }

  fn initiator_for(addr: SocketAddr, interval_secs: f64) -> Initiator {
    let config =
      InitiatorConfig::new(addr.ip().to_string(), addr.port(), interval_secs)
        .unwrap();
    Initiator::new(config)
  }

  fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
      if cond() {
        return true;
      }
      thread::sleep(Duration::from_millis(5));
    }
    cond()
  }

  #[test]
  fn unmatched_replies_do_not_change_estimate() {
    let (addr, peer, done) = scripted_peer(|p| {
      let wrong_seq = Reply {
        seq: p.seq.wrapping_add(1000),
        t0_us: p.t0_us,
        t1_us: 1,
        t2_us: 1,
      };
      let wrong_t0 = Reply {
        seq: p.seq,
        t0_us: p.t0_us - 1,
        t1_us: 1,
        t2_us: 1,
      };
      vec![
        packet::encode(&Message::Reply(wrong_seq)).to_vec(),
        packet::encode(&Message::Reply(wrong_t0)).to_vec(),
        b"unrelated traffic".to_vec(),
      ]
    });
    let initiator = initiator_for(addr, 0.05);
    initiator.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
      initiator.stats().stale_replies >= 4
    }));
    assert_eq!(initiator.metadata(), TimeSyncMetadata::default());
    assert_eq!(initiator.stats().replies_received, 0);

    initiator.stop();
    done.store(true, Ordering::SeqCst);
    peer.join().unwrap();
  }

  #[test]
  fn replayed_old_reply_leaves_estimate_unchanged() {
    // first exchange is answered properly; every later probe gets that
    // same reply back with bogus server times
    let first_reply = Mutex::new(None::<Reply>);
    let (addr, peer, done) = scripted_peer(move |p| {
      let mut first = first_reply.lock().unwrap();
      let reply = match *first {
        Some(old) => Reply {
          t1_us: 1,
          t2_us: 1,
          ..old
        },
        None => {
          let now = SystemClock.now_micros();
          let answer = p.reply(now, now);
          *first = Some(answer);
          answer
        }
      };
      vec![packet::encode(&Message::Reply(reply)).to_vec()]
    });
    let initiator = initiator_for(addr, 0.03);
    initiator.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
      initiator.metadata().has_estimate()
    }));
    let settled = initiator.metadata();
    assert_eq!(settled.sequence_number, 1);

    assert!(wait_for(Duration::from_secs(2), || {
      initiator.stats().stale_replies >= 3
    }));
    let replays = initiator.stats().stale_replies;
    assert!(wait_for(Duration::from_secs(2), || {
      initiator.stats().stale_replies > replays
    }));

    let m = initiator.metadata();
    assert_eq!(m, settled);
    assert_eq!(m.sequence_number, 1);
    assert_eq!(m.offset_micros, settled.offset_micros);
    assert_eq!(m.round_trip_micros, settled.round_trip_micros);
    let stats = initiator.stats();
    assert_eq!(stats.replies_received, 1);
    assert_eq!(stats.discarded_samples, 0);

    initiator.stop();
    done.store(true, Ordering::SeqCst);
    peer.join().unwrap();
  }

  #[test]
  fn sequence_numbers_skip_zero_on_wrap() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let peer_seen = Arc::clone(&seen);
    let (addr, peer, done) = scripted_peer(move |p| {
      peer_seen.lock().unwrap().push(p.seq);
      let reply = p.reply(p.t0_us, p.t0_us);
      vec![packet::encode(&Message::Reply(reply)).to_vec()]
    });
    let initiator = initiator_for(addr, 0.03);
    initiator.next_seq.store(u32::MAX, Ordering::Relaxed);
    initiator.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
      seen.lock().unwrap().len() >= 3
    }));
    initiator.stop();
    assert_eq!(seen.lock().unwrap()[..3], [u32::MAX, 1, 2]);
    assert!(initiator.metadata().has_estimate());
    assert_ne!(initiator.metadata().sequence_number, 0);

    done.store(true, Ordering::SeqCst);
    peer.join().unwrap();
  }

  #[test]
  fn negative_round_trip_is_counted_not_published() {
    // server claims to have held the probe for an hour
    let (addr, peer, done) = scripted_peer(|p| {
      let reply = p.reply(p.t0_us, p.t0_us + 3_600_000_000);
      vec![packet::encode(&Message::Reply(reply)).to_vec()]
    });
    let initiator = initiator_for(addr, 0.05);
    initiator.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
      initiator.stats().discarded_samples >= 2
    }));
    assert!(!initiator.metadata().has_estimate());

    initiator.stop();
    done.store(true, Ordering::SeqCst);
    peer.join().unwrap();
  }

  #[test]
  fn accepted_reply_publishes_estimate() {
    // fake server clock two seconds ahead of ours
    let (addr, peer, done) = scripted_peer(|p| {
      let now = SystemClock.now_micros() + 2_000_000;
      vec![packet::encode(&Message::Reply(p.reply(now, now))).to_vec()]
    });
    let initiator = initiator_for(addr, 0.05);
    initiator.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
      initiator.metadata().has_estimate()
    }));
    let m = initiator.metadata();
    assert!(m.round_trip_micros >= 0);
    assert!((m.offset_micros - 2_000_000).abs() <= m.round_trip_micros / 2 + 1);
    assert!(m.sequence_number >= 1);

    initiator.stop();
    done.store(true, Ordering::SeqCst);
    peer.join().unwrap();
  }

  #[test]
  fn stop_without_start_and_twice() {
    let initiator = initiator_for("127.0.0.1:9".parse().unwrap(), 0.1);
    initiator.stop();
    initiator.stop();
    assert!(!initiator.is_running());
  }

  #[test]
  fn stop_interrupts_long_interval() {
    let initiator = initiator_for("127.0.0.1:9".parse().unwrap(), 30.0);
    initiator.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    initiator.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(initiator.stats().probes_sent, 1);
  }

  #[test]
  fn unresolvable_target_fails_start() {
    let config = InitiatorConfig::new("no such host.invalid", 1, 0.1).unwrap();
    let initiator = Initiator::new(config);
    assert!(initiator.start().is_err());
    assert!(!initiator.is_running());
  }
}

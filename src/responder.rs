// Server side of the time sync protocol.
//
// The responder stamps every probe with its own receive and send times
// and echoes it back. It keeps no per-client state, so clients may come,
// go and restart freely.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::ResponderConfig;
use crate::error::{Result, SyncError};
use crate::net;
use crate::packet::{self, Message};

// Pause after an unexpected socket error so a broken socket can't spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct Worker {
  stop: Arc<AtomicBool>,
  local_addr: SocketAddr,
  handle: JoinHandle<()>,
}

/// Stateless probe echo service.
pub struct Responder {
  config: ResponderConfig,
  clock: Arc<dyn Clock>,
  worker: Mutex<Option<Worker>>,
}

impl Responder {
  pub fn new(config: ResponderConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock))
  }

  pub fn with_clock(config: ResponderConfig, clock: Arc<dyn Clock>) -> Self {
    Self {
      config,
      clock,
      worker: Mutex::new(None),
    }
  }

  /// Binds the listening socket and spawns the receive loop.
  ///
  /// # Errors
  /// Fails if the socket cannot be bound or the thread cannot be spawned,
  /// or with [`SyncError::AlreadyRunning`] if already started.
  pub fn start(&self) -> Result<()> {
    let mut worker = self.lock_worker();
    if worker.is_some() {
      return Err(SyncError::AlreadyRunning);
    }

    let bind_addr = SocketAddr::new(self.config.bind_addr, self.config.port);
    let socket = net::bind_udp(bind_addr)?;
    let local_addr = socket.local_addr().map_err(SyncError::Socket)?;

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let clock = Arc::clone(&self.clock);
    let boost = self.config.boost_priority;
    let handle = thread::Builder::new()
      .name("time-sync-responder".into())
      .spawn(move || {
        if boost {
          net::boost_current_thread_priority();
        }
        log::info!("responder listening on {local_addr}");
        serve(&socket, clock.as_ref(), &thread_stop);
        log::info!("responder on {local_addr} exiting");
      })
      .map_err(SyncError::Spawn)?;

    *worker = Some(Worker {
      stop,
      local_addr,
      handle,
    });
    Ok(())
  }

  /// Stops the receive loop and waits for it to exit. The socket is closed
  /// by the time this returns. Safe to call repeatedly or before `start`.
  pub fn stop(&self) {
    let Some(worker) = self.lock_worker().take() else {
      return;
    };
    worker.stop.store(true, Ordering::SeqCst);
    net::wake(worker.local_addr);
    if worker.handle.join().is_err() {
      log::error!("responder thread panicked");
    }
  }

  pub fn is_running(&self) -> bool {
    self.lock_worker().is_some()
  }

  /// Address the socket is bound to while running.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.lock_worker().as_ref().map(|w| w.local_addr)
  }

  fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
    self.worker.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Drop for Responder {
  fn drop(&mut self) {
    self.stop();
  }
}

fn serve(socket: &UdpSocket, clock: &dyn Clock, stop: &AtomicBool) {
  let mut buf = [0u8; net::RECV_BUF_LEN];
  while !stop.load(Ordering::SeqCst) {
    let (len, src) = match socket.recv_from(&mut buf) {
      Ok(received) => received,
      Err(e) if net::is_transient(&e) => continue,
      Err(e) => {
        log::warn!("responder receive failed: {e}");
        thread::sleep(ERROR_BACKOFF);
        continue;
      }
    };
    let t1_us = clock.now_micros();
    if stop.load(Ordering::SeqCst) {
      break;
    }

    let probe = match packet::decode(&buf[..len]) {
      Ok(Message::Probe(probe)) => probe,
      Ok(Message::Reply(_)) => {
        log::trace!("ignoring reply datagram from {src}");
        continue;
      }
      Err(e) => {
        log::trace!("discarding {len} byte datagram from {src}: {e}");
        continue;
      }
    };

    let t2_us = clock.now_micros();
    let reply = packet::encode(&Message::Reply(probe.reply(t1_us, t2_us)));
    if let Err(e) = socket.send_to(&reply, src) {
      log::debug!("reply to {src} for probe {} failed: {e}", probe.seq);
    }
  }
}

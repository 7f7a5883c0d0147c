use std::io;
use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use time_sync::{Responder, ResponderConfig, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "time_sync_server")]
#[command(about = "Answers time sync probes on a UDP port")]
struct Args {
  #[arg(short, long, default_value = "0.0.0.0")]
  bind: IpAddr,

  #[arg(short, long, default_value_t = DEFAULT_PORT)]
  port: u16,

  #[arg(long, help = "Raise the receive thread's OS priority")]
  boost_priority: bool,
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();
  let args = Args::parse();

  let responder = Responder::new(ResponderConfig {
    bind_addr: args.bind,
    port: args.port,
    boost_priority: args.boost_priority,
  });
  responder.start().with_context(|| {
    format!("failed to start responder on {}:{}", args.bind, args.port)
  })?;

  // Serves until stdin closes or the process is interrupted (Ctrl+C).
  log::info!("press Ctrl+D (Unix) or Ctrl+Z (Windows) to stop");
  io::copy(&mut io::stdin().lock(), &mut io::sink())
    .context("failed to read stdin")?;

  log::info!("stdin closed, shutting down");
  responder.stop();
  Ok(())
}

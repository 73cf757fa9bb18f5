//! Reference worker program for the job protocol.
//!
//! Serves on stdio by default (for process pools) or on TCP with
//! `--listen <addr>` (for remote pools). Registers a small set of built-in
//! jobs; real deployments build their own binary around
//! [`anypool::worker::serve_stdio`] and a domain [`JobRegistry`].
//!
//! Protocol lines go over stdout, so all logging goes to stderr.

use anypool::worker::{serve_stdio, serve_tcp};
use anypool::JobRegistry;

use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct SumArgs {
  values: Vec<i64>,
}

#[derive(Deserialize)]
struct SleepArgs {
  millis: u64,
}

#[derive(Deserialize)]
struct FailArgs {
  message: String,
}

fn builtin_jobs() -> JobRegistry {
  let registry = JobRegistry::new();
  registry.register("echo", |value: serde_json::Value| Ok::<_, String>(value));
  registry.register("sum", |args: SumArgs| Ok::<i64, String>(args.values.iter().sum()));
  registry.register("sleep_ms", |args: SleepArgs| {
    std::thread::sleep(Duration::from_millis(args.millis));
    Ok::<u64, String>(args.millis)
  });
  registry.register("fail", |args: FailArgs| Err::<(), String>(args.message));
  registry
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let mut args = std::env::args().skip(1);
  let mut listen: Option<String> = None;
  while let Some(arg) = args.next() {
    match arg.as_str() {
      "--listen" => {
        listen = Some(args.next().unwrap_or_else(|| {
          eprintln!("--listen requires an address");
          std::process::exit(2);
        }));
      }
      other => {
        eprintln!("unknown argument: {}", other);
        std::process::exit(2);
      }
    }
  }

  let registry = builtin_jobs();

  match listen {
    Some(addr) => {
      let listener = TcpListener::bind(&addr).await?;
      // Announce the bound address so callers using port 0 can find us.
      println!("listening {}", listener.local_addr()?);
      serve_tcp(listener, registry).await
    }
    None => serve_stdio(registry).await,
  }
}

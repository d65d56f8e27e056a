//! Worker binary: parse the CLI, start one worker, and run until the master
//! shuts it down.

use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;

use tessella_worker::{start_worker, WorkerConfig};

/// CLI options for running a worker.
#[derive(Parser, Debug)]
#[command(name = "tessella-worker")]
struct Args {
    /// Master address as `host:port`.
    #[arg(long)]
    master: String,

    /// Listen port; -1 picks a free port.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    port: i32,

    /// Hostname advertised to the master.
    #[arg(long, env = "TESSELLA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Entries fetched per iterator batch.
    #[arg(long, env = "TESSELLA_FETCH_COUNT", default_value_t = 512)]
    fetch_count: u32,

    /// Pending-buffer size that triggers an early shard flush.
    #[arg(long, env = "TESSELLA_PENDING_HIGH_WATER", default_value_t = 10_000)]
    pending_high_water: usize,

    /// Seconds to wait for the master's initialize callback.
    #[arg(long, env = "TESSELLA_REGISTER_TIMEOUT_SECS", default_value_t = 20)]
    register_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = WorkerConfig::new(args.master);
    config.host = args.host;
    config.port = (args.port >= 0).then_some(args.port as u16);
    config.fetch_count = args.fetch_count;
    config.pending_high_water = args.pending_high_water;
    config.register_timeout = Duration::from_secs(args.register_timeout_secs.max(1));

    let handle = start_worker(config).await?;
    let code = handle.wait_for_shutdown().await?;
    std::process::exit(code);
}

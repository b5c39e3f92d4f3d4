//! hyprtavernd — the hyprtavern service bus daemon.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hyprtavern_daemon::server::ServerHandler;

/// The hyprtavern service bus daemon.
#[derive(Parser, Debug)]
#[command(name = "hyprtavern")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable more logging.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // All protocol handlers run on this one thread; the only worker pool
    // user is the barmaid's dialog, which lives in a different process
    // entirely.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    rt.block_on(async {
        let server = ServerHandler::new(args.verbose)?;
        server.run().await
    })
}

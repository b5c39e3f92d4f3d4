//! hyprtavern-kv — the tavern's encrypted key-value barmaid.
//!
//! Spawned by the tavern with an inherited socket passed via `--fd`; not
//! intended to be started by hand.

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hyprtavern_kv::dialog::CommandDialog;
use hyprtavern_kv::runtime;

/// The hyprtavern key-value barmaid.
#[derive(Parser, Debug)]
#[command(name = "hyprtavern-kv")]
#[command(version, about, long_about = None)]
struct Args {
    /// Inherited file descriptor for the wire connection to the tavern.
    #[arg(long)]
    fd: i32,

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

    if args.fd <= 2 {
        bail!("--fd must name an inherited socket, got {}", args.fd);
    }

    // SAFETY: by the spawn contract the tavern execs us with exactly this
    // descriptor open and unowned by anything else in this process.
    let fd = unsafe { OwnedFd::from_raw_fd(args.fd) };

    // All protocol handlers run on this one thread; only the store-open
    // worker (and the dialog it drives) lives elsewhere.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    rt.block_on(runtime::run(fd, Arc::new(CommandDialog::from_env())))
}

//! ht-env — update the tavern environment.

use anyhow::{bail, Result};
use clap::Parser;

use hyprtavern_cli::client::{setup_security_object, BusClient};
use hyprtavern_core::proto::{
    CoreErrorCode, CoreEvent, CoreRequest, PERMISSION_MANAGEMENT_ENVIRONMENT,
};

/// Hyprtavern env utility.
#[derive(Parser, Debug)]
#[command(name = "ht-env")]
#[command(version, about, long_about = None)]
struct Args {
    /// Pass values as NAME=VALUE.
    #[arg(long, conflicts_with = "update")]
    set: bool,

    /// Pass values as NAME; values are taken from the executing
    /// environment.
    #[arg(long)]
    update: bool,

    /// Space-separated environment variable list.
    #[arg(long)]
    env: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (names, values) = parse_env(&args)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(names, values))
}

fn parse_env(args: &Args) -> Result<(Vec<String>, Vec<String>)> {
    if !args.set && !args.update {
        bail!("missing mode --set / --update");
    }

    let mut names = Vec::new();
    let mut values = Vec::new();

    for item in args.env.split_whitespace() {
        if args.set {
            let Some((name, value)) = item.split_once('=') else {
                bail!("invalid env: {item}");
            };
            names.push(name.to_owned());
            values.push(value.to_owned());
        } else {
            names.push(item.to_owned());
            values.push(std::env::var(item).unwrap_or_default());
        }
    }

    if names.is_empty() {
        bail!("missing --env");
    }

    Ok((names, values))
}

async fn run(names: Vec<String>, values: Vec<String>) -> Result<()> {
    let mut bus = BusClient::connect().await?;

    let setup = setup_security_object(
        &mut bus,
        ("hyprtavern-env", "Hyprtavern env utility"),
        PERMISSION_MANAGEMENT_ENVIRONMENT,
    )
    .await?;

    if setup.unavailable {
        bail!("permissions unavailable, can't update env");
    }
    if !setup.granted {
        bail!("permission to manage the tavern env denied, can't update env");
    }

    bus.request(CoreRequest::UpdateTavernEnvironment { names, values })
        .await?;

    let mut denied = false;
    bus.roundtrip(|ev| {
        if let CoreEvent::Error {
            code: CoreErrorCode::PermissionDenied,
            ..
        } = ev
        {
            denied = true;
        }
    })
    .await?;

    if denied {
        bail!("tavern refused the environment update");
    }

    Ok(())
}

//! ht-spy — list every object in the tavern.

use anyhow::Result;
use clap::Parser;

use hyprtavern_cli::client::{setup_security_object, BusClient};
use hyprtavern_core::proto::{CoreEvent, CoreRequest, PERMISSION_MONITORING_ALL_BUS_OBJECTS};

/// Hyprtavern spy utility.
#[derive(Parser, Debug)]
#[command(name = "ht-spy")]
#[command(version, about, long_about = None)]
struct Args {}

#[derive(Default)]
struct ObjectInfo {
    name: String,
    protocols: Vec<String>,
    revisions: Vec<u32>,
    properties: Vec<String>,
}

fn main() -> Result<()> {
    let Args {} = Args::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(run())
}

async fn run() -> Result<()> {
    let mut bus = BusClient::connect().await?;

    let setup = setup_security_object(
        &mut bus,
        ("hyprtavern-spy", "Hyprtavern spy utility"),
        PERMISSION_MONITORING_ALL_BUS_OBJECTS,
    )
    .await?;

    if setup.unavailable {
        println!("warning: permissions unavailable, results may be incomplete");
    } else if !setup.granted {
        println!("warning: permission to monitor all objects was denied, results may be incomplete");
    }

    // An empty query matches every object in the tavern.
    let query = bus.alloc();
    bus.request(CoreRequest::GetQuery {
        seq: query,
        protocols: vec![],
        protocol_filter: Default::default(),
        properties: vec![],
        property_filter: Default::default(),
    })
    .await?;

    let mut ids = Vec::new();
    bus.roundtrip(|ev| {
        if let CoreEvent::Results { query: q, ids: found } = ev {
            if *q == query {
                ids.clone_from(found);
            }
        }
    })
    .await?;

    if ids.len() == 1 {
        println!("There is {} object in the tavern:", ids.len());
    } else {
        println!("There are {} objects in the tavern:", ids.len());
    }

    for id in ids {
        let handle = bus.alloc();
        bus.request(CoreRequest::GetObjectHandle {
            seq: handle,
            target: id,
        })
        .await?;

        let mut info = ObjectInfo::default();
        bus.roundtrip(|ev| match ev {
            CoreEvent::Name { handle: h, name } if *h == handle => {
                info.name.clone_from(name);
            }
            CoreEvent::Protocols {
                handle: h,
                names,
                revisions,
            } if *h == handle => {
                info.protocols.clone_from(names);
                info.revisions.clone_from(revisions);
            }
            CoreEvent::Properties {
                handle: h,
                properties,
            } if *h == handle => {
                info.properties.clone_from(properties);
            }
            _ => {}
        })
        .await?;

        println!(" ┣╸{}#{}:", info.name, id);
        println!(" ┃   ┣╸protocols:");
        for (i, (name, rev)) in info.protocols.iter().zip(&info.revisions).enumerate() {
            let elbow = if i + 1 == info.protocols.len() { "┗" } else { "┣" };
            println!(" ┃   ┃   {elbow}╸{name}@{rev}");
        }
        println!(" ┃   ┗╸props:");
        for (i, prop) in info.properties.iter().enumerate() {
            let elbow = if i + 1 == info.properties.len() { "┗" } else { "┣" };
            println!(" ┃       {elbow}╸{prop}");
        }
    }

    Ok(())
}

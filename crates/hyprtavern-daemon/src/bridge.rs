//! The core's own connection to the barmaid's key-value store.
//!
//! The tavernkeep is a bus client like any other: barmaid init runs a
//! query over the internal client, obtains a handle for the kv bus
//! object, connects it, and speaks the kv protocol over the delivered
//! descriptor. An actor task owns both connections afterwards; handlers
//! reach it through cheap [`KvBridge`] command handles.
//!
//! The store may be `UNAVAILABLE` for a long time (no display for the
//! unlock dialog), during which the barmaid parks kv requests. Lookups
//! here carry a timeout so a parked store degrades security-object
//! hydration instead of wedging a client's handler.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use hyprtavern_core::handshake;
use hyprtavern_core::proto::{
    BarmaidRequest, ClientMessage, CoreEvent, CoreRequest, FilterMode, KvEvent, KvRequest,
    ProtocolSpec, ServerMessage, ValueType, BARMAID_PROTOCOL, BARMAID_PROTOCOL_VERSION,
    CORE_PROTOCOL, CORE_PROTOCOL_VERSION, KV_PROTOCOL, KV_PROTOCOL_VERSION,
};
use hyprtavern_core::{WireConnection, WireError};

/// How long the kv object gets to appear on the bus.
const INIT_QUERY_ATTEMPTS: u32 = 50;
/// Pause between init queries.
const INIT_QUERY_INTERVAL: Duration = Duration::from_millis(100);
/// How long a lookup waits on a store that may be parked.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire id of the init query on the tavernkeep connection.
const QUERY_ID: u32 = 1;
/// Wire id of the init handle on the tavernkeep connection.
const HANDLE_ID: u32 = 2;

/// Barmaid init failure; fatal for the daemon.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The internal connection died.
    #[error("wire error during barmaid init: {0}")]
    Wire(#[from] WireError),

    /// The barmaid never published, or refused us.
    #[error("barmaid init failed: {0}")]
    Init(String),
}

#[derive(Debug)]
enum Command {
    GetTavern {
        key: String,
        reply: oneshot::Sender<Option<String>>,
    },
    SetTavern {
        key: String,
        value: String,
    },
    UpdateEnvironment {
        names: Vec<String>,
        values: Vec<String>,
    },
}

/// Handle to the bridge actor.
#[derive(Debug, Clone)]
pub struct KvBridge {
    tx: mpsc::UnboundedSender<Command>,
}

impl KvBridge {
    /// Read a tavern-namespace value. `None` covers missing keys, a
    /// parked store, and a dead bridge alike.
    pub async fn get_tavern(&self, key: &str) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::GetTavern {
                key: key.to_owned(),
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Write a tavern-namespace value, fire and forget.
    pub fn set_tavern(&self, key: &str, value: &str) {
        let _ = self.tx.send(Command::SetTavern {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }

    /// Forward the tavern environment to the barmaid.
    pub fn update_environment(&self, names: Vec<String>, values: Vec<String>) {
        let _ = self.tx.send(Command::UpdateEnvironment { names, values });
    }
}

/// Run barmaid init over the tavernkeep's client connection and hand the
/// resulting connections to the bridge actor.
///
/// `fatal` is pinged if the tavernkeep connection later dies: that is a
/// runtime-fatal condition for the daemon.
///
/// # Errors
///
/// [`BridgeError`] when the barmaid never publishes the kv object, the
/// handle snapshot fails, or the peer channel cannot be opened.
pub async fn init(
    mut bus: WireConnection,
    fatal: mpsc::UnboundedSender<String>,
) -> Result<KvBridge, BridgeError> {
    let ack = handshake::connect(
        &mut bus,
        &[ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION)],
    )
    .await?;
    if ack.supports(CORE_PROTOCOL).is_none() {
        return Err(BridgeError::Init("core protocol refused".into()));
    }

    let target = wait_for_kv_object(&mut bus).await?;
    debug!("kv bus object is id {target}");

    let fd = connect_kv_handle(&mut bus, target).await?;

    let mut kv = WireConnection::from_owned_fd(fd)?;
    let ack = handshake::connect(
        &mut kv,
        &[
            ProtocolSpec::new(KV_PROTOCOL, KV_PROTOCOL_VERSION),
            ProtocolSpec::new(BARMAID_PROTOCOL, BARMAID_PROTOCOL_VERSION),
        ],
    )
    .await?;
    if ack.supports(KV_PROTOCOL).is_none() {
        return Err(BridgeError::Init("kv protocol refused on peer channel".into()));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(actor(bus, kv, rx, fatal));

    Ok(KvBridge { tx })
}

/// Query for the kv protocol until the barmaid's object shows up.
async fn wait_for_kv_object(bus: &mut WireConnection) -> Result<u32, BridgeError> {
    for attempt in 0..INIT_QUERY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(INIT_QUERY_INTERVAL).await;
        }

        bus.send(&ClientMessage::Core(CoreRequest::GetQuery {
            seq: QUERY_ID,
            protocols: vec![KV_PROTOCOL.into()],
            protocol_filter: FilterMode::All,
            properties: vec![],
            property_filter: FilterMode::All,
        }))
        .await?;

        loop {
            match bus.recv::<ServerMessage>().await? {
                ServerMessage::Core(CoreEvent::Results { query: QUERY_ID, ids }) => {
                    if let Some(&id) = ids.first() {
                        bus.send(&ClientMessage::Core(CoreRequest::Destroy {
                            object: QUERY_ID,
                        }))
                        .await?;
                        return Ok(id);
                    }
                    break;
                }
                other => debug!("ignoring event while waiting for kv object: {other:?}"),
            }
        }

        bus.send(&ClientMessage::Core(CoreRequest::Destroy { object: QUERY_ID }))
            .await?;
    }

    Err(BridgeError::Init(
        "kv bus object never appeared on the bus".into(),
    ))
}

/// Handle + connect: returns the delivered descriptor.
async fn connect_kv_handle(
    bus: &mut WireConnection,
    target: u32,
) -> Result<std::os::fd::OwnedFd, BridgeError> {
    bus.send(&ClientMessage::Core(CoreRequest::GetObjectHandle {
        seq: HANDLE_ID,
        target,
    }))
    .await?;

    loop {
        match bus.recv::<ServerMessage>().await? {
            ServerMessage::Core(CoreEvent::Done { handle: HANDLE_ID }) => break,
            ServerMessage::Core(CoreEvent::Failed { handle: HANDLE_ID }) => {
                return Err(BridgeError::Init("kv object vanished before connect".into()));
            }
            other => debug!("ignoring handle snapshot event: {other:?}"),
        }
    }

    bus.send(&ClientMessage::Core(CoreRequest::Connect { handle: HANDLE_ID }))
        .await?;

    loop {
        match bus.recv::<ServerMessage>().await? {
            ServerMessage::Core(CoreEvent::Socket { handle: HANDLE_ID }) => {
                return bus.expect_fd().map_err(Into::into);
            }
            ServerMessage::Core(CoreEvent::SocketFailed { handle: HANDLE_ID }) => {
                return Err(BridgeError::Init("peer channel to barmaid failed".into()));
            }
            other => debug!("ignoring event while connecting kv handle: {other:?}"),
        }
    }
}

/// The bridge actor: owns the tavernkeep bus connection (kept alive, its
/// events drained) and the kv peer connection (commands serviced in
/// order).
async fn actor(
    mut bus: WireConnection,
    mut kv: WireConnection,
    mut rx: mpsc::UnboundedReceiver<Command>,
    fatal: mpsc::UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { return };
                if let Err(e) = handle_command(&mut kv, cmd).await {
                    error!("kv bridge died: {e}");
                    let _ = fatal.send(format!("kv peer channel died: {e}"));
                    return;
                }
            }
            ev = bus.recv::<ServerMessage>() => {
                match ev {
                    Ok(ev) => debug!("tavernkeep event: {ev:?}"),
                    Err(e) => {
                        let _ = fatal.send(format!("tavernkeep connection died: {e}"));
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_command(kv: &mut WireConnection, cmd: Command) -> Result<(), WireError> {
    match cmd {
        Command::GetTavern { key, reply } => {
            kv.send(&ClientMessage::Kv(KvRequest::GetValue {
                key: key.clone(),
                value_type: ValueType::Tavern,
            }))
            .await?;

            let value = match timeout(REPLY_TIMEOUT, await_value(kv, &key)).await {
                Ok(result) => result?,
                Err(_elapsed) => {
                    warn!("kv lookup for {key:?} timed out (store not open yet?)");
                    None
                }
            };

            let _ = reply.send(value);
            Ok(())
        }
        Command::SetTavern { key, value } => {
            kv.send(&ClientMessage::Kv(KvRequest::SetValue {
                key,
                value,
                value_type: ValueType::Tavern,
            }))
            .await
        }
        Command::UpdateEnvironment { names, values } => {
            kv.send(&ClientMessage::Barmaid(BarmaidRequest::UpdateEnvironment {
                names,
                values,
            }))
            .await
        }
    }
}

/// Wait for the value event echoing `key`; stale events for timed-out
/// keys and readiness chatter are dropped on the floor.
async fn await_value(kv: &mut WireConnection, key: &str) -> Result<Option<String>, WireError> {
    loop {
        match kv.recv::<ServerMessage>().await? {
            ServerMessage::Kv(KvEvent::ValueObtained { key: k, value, .. }) if k == key => {
                return Ok(Some(value));
            }
            ServerMessage::Kv(KvEvent::ValueFailed { key: k, .. }) if k == key => {
                return Ok(None);
            }
            ServerMessage::Kv(KvEvent::Error { code, message }) => {
                warn!("kv error {code} from barmaid: {message}");
                return Ok(None);
            }
            other => debug!("ignoring kv event: {other:?}"),
        }
    }
}

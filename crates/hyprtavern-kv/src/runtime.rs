//! The barmaid runtime.
//!
//! One connection back to the tavern (inherited over `--fd`) publishes the
//! barmaid's bus object and receives `new_fd` deliveries; every delivered
//! descriptor becomes an independent client connection served on its own
//! task. The store opens asynchronously on a worker thread; clients that
//! bound the barmaid protocol get a `ready` event once it is open, and
//! key-value requests park until then.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use hyprtavern_core::handshake;
use hyprtavern_core::proto::{
    BarmaidEvent, BarmaidRequest, ClientMessage, CoreEvent, CoreRequest, KvEvent, KvRequest,
    PermissionId, ProtocolSpec, ServerMessage, ValueError, ValueType, BARMAID_PROTOCOL,
    BARMAID_PROTOCOL_VERSION, CORE_PROTOCOL, CORE_PROTOCOL_VERSION, KV_PROTOCOL,
    KV_PROTOCOL_VERSION, PERMISSION_TAVERNKEEP,
};
use hyprtavern_core::{WireConnection, WireError};

use crate::dialog::Dialog;
use crate::ident;
use crate::open::{self, OpenError};
use crate::store::KvStore;

/// Name the barmaid publishes its bus object under.
pub const BUS_OBJECT_NAME: &str = "hyprtavern-kv";

/// Wire id of the barmaid's bus object on the tavern connection.
const BUS_OBJECT_ID: u32 = 1;

/// State shared between the bus task, the open driver, and client tasks.
struct Shared {
    /// `Some` once the open pipeline lands in `OPEN`.
    store: Mutex<Option<KvStore>>,
    /// Flips to `true` exactly once, when the store opens.
    ready: watch::Sender<bool>,
    /// Pinged on every environment update; wakes an `UNAVAILABLE` open
    /// driver for another attempt.
    env_update: Notify,
}

/// Run the barmaid against the tavern connection inherited on `fd`.
///
/// # Errors
///
/// Fails when the tavern connection dies, the kv protocol is already
/// exposed by someone else, or the store location is unusable.
pub async fn run(fd: OwnedFd, dialog: Arc<dyn Dialog>) -> Result<()> {
    let mut bus = WireConnection::from_owned_fd(fd).context("bad --fd socket")?;

    let ack = handshake::connect(
        &mut bus,
        &[ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION)],
    )
    .await
    .context("tavern is not serving beer")?;

    if ack.supports(CORE_PROTOCOL).is_none() {
        bail!("tavern does not speak {CORE_PROTOCOL}");
    }

    publish_bus_object(&mut bus).await?;

    let (ready_tx, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        store: Mutex::new(None),
        ready: ready_tx,
        env_update: Notify::new(),
    });

    // INIT -> OPENING happens here; the driver owns the state machine from
    // then on and the bus task never blocks on it.
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
    let open_driver = tokio::spawn(drive_open(Arc::clone(&shared), dialog, fatal_tx));

    let mut bus_task = std::pin::pin!(serve_bus(bus, Arc::clone(&shared)));
    let mut driver_live = true;

    let result = loop {
        tokio::select! {
            res = &mut bus_task => break res,
            reason = fatal_rx.recv(), if driver_live => {
                match reason {
                    Some(reason) => break Err(anyhow::anyhow!(reason)),
                    // Driver finished without a fatal error: the store is
                    // open, or parked in UNAVAILABLE forever.
                    None => driver_live = false,
                }
            }
        }
    };

    open_driver.abort();
    result
}

/// Create the bus object and expose the kv + barmaid protocols on it,
/// both exclusive. A sync barrier flushes any `expose_protocol_error`.
async fn publish_bus_object(bus: &mut WireConnection) -> Result<()> {
    bus.send(&ClientMessage::Core(CoreRequest::GetBusObject {
        seq: BUS_OBJECT_ID,
        name: BUS_OBJECT_NAME.into(),
    }))
    .await?;

    for (name, revision) in [
        (KV_PROTOCOL, KV_PROTOCOL_VERSION),
        (BARMAID_PROTOCOL, BARMAID_PROTOCOL_VERSION),
    ] {
        bus.send(&ClientMessage::Core(CoreRequest::ExposeProtocol {
            object: BUS_OBJECT_ID,
            name: name.into(),
            revision,
            required_permissions: vec![],
            exclusive: true,
        }))
        .await?;
    }

    bus.send(&ClientMessage::Sync { serial: 1 }).await?;

    loop {
        match bus.recv::<ServerMessage>().await? {
            ServerMessage::SyncDone { serial: 1 } => return Ok(()),
            ServerMessage::Core(CoreEvent::ExposeProtocolError { error, .. }) => {
                bail!("failed to expose kv protocol ({error:?}): is another kv barmaid running?");
            }
            other => debug!("ignoring event during publish: {other:?}"),
        }
    }
}

/// The open driver: OPENING on entry, then OPEN (terminal) or UNAVAILABLE
/// with env-update retries. A fatal open error is reported and takes the
/// barmaid down.
async fn drive_open(
    shared: Arc<Shared>,
    dialog: Arc<dyn Dialog>,
    fatal: mpsc::UnboundedSender<String>,
) {
    loop {
        let d = Arc::clone(&dialog);
        let outcome = tokio::task::spawn_blocking(move || open::open_store(&*d)).await;

        match outcome {
            Ok(Ok(store)) => {
                *shared.store.lock().expect("store lock") = Some(store);
                shared.ready.send_replace(true);
                info!("kv: ready!");
                return;
            }
            Ok(Err(OpenError::Unavailable(reason))) => {
                warn!("kv store unavailable ({reason}); waiting for an environment update");
                shared.env_update.notified().await;
                info!("environment updated, retrying store open");
            }
            Ok(Err(OpenError::Fatal(reason))) => {
                error!("kv store open failed fatally: {reason}");
                let _ = fatal.send(reason);
                return;
            }
            Err(e) => {
                error!("store open worker died: {e}");
                let _ = fatal.send(e.to_string());
                return;
            }
        }
    }
}

/// A client whose permissions are still in flight on the bus.
struct PendingClient {
    fd: Option<OwnedFd>,
    pid: Option<i32>,
    permissions: Vec<PermissionId>,
}

/// Service the tavern connection: accept `new_fd` deliveries, resolve
/// their rendezvous tokens into identities, spawn client tasks.
async fn serve_bus(mut bus: WireConnection, shared: Arc<Shared>) -> Result<()> {
    let mut pending: HashMap<u32, PendingClient> = HashMap::new();
    let mut next_seq: u32 = BUS_OBJECT_ID + 1;

    loop {
        let event = match bus.recv::<ServerMessage>().await {
            Ok(ev) => ev,
            Err(WireError::Closed) => bail!("tavern connection died"),
            Err(e) => return Err(e.into()),
        };

        match event {
            ServerMessage::Core(CoreEvent::NewFd { rendezvous, .. }) => {
                let fd = bus.expect_fd().context("new_fd arrived without a descriptor")?;

                if rendezvous.is_empty() {
                    debug!("incoming client has no associated token");
                    spawn_client(fd, Vec::new(), None, &shared);
                } else {
                    let seq = next_seq;
                    next_seq += 1;
                    pending.insert(
                        seq,
                        PendingClient {
                            fd: Some(fd),
                            pid: None,
                            permissions: Vec::new(),
                        },
                    );
                    bus.send(&ClientMessage::Core(CoreRequest::GetSecurityResponse {
                        seq,
                        rendezvous,
                    }))
                    .await?;
                }
            }
            ServerMessage::Core(CoreEvent::Identity { response, pid, .. }) => {
                if let Some(p) = pending.get_mut(&response) {
                    p.pid = Some(pid);
                }
            }
            ServerMessage::Core(CoreEvent::Permissions {
                response,
                permissions,
            }) => {
                if let Some(p) = pending.get_mut(&response) {
                    debug!("incoming client holds {} perms", permissions.len());
                    p.permissions = permissions;
                }
            }
            ServerMessage::Core(CoreEvent::ResponseDone { response })
            | ServerMessage::Core(CoreEvent::ResponseFailed { response }) => {
                if let Some(mut p) = pending.remove(&response) {
                    if let Some(fd) = p.fd.take() {
                        spawn_client(fd, p.permissions, p.pid, &shared);
                    }
                }
                bus.send(&ClientMessage::Core(CoreRequest::Destroy { object: response }))
                    .await?;
            }
            ServerMessage::Core(CoreEvent::ExposeProtocolError { error, .. }) => {
                bail!("kv protocol exposure revoked: {error:?}");
            }
            other => debug!("unhandled tavern event: {other:?}"),
        }
    }
}

fn spawn_client(
    fd: OwnedFd,
    permissions: Vec<PermissionId>,
    pid: Option<i32>,
    shared: &Arc<Shared>,
) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(e) = serve_client(fd, permissions, pid, shared).await {
            debug!("client connection ended: {e}");
        }
    });
}

/// Serve one delivered client connection until it hangs up.
async fn serve_client(
    fd: OwnedFd,
    permissions: Vec<PermissionId>,
    response_pid: Option<i32>,
    shared: Arc<Shared>,
) -> Result<()> {
    let mut conn = WireConnection::from_owned_fd(fd)?;

    let hello = handshake::accept(
        &mut conn,
        &[
            ProtocolSpec::new(KV_PROTOCOL, KV_PROTOCOL_VERSION),
            ProtocolSpec::new(BARMAID_PROTOCOL, BARMAID_PROTOCOL_VERSION),
        ],
    )
    .await?;

    let wants_barmaid = hello.protocols.iter().any(|p| p.name == BARMAID_PROTOCOL);

    // Identity comes from the bus when the client carried a token; the
    // hello pid is the fallback for anonymous peers.
    let app_binary = ident::app_binary_for_pid(response_pid.or(Some(hello.pid)));
    let has_tavernkeep = permissions.contains(&PERMISSION_TAVERNKEEP);

    debug!(app = %app_binary, tavernkeep = has_tavernkeep, "serving kv client");

    let mut ready = shared.ready.subscribe();
    let mut sent_ready = false;

    if wants_barmaid && *ready.borrow() {
        conn.send(&ServerMessage::Barmaid(BarmaidEvent::Ready)).await?;
        sent_ready = true;
    }

    loop {
        tokio::select! {
            changed = ready.changed(), if wants_barmaid && !sent_ready => {
                if changed.is_ok() && *ready.borrow() {
                    conn.send(&ServerMessage::Barmaid(BarmaidEvent::Ready)).await?;
                    sent_ready = true;
                }
            }
            msg = conn.recv::<ClientMessage>() => {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(WireError::Closed) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };

                match msg {
                    ClientMessage::Sync { serial } => {
                        conn.send(&ServerMessage::SyncDone { serial }).await?;
                    }
                    ClientMessage::Kv(req) => {
                        // Requests park until the store is open; a client
                        // that cares uses the barmaid ready event.
                        while !*ready.borrow() {
                            if ready.changed().await.is_err() {
                                return Ok(());
                            }
                        }
                        // Parking here may have consumed the readiness
                        // flip the select arm was waiting on.
                        if wants_barmaid && !sent_ready {
                            conn.send(&ServerMessage::Barmaid(BarmaidEvent::Ready)).await?;
                            sent_ready = true;
                        }
                        let reply = handle_kv(&req, &shared, &app_binary, has_tavernkeep);
                        if let Some(reply) = reply {
                            conn.send(&ServerMessage::Kv(reply)).await?;
                        }
                    }
                    ClientMessage::Barmaid(BarmaidRequest::UpdateEnvironment { names, values }) => {
                        if has_tavernkeep {
                            apply_environment(&names, &values);
                            shared.env_update.notify_waiters();
                        } else {
                            warn!("ignoring environment update from unprivileged client");
                        }
                    }
                    other => warn!("unexpected message from kv client: {other:?}"),
                }
            }
        }
    }
}

/// Handle one key-value request. `None` means no reply (successful set).
fn handle_kv(
    req: &KvRequest,
    shared: &Shared,
    app_binary: &str,
    has_tavernkeep: bool,
) -> Option<KvEvent> {
    let mut guard = shared.store.lock().expect("store lock");
    let store = guard.as_mut().expect("kv handled before store opened");

    match req {
        KvRequest::SetValue {
            key,
            value,
            value_type,
        } => {
            match value_type {
                ValueType::App => store.set_app(app_binary, key, value),
                ValueType::Unbounded => store.set_global(key, value),
                ValueType::Tavern => {
                    if !has_tavernkeep {
                        return Some(KvEvent::Error {
                            code: -1,
                            message: "Insufficient permissions to call set_value with tavern"
                                .into(),
                        });
                    }
                    store.set_tavern(key, value);
                }
            }
            None
        }
        KvRequest::GetValue { key, value_type } => {
            let value = match value_type {
                ValueType::App => store.get_app(app_binary, key),
                ValueType::Unbounded => store.get_global(key),
                ValueType::Tavern => {
                    if !has_tavernkeep {
                        return Some(KvEvent::Error {
                            code: -1,
                            message: "Insufficient permissions to call get_value with tavern"
                                .into(),
                        });
                    }
                    store.get_tavern(key)
                }
            };

            Some(match value {
                Some(value) => KvEvent::ValueObtained {
                    key: key.clone(),
                    value: value.to_owned(),
                    value_type: *value_type,
                },
                None => KvEvent::ValueFailed {
                    key: key.clone(),
                    value_type: *value_type,
                    error: ValueError::ValueMissing,
                },
            })
        }
    }
}

fn apply_environment(names: &[String], values: &[String]) {
    for (name, value) in names.iter().zip(values) {
        debug!("tavern environment: {name}={value}");
        std::env::set_var(name, value);
    }
}

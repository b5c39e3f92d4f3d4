//! Per-client protocol service.
//!
//! Every connection gets one reader task (this module) and one writer
//! task draining the client's event queue. Events to *other* clients —
//! a `new_fd` to a bus object's owner — go through their queues, so each
//! client observes its events in a single well-defined order.
//!
//! Errors never unwind past the request loop: protocol violations turn
//! into structured error events on the offending wire object and the
//! session continues.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use hyprtavern_core::handshake;
use hyprtavern_core::proto::{
    ClientMessage, CoreErrorCode, CoreEvent, CoreRequest, ExposeError, ProtocolSpec,
    ServerMessage, ALL_PERMISSIONS, CORE_PROTOCOL, CORE_PROTOCOL_VERSION,
    PERMISSION_MANAGEMENT_ENVIRONMENT,
};
use hyprtavern_core::{WireConnection, WireError, WireReader, WireWriter};

use crate::query::{run_query, QuerySpec};
use crate::registry::ProtocolEntry;
use crate::security::{self, PersistentRecord, SecurityObject};
use crate::state::{lock, ClientHandle, ClientId, Outgoing, SharedState};

/// What a client-allocated wire id currently names.
#[derive(Debug)]
enum WireObject {
    Bus { internal_id: u32 },
    Handle { target: u32 },
    Query,
    Security { token: String },
    Response,
}

/// Serve one client connection until it hangs up.
///
/// `initial_token` seeds the manager's associated security token; the
/// tavernkeep's internal client passes its sentinel, everyone else starts
/// empty.
///
/// # Errors
///
/// Only transport errors escape; protocol errors are delivered to the
/// client as events.
pub async fn serve_client(
    mut conn: WireConnection,
    state: SharedState,
    initial_token: Option<String>,
) -> Result<(), WireError> {
    let hello = handshake::accept(
        &mut conn,
        &[ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION)],
    )
    .await?;

    let pid = conn.peer_pid().or(Some(hello.pid));
    let (mut reader, writer) = conn.split();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_events(writer, rx));

    let client_id = lock(&state).add_client(ClientHandle {
        sender: tx,
        pid,
        token: initial_token.unwrap_or_default(),
    });

    debug!(client = client_id, ?pid, "client connected");

    let mut session: HashMap<u32, WireObject> = HashMap::new();

    let result = request_loop(&mut reader, &state, client_id, &mut session).await;

    lock(&state).remove_client(client_id);
    debug!(client = client_id, "client disconnected");

    result
}

/// Drain a client's event queue onto the wire.
async fn write_events(mut writer: WireWriter, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        let sent = match out.fd {
            Some(fd) => writer.send_with_fd(&out.msg, fd.as_fd()).await,
            None => writer.send(&out.msg).await,
        };
        // The descriptor, if any, drops here: once delivered (or the
        // client is gone) the core keeps no copy.
        if let Err(e) = sent {
            debug!("client writer stopping: {e}");
            return;
        }
    }
}

async fn request_loop(
    reader: &mut WireReader,
    state: &SharedState,
    client_id: ClientId,
    session: &mut HashMap<u32, WireObject>,
) -> Result<(), WireError> {
    loop {
        let msg = match reader.recv::<ClientMessage>().await {
            Ok(msg) => msg,
            Err(WireError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };

        match msg {
            ClientMessage::Sync { serial } => {
                lock(state).send_to(client_id, Outgoing::msg(ServerMessage::SyncDone { serial }));
            }
            ClientMessage::Core(req) => {
                handle_request(state, client_id, session, req).await;
            }
            other => {
                warn!(client = client_id, "unexpected message on core socket: {other:?}");
            }
        }
    }
}

fn send(state: &SharedState, client: ClientId, event: CoreEvent) {
    lock(state).send_to(client, Outgoing::msg(ServerMessage::Core(event)));
}

#[allow(clippy::too_many_lines)] // one arm per protocol operation
async fn handle_request(
    state: &SharedState,
    client_id: ClientId,
    session: &mut HashMap<u32, WireObject>,
    req: CoreRequest,
) {
    match req {
        CoreRequest::GetBusObject { seq, name } => {
            let internal_id = lock(state).registry.add(&name, client_id, seq);
            debug!("new bus object {name:?} gets id {internal_id}");
            session.insert(seq, WireObject::Bus { internal_id });
        }

        CoreRequest::ExposeProtocol {
            object,
            name,
            revision,
            required_permissions,
            exclusive,
        } => {
            let Some(WireObject::Bus { internal_id }) = session.get(&object) else {
                return;
            };
            let refused = lock(state)
                .registry
                .expose_protocol(
                    *internal_id,
                    ProtocolEntry {
                        name,
                        revision,
                        required_permissions,
                        exclusive,
                    },
                )
                .is_err();
            if refused {
                send(
                    state,
                    client_id,
                    CoreEvent::ExposeProtocolError {
                        object,
                        error: ExposeError::AlreadyExposed,
                    },
                );
            }
        }

        CoreRequest::ExposeProperty { object, name, value } => {
            let Some(WireObject::Bus { internal_id }) = session.get(&object) else {
                return;
            };
            if let Err(e) = lock(state).registry.expose_property(*internal_id, &name, &value) {
                send(
                    state,
                    client_id,
                    CoreEvent::Error {
                        object,
                        code: CoreErrorCode::InvalidPropertyName,
                        message: e.to_string(),
                    },
                );
            }
        }

        CoreRequest::GetObjectHandle { seq, target } => {
            session.insert(seq, WireObject::Handle { target });

            let st = lock(state);
            let Some(obj) = st.registry.get(target) else {
                st.send_to(
                    client_id,
                    Outgoing::msg(ServerMessage::Core(CoreEvent::Failed { handle: seq })),
                );
                debug!("new object handle for invalid object");
                return;
            };

            debug!("new object handle for object id {target}");

            let (names, revisions): (Vec<_>, Vec<_>) = obj
                .protocols
                .iter()
                .map(|p| (p.name.clone(), p.revision))
                .unzip();
            let properties = obj
                .properties
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect();

            for event in [
                CoreEvent::Name {
                    handle: seq,
                    name: obj.name.clone(),
                },
                CoreEvent::Protocols {
                    handle: seq,
                    names,
                    revisions,
                },
                CoreEvent::Properties {
                    handle: seq,
                    properties,
                },
                CoreEvent::Done { handle: seq },
            ] {
                st.send_to(client_id, Outgoing::msg(ServerMessage::Core(event)));
            }
        }

        CoreRequest::Connect { handle } => {
            let Some(WireObject::Handle { target }) = session.get(&handle) else {
                return;
            };
            connect_handle(state, client_id, handle, *target);
        }

        CoreRequest::GetQuery {
            seq,
            protocols,
            protocol_filter,
            properties,
            property_filter,
        } => {
            session.insert(seq, WireObject::Query);

            let spec = QuerySpec {
                protocols,
                protocol_filter,
                properties,
                property_filter,
            };

            let st = lock(state);
            match run_query(&spec, st.registry.iter()) {
                Ok(ids) => {
                    debug!("query got {} matches", ids.len());
                    st.send_to(
                        client_id,
                        Outgoing::msg(ServerMessage::Core(CoreEvent::Results { query: seq, ids })),
                    );
                }
                Err(e) => {
                    st.send_to(
                        client_id,
                        Outgoing::msg(ServerMessage::Core(CoreEvent::Error {
                            object: seq,
                            code: CoreErrorCode::InvalidPropertyName,
                            message: e.to_string(),
                        })),
                    );
                }
            }
        }

        CoreRequest::GetSecurityObject { seq, token } => {
            create_security_object(state, client_id, session, seq, token).await;
        }

        CoreRequest::SetIdentity {
            object,
            name,
            description,
        } => {
            let mut st = lock(state);
            if let Some(obj) = st.security.find_wire_mut(client_id, object) {
                obj.name = name;
                obj.description = description;
            }
        }

        CoreRequest::ObtainPermission {
            object,
            permission,
            mode,
        } => {
            let mut st = lock(state);
            let Some(obj) = st.security.find_wire_mut(client_id, object) else {
                return;
            };

            let (result, persisted) = obj.obtain(permission, mode);
            let record = persisted.then(|| (obj.token.clone(), obj.persistent_record()));

            st.send_to(
                client_id,
                Outgoing::msg(ServerMessage::Core(CoreEvent::PermissionResult {
                    security: object,
                    permission,
                    result,
                })),
            );

            if let Some((token, record)) = record {
                if let Some(bridge) = &st.bridge {
                    let json = serde_json::to_string(&record).unwrap_or_default();
                    bridge.set_tavern(&security::token_key(&token), &json);
                } else {
                    warn!("permanent grant before kv bridge is up; not persisted");
                }
            }
        }

        CoreRequest::GetSecurityResponse { seq, rendezvous } => {
            session.insert(seq, WireObject::Response);
            redeem_rendezvous(state, client_id, seq, &rendezvous);
        }

        CoreRequest::UpdateTavernEnvironment { names, values } => {
            update_environment(state, client_id, names, values);
        }

        CoreRequest::Destroy { object } => {
            let Some(wire_obj) = session.remove(&object) else {
                return;
            };
            match wire_obj {
                WireObject::Bus { internal_id } => lock(state).registry.remove(internal_id),
                WireObject::Security { .. } => {
                    lock(state).security.remove_wire(client_id, object);
                }
                WireObject::Handle { .. } | WireObject::Query | WireObject::Response => {}
            }
        }
    }
}

/// Open a fresh peer channel between the handle's holder and the target
/// object's owner.
fn connect_handle(state: &SharedState, client_id: ClientId, handle: u32, target: u32) {
    let mut st = lock(state);

    let Some((owner, owner_wire_id)) = st
        .registry
        .get(target)
        .map(|o| (o.owner, o.owner_wire_id))
    else {
        st.send_to(
            client_id,
            Outgoing::msg(ServerMessage::Core(CoreEvent::SocketFailed { handle })),
        );
        return;
    };

    let Ok((requester_end, owner_end)) = UnixStream::pair() else {
        warn!("failed to create a socketpair");
        st.send_to(
            client_id,
            Outgoing::msg(ServerMessage::Core(CoreEvent::SocketFailed { handle })),
        );
        return;
    };

    // The requester's token travels with the connection as a one-time
    // rendezvous entry; no token, no entry.
    let token = st.client(client_id).map(|c| c.token.clone()).unwrap_or_default();
    let rendezvous = if token.is_empty() {
        String::new()
    } else {
        st.security.mint_rendezvous(&token)
    };

    st.send_to(
        client_id,
        Outgoing::with_fd(
            ServerMessage::Core(CoreEvent::Socket { handle }),
            OwnedFd::from(requester_end),
        ),
    );
    st.send_to(
        owner,
        Outgoing::with_fd(
            ServerMessage::Core(CoreEvent::NewFd {
                object: owner_wire_id,
                rendezvous,
            }),
            OwnedFd::from(owner_end),
        ),
    );
}

/// Create (or rebind) a security object for `client_id`.
async fn create_security_object(
    state: &SharedState,
    client_id: ClientId,
    session: &mut HashMap<u32, WireObject>,
    seq: u32,
    token: String,
) {
    let pid = lock(state)
        .client(client_id)
        .and_then(|c| c.pid)
        .unwrap_or(-1);

    let (final_token, persistent, announce) = if token.is_empty() {
        (security::mint_token(), Vec::new(), true)
    } else {
        // Hydrate from the tavern namespace. The bridge may not be up or
        // the store may be parked; both degrade to "not found".
        let bridge = lock(state).bridge.clone();
        let stored = match &bridge {
            Some(bridge) => bridge.get_tavern(&security::token_key(&token)).await,
            None => None,
        };

        match stored {
            Some(json) => match serde_json::from_str::<PersistentRecord>(&json) {
                Ok(record) => (token, record.persistent_perms, false),
                Err(_) => {
                    // Corrupted record: keep the token, rewrite an empty
                    // default.
                    warn!("corrupt permission record for token, rewriting");
                    if let Some(bridge) = &bridge {
                        let empty = serde_json::to_string(&PersistentRecord::default())
                            .unwrap_or_default();
                        bridge.set_tavern(&security::token_key(&token), &empty);
                    }
                    (token, Vec::new(), false)
                }
            },
            None => (security::mint_token(), Vec::new(), true),
        }
    };

    let mut st = lock(state);

    let mut obj = SecurityObject::new(final_token.clone(), pid, client_id, seq);
    obj.persistent_perms = persistent.into_iter().collect();
    st.security.insert(obj);

    if let Some(client) = st.client_mut(client_id) {
        client.token.clone_from(&final_token);
    }

    if announce {
        st.send_to(
            client_id,
            Outgoing::msg(ServerMessage::Core(CoreEvent::Token {
                security: seq,
                token: final_token.clone(),
            })),
        );
    }

    session.insert(seq, WireObject::Security { token: final_token });
}

/// Redeem a one-time rendezvous token into identity + permissions.
fn redeem_rendezvous(state: &SharedState, client_id: ClientId, seq: u32, rendezvous: &str) {
    let mut st = lock(state);
    let token = st.security.redeem(rendezvous);

    let events: Vec<CoreEvent> = match token.as_deref() {
        None => vec![CoreEvent::ResponseFailed { response: seq }],
        Some(t) if t == st.tavernkeep_token => vec![
            CoreEvent::Identity {
                response: seq,
                #[allow(clippy::cast_possible_wrap)]
                pid: std::process::id() as i32,
                name: "tavernkeep".into(),
                description: "the tavern itself".into(),
            },
            CoreEvent::Permissions {
                response: seq,
                permissions: ALL_PERMISSIONS.to_vec(),
            },
            CoreEvent::ResponseDone { response: seq },
        ],
        Some(t) => match st.security.find(t) {
            Some(obj) if st.client(obj.owner).is_some() => vec![
                CoreEvent::Identity {
                    response: seq,
                    pid: obj.pid,
                    name: obj.name.clone(),
                    description: obj.description.clone(),
                },
                CoreEvent::Permissions {
                    response: seq,
                    permissions: obj.all_permissions(),
                },
                CoreEvent::ResponseDone { response: seq },
            ],
            // The security object (or its manager) is gone.
            _ => vec![CoreEvent::ResponseFailed { response: seq }],
        },
    };

    if token.is_some() {
        debug!("rendezvous redeemed");
    }

    for event in events {
        st.send_to(client_id, Outgoing::msg(ServerMessage::Core(event)));
    }
}

/// Apply and forward a tavern environment update.
fn update_environment(
    state: &SharedState,
    client_id: ClientId,
    names: Vec<String>,
    values: Vec<String>,
) {
    let mut st = lock(state);

    let token = st.client(client_id).map(|c| c.token.clone()).unwrap_or_default();
    let allowed = token == st.tavernkeep_token
        || st
            .security
            .find(&token)
            .is_some_and(|o| o.holds(PERMISSION_MANAGEMENT_ENVIRONMENT));

    if !allowed {
        st.send_to(
            client_id,
            Outgoing::msg(ServerMessage::Core(CoreEvent::Error {
                object: 0,
                code: CoreErrorCode::PermissionDenied,
                message: "Insufficient permissions to update the tavern environment".into(),
            })),
        );
        return;
    }

    st.update_env(&names, &values);

    if let Some(bridge) = &st.bridge {
        bridge.update_environment(names, values);
    }
}

//! Thin client wrappers over the wire.
//!
//! [`BusClient`] talks the core protocol to the tavern; [`KvClient`]
//! talks the kv protocol to the barmaid over a descriptor delivered
//! through a handle connect. Both are strictly sequential: request, then
//! round-trip, collecting events on the way.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use hyprtavern_core::handshake;
use hyprtavern_core::proto::{
    ClientMessage, CoreEvent, CoreRequest, FilterMode, GrantResult, KvEvent, KvRequest,
    PermissionId, PermissionMode, ProtocolSpec, ServerMessage, ValueType, CORE_PROTOCOL,
    CORE_PROTOCOL_VERSION, KV_PROTOCOL, KV_PROTOCOL_VERSION,
};
use hyprtavern_core::WireConnection;

/// The app-namespace key the tools persist their security token under.
pub const KV_TOKEN_NAME: &str = "core:security_token";

/// Path of the tavern's listening socket.
///
/// # Errors
///
/// Fails when `XDG_RUNTIME_DIR` is unset.
pub fn socket_path() -> Result<PathBuf> {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR").context("no runtime dir")?;
    Ok(PathBuf::from(runtime).join("hyprtavern").join("ht.sock"))
}

/// A connected core-protocol client.
pub struct BusClient {
    conn: WireConnection,
    next_seq: u32,
    next_serial: u32,
}

impl BusClient {
    /// Connect to the tavern and complete the handshake.
    ///
    /// # Errors
    ///
    /// Fails when the tavern is not serving or refuses the core protocol.
    pub async fn connect() -> Result<Self> {
        let stream =
            UnixStream::connect(socket_path()?).context("tavern is not serving beer")?;
        let mut conn = WireConnection::from_std(stream)?;

        let ack = handshake::connect(
            &mut conn,
            &[ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION)],
        )
        .await
        .context("handshake failed")?;

        if ack.supports(CORE_PROTOCOL).is_none() {
            bail!("protocol unsupported");
        }

        Ok(Self {
            conn,
            next_seq: 1,
            next_serial: 1,
        })
    }

    /// Allocate a wire object id.
    pub fn alloc(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Send one core request.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn request(&mut self, req: CoreRequest) -> Result<()> {
        self.conn.send(&ClientMessage::Core(req)).await?;
        Ok(())
    }

    /// Flush: process every event the server emits up to the sync
    /// barrier, feeding them to `on_event`.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn roundtrip(&mut self, mut on_event: impl FnMut(&CoreEvent)) -> Result<()> {
        let serial = self.next_serial;
        self.next_serial += 1;

        self.conn.send(&ClientMessage::Sync { serial }).await?;

        loop {
            match self.conn.recv::<ServerMessage>().await? {
                ServerMessage::SyncDone { serial: done } if done == serial => return Ok(()),
                ServerMessage::Core(ev) => on_event(&ev),
                _ => {}
            }
        }
    }

    /// Pop a descriptor delivered with a previous event.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.conn.take_fd()
    }

    /// Run a query for objects exposing `protocol`, returning matching
    /// internal ids.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn query_protocol(&mut self, protocol: &str) -> Result<Vec<u32>> {
        let seq = self.alloc();
        self.request(CoreRequest::GetQuery {
            seq,
            protocols: vec![protocol.to_owned()],
            protocol_filter: FilterMode::All,
            properties: vec![],
            property_filter: FilterMode::All,
        })
        .await?;

        let mut found = Vec::new();
        self.roundtrip(|ev| {
            if let CoreEvent::Results { query, ids } = ev {
                if *query == seq {
                    found.clone_from(ids);
                }
            }
        })
        .await?;
        Ok(found)
    }

    /// Connect a handle to `target`, returning the delivered descriptor.
    ///
    /// # Errors
    ///
    /// Transport errors; `Ok(None)` when the connect failed.
    pub async fn connect_object(&mut self, target: u32) -> Result<Option<OwnedFd>> {
        let handle = self.alloc();
        self.request(CoreRequest::GetObjectHandle { seq: handle, target })
            .await?;
        self.request(CoreRequest::Connect { handle }).await?;

        let mut ok = false;
        self.roundtrip(|ev| {
            if let CoreEvent::Socket { handle: h } = ev {
                ok |= *h == handle;
            }
        })
        .await?;

        if !ok {
            return Ok(None);
        }
        Ok(self.take_fd())
    }

    /// Outcome of a security-object bootstrap.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn create_security_object(
        &mut self,
        token: &str,
        identity: (&str, &str),
        permission: PermissionId,
    ) -> Result<SecuritySetup> {
        let seq = self.alloc();
        self.request(CoreRequest::GetSecurityObject {
            seq,
            token: token.to_owned(),
        })
        .await?;
        self.request(CoreRequest::SetIdentity {
            object: seq,
            name: identity.0.to_owned(),
            description: identity.1.to_owned(),
        })
        .await?;
        self.request(CoreRequest::ObtainPermission {
            object: seq,
            permission,
            mode: PermissionMode::Permanent,
        })
        .await?;

        let mut setup = SecuritySetup {
            granted: false,
            unavailable: false,
            fresh_token: None,
        };
        self.roundtrip(|ev| match ev {
            CoreEvent::Token { security, token } if *security == seq => {
                setup.fresh_token = Some(token.clone());
            }
            CoreEvent::PermissionResult {
                security, result, ..
            } if *security == seq => {
                setup.granted = matches!(
                    result,
                    GrantResult::Granted
                        | GrantResult::GrantedByPolicy
                        | GrantResult::AlreadyGranted
                );
            }
            CoreEvent::Unavailable { security } if *security == seq => {
                setup.unavailable = true;
            }
            _ => {}
        })
        .await?;

        Ok(setup)
    }
}

/// What came back from a security-object bootstrap.
#[derive(Debug, Clone)]
pub struct SecuritySetup {
    /// The requested permission is held.
    pub granted: bool,
    /// The permission authority is unreachable.
    pub unavailable: bool,
    /// A freshly minted token, when the tavern did not accept an existing
    /// one.
    pub fresh_token: Option<String>,
}

/// A connected kv-protocol client over a delivered descriptor.
pub struct KvClient {
    conn: WireConnection,
}

impl KvClient {
    /// Handshake the kv protocol over `fd`.
    ///
    /// # Errors
    ///
    /// Fails when the peer refuses the kv protocol.
    pub async fn from_fd(fd: OwnedFd) -> Result<Self> {
        let mut conn = WireConnection::from_owned_fd(fd)?;
        let ack = handshake::connect(
            &mut conn,
            &[ProtocolSpec::new(KV_PROTOCOL, KV_PROTOCOL_VERSION)],
        )
        .await?;
        if ack.supports(KV_PROTOCOL).is_none() {
            bail!("kv protocol unsupported on peer channel");
        }
        Ok(Self { conn })
    }

    /// Fetch an app-namespace value.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn get_app_value(&mut self, key: &str) -> Result<Option<String>> {
        self.conn
            .send(&ClientMessage::Kv(KvRequest::GetValue {
                key: key.to_owned(),
                value_type: ValueType::App,
            }))
            .await?;

        loop {
            match self.conn.recv::<ServerMessage>().await? {
                ServerMessage::Kv(KvEvent::ValueObtained { key: k, value, .. }) if k == key => {
                    return Ok(Some(value));
                }
                ServerMessage::Kv(KvEvent::ValueFailed { key: k, .. }) if k == key => {
                    return Ok(None);
                }
                ServerMessage::Kv(KvEvent::Error { code, message }) => {
                    bail!("kv error {code}: {message}");
                }
                _ => {}
            }
        }
    }

    /// Store an app-namespace value.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn set_app_value(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn
            .send(&ClientMessage::Kv(KvRequest::SetValue {
                key: key.to_owned(),
                value: value.to_owned(),
                value_type: ValueType::App,
            }))
            .await?;
        Ok(())
    }
}

/// Reuse a token persisted in the kv app namespace, minting and storing a
/// fresh one otherwise. Returns the bootstrap outcome.
///
/// # Errors
///
/// Transport errors only; a missing barmaid degrades to a fresh
/// tokenless bootstrap.
pub async fn setup_security_object(
    bus: &mut BusClient,
    identity: (&str, &str),
    permission: PermissionId,
) -> Result<SecuritySetup> {
    let mut kv = match bus.query_protocol(KV_PROTOCOL).await?.first() {
        Some(&id) => match bus.connect_object(id).await? {
            Some(fd) => Some(KvClient::from_fd(fd).await?),
            None => None,
        },
        None => None,
    };

    let stored = match kv.as_mut() {
        Some(kv) => kv.get_app_value(KV_TOKEN_NAME).await.unwrap_or(None),
        None => None,
    };

    let setup = bus
        .create_security_object(stored.as_deref().unwrap_or(""), identity, permission)
        .await?;

    // A fresh token is worth remembering for the next invocation.
    if let (Some(token), Some(kv)) = (&setup.fresh_token, kv.as_mut()) {
        kv.set_app_value(KV_TOKEN_NAME, token).await?;
    }

    Ok(setup)
}

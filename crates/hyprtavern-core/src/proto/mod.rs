//! Typed messages for the three tavern protocols.
//!
//! The wire delivers already-demuxed, typed events: every frame is the JSON
//! encoding of one [`ClientMessage`] or [`ServerMessage`] envelope. Frames
//! that carry a descriptor ([`core::CoreEvent::Socket`],
//! [`core::CoreEvent::NewFd`]) attach it as `SCM_RIGHTS` data on the same
//! `sendmsg`.

use serde::{Deserialize, Serialize};

use crate::handshake::{Hello, HelloAck};

pub mod core;
pub mod kv;

pub use self::core::{CoreErrorCode, CoreEvent, CoreRequest, ExposeError};
pub use self::kv::{BarmaidEvent, BarmaidRequest, KvEvent, KvRequest, ValueError};

/// Name of the core bus protocol.
pub const CORE_PROTOCOL: &str = "hp_hyprtavern_core_v1";
/// Name of the key-value store protocol served by the barmaid.
pub const KV_PROTOCOL: &str = "hp_hyprtavern_kv_store_v1";
/// Name of the barmaid lifecycle protocol.
pub const BARMAID_PROTOCOL: &str = "hp_hyprtavern_barmaid_v1";

/// Revision of the core bus protocol.
pub const CORE_PROTOCOL_VERSION: u32 = 1;
/// Revision of the key-value store protocol.
pub const KV_PROTOCOL_VERSION: u32 = 1;
/// Revision of the barmaid lifecycle protocol.
pub const BARMAID_PROTOCOL_VERSION: u32 = 1;

/// A permission tag. Permission sets travel as plain `u32`s.
pub type PermissionId = u32;

/// Holder may read and write the TAVERN key-value namespace, and is the
/// tavern's own trusted identity.
pub const PERMISSION_TAVERNKEEP: PermissionId = 0;
/// Holder may enumerate and inspect every bus object.
pub const PERMISSION_MONITORING_ALL_BUS_OBJECTS: PermissionId = 1;
/// Holder may update the tavern environment.
pub const PERMISSION_MANAGEMENT_ENVIRONMENT: PermissionId = 2;

/// Every permission the core knows about, in tag order.
pub const ALL_PERMISSIONS: [PermissionId; 3] = [
    PERMISSION_TAVERNKEEP,
    PERMISSION_MONITORING_ALL_BUS_OBJECTS,
    PERMISSION_MANAGEMENT_ENVIRONMENT,
];

/// Filter combinator for query matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Every listed element must match.
    #[default]
    All,
    /// At least one listed element must match.
    Any,
}

/// Namespace selector for key-value operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Scoped to the calling process's binary.
    App,
    /// Global, readable and writable by anyone.
    Unbounded,
    /// Restricted to holders of [`PERMISSION_TAVERNKEEP`].
    Tavern,
}

/// Lifetime of a permission grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Grant dies with the security object.
    Session,
    /// Grant is written through to the tavern key-value store.
    Permanent,
}

/// Outcome of an `obtain_permission` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantResult {
    /// Granted after asking the permission authority.
    Granted,
    /// Granted without consulting the user, per policy.
    GrantedByPolicy,
    /// The permission was already held.
    AlreadyGranted,
    /// The permission authority refused.
    Denied,
}

/// One protocol a peer speaks, by name and revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// Protocol name, e.g. [`CORE_PROTOCOL`].
    pub name: String,
    /// Protocol revision.
    pub version: u32,
}

impl ProtocolSpec {
    /// Convenience constructor.
    #[must_use]
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_owned(),
            version,
        }
    }
}

/// Everything a client can say to a tavern-side server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake opener; must be the first message on a connection.
    Hello(Hello),
    /// Barrier request: the server answers with `SyncDone` carrying the
    /// same serial once everything before it has been processed.
    Sync {
        /// Caller-chosen cookie echoed back in `SyncDone`.
        serial: u32,
    },
    /// A core bus protocol request.
    Core(CoreRequest),
    /// A key-value store request.
    Kv(KvRequest),
    /// A barmaid lifecycle request.
    Barmaid(BarmaidRequest),
}

/// Everything a tavern-side server can say to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake answer.
    HelloAck(HelloAck),
    /// Barrier response for a previous `Sync`.
    SyncDone {
        /// Cookie from the matching `Sync`.
        serial: u32,
    },
    /// A core bus protocol event.
    Core(CoreEvent),
    /// A key-value store event.
    Kv(KvEvent),
    /// A barmaid lifecycle event.
    Barmaid(BarmaidEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips() {
        let msg = ClientMessage::Core(CoreRequest::GetBusObject {
            seq: 7,
            name: "hyprtavern-kv".into(),
        });
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: ClientMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn filter_mode_wire_names() {
        assert_eq!(serde_json::to_string(&FilterMode::All).unwrap(), "\"all\"");
        assert_eq!(serde_json::to_string(&FilterMode::Any).unwrap(), "\"any\"");
    }

    #[test]
    fn value_type_wire_names() {
        for (ty, name) in [
            (ValueType::App, "\"app\""),
            (ValueType::Unbounded, "\"unbounded\""),
            (ValueType::Tavern, "\"tavern\""),
        ] {
            assert_eq!(serde_json::to_string(&ty).unwrap(), name);
        }
    }
}

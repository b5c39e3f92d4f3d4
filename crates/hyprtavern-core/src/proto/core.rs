//! `hp_hyprtavern_core_v1` requests and events.
//!
//! Object model: the client allocates a sequence id (`seq`) for every wire
//! object it creates (bus objects, handles, queries, security objects,
//! security responses); later requests and events reference that id. Bus
//! object *internal* ids are a separate, server-assigned namespace — they
//! are what queries return and what `get_object_handle` targets.

use serde::{Deserialize, Serialize};

use super::{FilterMode, PermissionId, PermissionMode, GrantResult};

/// Error codes delivered on core protocol objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorCode {
    /// A property name or query property failed validation.
    InvalidPropertyName,
    /// The caller lacks the permission the operation requires.
    PermissionDenied,
}

/// Errors reported when exposing a protocol on a bus object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposeError {
    /// Another live object already exposes this protocol exclusively.
    AlreadyExposed,
}

/// Client → core requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CoreRequest {
    /// Create a bus object owned by this client.
    GetBusObject {
        /// Wire object id for the new bus object.
        seq: u32,
        /// Published name.
        name: String,
    },
    /// Expose a protocol on an owned bus object.
    ExposeProtocol {
        /// Wire object id of the bus object.
        object: u32,
        /// Protocol name.
        name: String,
        /// Protocol revision.
        revision: u32,
        /// Permissions a connecting peer must hold.
        required_permissions: Vec<PermissionId>,
        /// Refuse if any other live object exposes this protocol.
        exclusive: bool,
    },
    /// Set (or, with an empty value, delete) a property on an owned bus
    /// object.
    ExposeProperty {
        /// Wire object id of the bus object.
        object: u32,
        /// Property name, `head:tail` form.
        name: String,
        /// Property value; empty deletes.
        value: String,
    },
    /// Create a handle onto a bus object by internal id.
    GetObjectHandle {
        /// Wire object id for the new handle.
        seq: u32,
        /// Internal id of the target bus object.
        target: u32,
    },
    /// Open a fresh peer channel through a handle.
    Connect {
        /// Wire object id of the handle.
        handle: u32,
    },
    /// Run a registry query.
    GetQuery {
        /// Wire object id for the new query.
        seq: u32,
        /// Protocol names to match.
        protocols: Vec<String>,
        /// Combinator for `protocols`.
        protocol_filter: FilterMode,
        /// `name=value` property filters.
        properties: Vec<String>,
        /// Combinator for `properties`.
        property_filter: FilterMode,
    },
    /// Create (or rebind) this client's security object.
    GetSecurityObject {
        /// Wire object id for the new security object.
        seq: u32,
        /// Existing token to rebind, or empty to mint a fresh one.
        token: String,
    },
    /// Update the labels on a security object.
    SetIdentity {
        /// Wire object id of the security object.
        object: u32,
        /// Display name.
        name: String,
        /// Human-readable description.
        description: String,
    },
    /// Request a permission grant.
    ObtainPermission {
        /// Wire object id of the security object.
        object: u32,
        /// Permission tag.
        permission: PermissionId,
        /// Session or permanent.
        mode: PermissionMode,
    },
    /// Redeem a one-time rendezvous token.
    GetSecurityResponse {
        /// Wire object id for the new security response.
        seq: u32,
        /// The rendezvous token delivered alongside a `new_fd`.
        rendezvous: String,
    },
    /// Replace tavern environment variables.
    UpdateTavernEnvironment {
        /// Variable names.
        names: Vec<String>,
        /// Variable values, parallel to `names`.
        values: Vec<String>,
    },
    /// Destroy a wire object created earlier with one of the `seq` ops.
    Destroy {
        /// Wire object id to destroy.
        object: u32,
    },
}

/// Core → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum CoreEvent {
    /// Structured error on a wire object; the session continues.
    Error {
        /// Wire object the error is about.
        object: u32,
        /// Error class.
        code: CoreErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// A protocol exposure was refused.
    ExposeProtocolError {
        /// Bus object wire id the exposure was attempted on.
        object: u32,
        /// Why it was refused.
        error: ExposeError,
    },
    /// The one and only result emission of a query.
    Results {
        /// Query wire id.
        query: u32,
        /// Matching internal ids, in registry insertion order.
        ids: Vec<u32>,
    },
    /// Handle snapshot: target's published name.
    Name {
        /// Handle wire id.
        handle: u32,
        /// Target object's name.
        name: String,
    },
    /// Handle snapshot: exposed protocols.
    Protocols {
        /// Handle wire id.
        handle: u32,
        /// Protocol names.
        names: Vec<String>,
        /// Protocol revisions, parallel to `names`.
        revisions: Vec<u32>,
    },
    /// Handle snapshot: properties as `name=value` strings.
    Properties {
        /// Handle wire id.
        handle: u32,
        /// Property strings.
        properties: Vec<String>,
    },
    /// Handle snapshot complete.
    Done {
        /// Handle wire id.
        handle: u32,
    },
    /// Handle creation failed (target already gone).
    Failed {
        /// Handle wire id.
        handle: u32,
    },
    /// One half of a fresh socket pair; the descriptor rides along.
    Socket {
        /// Handle wire id.
        handle: u32,
    },
    /// Peer channel could not be opened.
    SocketFailed {
        /// Handle wire id.
        handle: u32,
    },
    /// Delivered to a bus object's owner: the other half of a fresh socket
    /// pair (descriptor attached) plus a one-time rendezvous token, empty
    /// when the requester carried no security token.
    NewFd {
        /// Bus object wire id on the owner's connection.
        object: u32,
        /// One-time rendezvous token, possibly empty.
        rendezvous: String,
    },
    /// A freshly minted security token.
    Token {
        /// Security object wire id.
        security: u32,
        /// The token, a UUID string.
        token: String,
    },
    /// Result of an `obtain_permission` request.
    PermissionResult {
        /// Security object wire id.
        security: u32,
        /// Permission tag the result is about.
        permission: PermissionId,
        /// Grant outcome.
        result: GrantResult,
    },
    /// The permission authority is unreachable.
    Unavailable {
        /// Security object wire id.
        security: u32,
    },
    /// Security response: identity of the redeemed requester.
    Identity {
        /// Security response wire id.
        response: u32,
        /// Requester pid.
        pid: i32,
        /// Requester display name.
        name: String,
        /// Requester description.
        description: String,
    },
    /// Security response: the requester's permission set.
    Permissions {
        /// Security response wire id.
        response: u32,
        /// Held permission tags.
        permissions: Vec<PermissionId>,
    },
    /// Security response complete.
    ResponseDone {
        /// Security response wire id.
        response: u32,
    },
    /// Rendezvous token unknown, already redeemed, or its security object
    /// is gone.
    ResponseFailed {
        /// Security response wire id.
        response: u32,
    },
}

impl CoreEvent {
    /// Whether this event must arrive with an attached descriptor.
    #[must_use]
    pub const fn carries_fd(&self) -> bool {
        matches!(self, Self::Socket { .. } | Self::NewFd { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tags_are_stable() {
        let req = CoreRequest::ExposeProperty {
            object: 3,
            name: "kv:backend".into(),
            value: "encrypted".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "expose_property");
        assert_eq!(json["name"], "kv:backend");
    }

    #[test]
    fn fd_carrying_events() {
        assert!(CoreEvent::Socket { handle: 1 }.carries_fd());
        assert!(CoreEvent::NewFd {
            object: 1,
            rendezvous: String::new()
        }
        .carries_fd());
        assert!(!CoreEvent::Done { handle: 1 }.carries_fd());
    }
}

//! Protocol negotiation.
//!
//! The first frame on any tavern connection is the client's [`Hello`]
//! listing the protocols it wants to speak; the server answers with a
//! [`HelloAck`] listing the subset it serves. Anything else as an opener is
//! a handshake failure and the connection is dropped.

use serde::{Deserialize, Serialize};

use crate::connection::WireConnection;
use crate::error::{WireError, WireResult};
use crate::proto::{ClientMessage, ProtocolSpec, ServerMessage};

/// Handshake opener sent by the connecting peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// The client's pid. Informational: on a direct socket connection the
    /// server trusts `SO_PEERCRED` instead; on a relayed socket pair (where
    /// peer credentials name the relay) this is the only pid available and
    /// authoritative identity still comes from the bus, not the channel.
    pub pid: i32,
    /// Protocols the client wants to speak.
    pub protocols: Vec<ProtocolSpec>,
}

/// Handshake answer sent by the serving peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Protocols the server actually serves, a subset of the request.
    pub protocols: Vec<ProtocolSpec>,
}

impl HelloAck {
    /// Revision the server offers for `name`, if any.
    #[must_use]
    pub fn supports(&self, name: &str) -> Option<u32> {
        self.protocols
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.version)
    }
}

/// Client side: send [`Hello`], wait for the [`HelloAck`].
///
/// # Errors
///
/// Fails if the connection dies or the server answers with anything other
/// than a `HelloAck`.
pub async fn connect(
    conn: &mut WireConnection,
    wanted: &[ProtocolSpec],
) -> WireResult<HelloAck> {
    conn.send(&ClientMessage::Hello(Hello {
        #[allow(clippy::cast_possible_wrap)]
        pid: std::process::id() as i32,
        protocols: wanted.to_vec(),
    }))
    .await?;

    match conn.recv::<ServerMessage>().await? {
        ServerMessage::HelloAck(ack) => Ok(ack),
        other => Err(WireError::Handshake(format!(
            "expected hello_ack, got {other:?}"
        ))),
    }
}

/// Server side: wait for the [`Hello`], answer with the served subset.
///
/// Returns the client's request so the server knows which protocols the
/// peer bound (e.g. whether it wants barmaid readiness events).
///
/// # Errors
///
/// Fails if the connection dies or the client opens with anything other
/// than a `Hello`.
pub async fn accept(
    conn: &mut WireConnection,
    supported: &[ProtocolSpec],
) -> WireResult<Hello> {
    let hello = match conn.recv::<ClientMessage>().await? {
        ClientMessage::Hello(hello) => hello,
        other => {
            return Err(WireError::Handshake(format!(
                "expected hello, got {other:?}"
            )))
        }
    };

    let served: Vec<ProtocolSpec> = hello
        .protocols
        .iter()
        .filter(|p| supported.iter().any(|s| s.name == p.name))
        .cloned()
        .collect();

    conn.send(&ServerMessage::HelloAck(HelloAck { protocols: served }))
        .await?;

    Ok(hello)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{CORE_PROTOCOL, CORE_PROTOCOL_VERSION, KV_PROTOCOL};

    #[tokio::test]
    async fn negotiates_served_subset() {
        let (mut client, mut server) = WireConnection::pair().unwrap();

        let server_task = tokio::spawn(async move {
            accept(
                &mut server,
                &[ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION)],
            )
            .await
            .unwrap()
        });

        let ack = connect(
            &mut client,
            &[
                ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION),
                ProtocolSpec::new(KV_PROTOCOL, 1),
            ],
        )
        .await
        .unwrap();

        assert_eq!(ack.supports(CORE_PROTOCOL), Some(CORE_PROTOCOL_VERSION));
        assert_eq!(ack.supports(KV_PROTOCOL), None);

        let hello = server_task.await.unwrap();
        assert_eq!(hello.protocols.len(), 2);
    }
}

//! Wire-level tests of the core protocol: clients served by real
//! dispatch tasks over in-process socket pairs.

use hyprtavern_core::handshake;
use hyprtavern_core::proto::{
    ClientMessage, CoreEvent, CoreRequest, ExposeError, FilterMode, PermissionMode,
    ProtocolSpec, ServerMessage, CORE_PROTOCOL, CORE_PROTOCOL_VERSION,
    PERMISSION_MONITORING_ALL_BUS_OBJECTS,
};
use hyprtavern_core::WireConnection;

use hyprtavern_daemon::dispatch::serve_client;
use hyprtavern_daemon::state::{shared, SharedState};

struct TestClient {
    conn: WireConnection,
    serial: u32,
}

impl TestClient {
    async fn start(state: &SharedState, token: Option<&str>) -> Self {
        let (client, server) = WireConnection::pair().unwrap();

        let state = state.clone();
        let token = token.map(str::to_owned);
        tokio::spawn(async move {
            let _ = serve_client(server, state, token).await;
        });

        let mut conn = client;
        handshake::connect(
            &mut conn,
            &[ProtocolSpec::new(CORE_PROTOCOL, CORE_PROTOCOL_VERSION)],
        )
        .await
        .unwrap();

        Self { conn, serial: 0 }
    }

    async fn send(&mut self, req: CoreRequest) {
        self.conn.send(&ClientMessage::Core(req)).await.unwrap();
    }

    /// Sync barrier collecting every core event seen on the way.
    async fn roundtrip(&mut self) -> Vec<CoreEvent> {
        self.serial += 1;
        self.conn
            .send(&ClientMessage::Sync {
                serial: self.serial,
            })
            .await
            .unwrap();

        let mut events = Vec::new();
        loop {
            match self.conn.recv::<ServerMessage>().await.unwrap() {
                ServerMessage::SyncDone { serial } if serial == self.serial => return events,
                ServerMessage::Core(ev) => events.push(ev),
                _ => {}
            }
        }
    }

    /// Wait for the next core event, outside any barrier.
    async fn next_event(&mut self) -> CoreEvent {
        loop {
            if let ServerMessage::Core(ev) = self.conn.recv::<ServerMessage>().await.unwrap() {
                return ev;
            }
        }
    }
}

fn results_of(events: &[CoreEvent], query: u32) -> Vec<u32> {
    events
        .iter()
        .find_map(|ev| match ev {
            CoreEvent::Results { query: q, ids } if *q == query => Some(ids.clone()),
            _ => None,
        })
        .expect("query emitted no results")
}

#[tokio::test]
async fn query_all_and_any_over_properties() {
    let state = shared("__tavernkeep__0_0".into());
    let mut client = TestClient::start(&state, None).await;

    // O1 {p:a=a, q:b=b}, O2 {p:a=a}, O3 {q:b=b}.
    for (seq, props) in [
        (1, vec![("p:a", "a"), ("q:b", "b")]),
        (2, vec![("p:a", "a")]),
        (3, vec![("q:b", "b")]),
    ] {
        client
            .send(CoreRequest::GetBusObject {
                seq,
                name: format!("o{seq}"),
            })
            .await;
        for (name, value) in props {
            client
                .send(CoreRequest::ExposeProperty {
                    object: seq,
                    name: name.into(),
                    value: value.into(),
                })
                .await;
        }
    }

    client
        .send(CoreRequest::GetQuery {
            seq: 10,
            protocols: vec![],
            protocol_filter: FilterMode::All,
            properties: vec!["p:a=a".into(), "q:b=b".into()],
            property_filter: FilterMode::All,
        })
        .await;
    let all = client.roundtrip().await;
    assert_eq!(results_of(&all, 10), vec![1]);

    client
        .send(CoreRequest::GetQuery {
            seq: 11,
            protocols: vec![],
            protocol_filter: FilterMode::All,
            properties: vec!["p:a=a".into(), "q:b=b".into()],
            property_filter: FilterMode::Any,
        })
        .await;
    let any = client.roundtrip().await;
    assert_eq!(results_of(&any, 11), vec![1, 2, 3]);
}

#[tokio::test]
async fn invalid_query_property_fails_whole_query() {
    let state = shared(String::new());
    let mut client = TestClient::start(&state, None).await;

    client
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "o".into(),
        })
        .await;
    client
        .send(CoreRequest::GetQuery {
            seq: 2,
            protocols: vec![],
            protocol_filter: FilterMode::All,
            properties: vec!["no_equals_here".into()],
            property_filter: FilterMode::All,
        })
        .await;

    let events = client.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Error { object: 2, .. })));
    assert!(!events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Results { .. })));
}

#[tokio::test]
async fn exclusive_protocol_collision() {
    let state = shared(String::new());
    let mut a = TestClient::start(&state, None).await;
    let mut b = TestClient::start(&state, None).await;

    a.send(CoreRequest::GetBusObject {
        seq: 1,
        name: "a".into(),
    })
    .await;
    a.send(CoreRequest::ExposeProtocol {
        object: 1,
        name: "kv".into(),
        revision: 1,
        required_permissions: vec![],
        exclusive: true,
    })
    .await;
    assert!(a.roundtrip().await.is_empty());

    b.send(CoreRequest::GetBusObject {
        seq: 1,
        name: "b".into(),
    })
    .await;
    b.send(CoreRequest::ExposeProtocol {
        object: 1,
        name: "kv".into(),
        revision: 1,
        required_permissions: vec![],
        exclusive: true,
    })
    .await;

    let events = b.roundtrip().await;
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::ExposeProtocolError {
            object: 1,
            error: ExposeError::AlreadyExposed,
        }
    )));

    // The registry still carries exactly A's exposure.
    let st = hyprtavern_daemon::state::lock(&state);
    let exposing: Vec<_> = st
        .registry
        .iter()
        .filter(|o| o.protocols.iter().any(|p| p.name == "kv"))
        .collect();
    assert_eq!(exposing.len(), 1);
    assert_eq!(exposing[0].name, "a");
}

#[tokio::test]
async fn handle_snapshot_and_dead_target() {
    let state = shared(String::new());
    let mut owner = TestClient::start(&state, None).await;
    let mut viewer = TestClient::start(&state, None).await;

    owner
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "beer-engine".into(),
        })
        .await;
    owner
        .send(CoreRequest::ExposeProtocol {
            object: 1,
            name: "kv".into(),
            revision: 3,
            required_permissions: vec![],
            exclusive: false,
        })
        .await;
    owner
        .send(CoreRequest::ExposeProperty {
            object: 1,
            name: "kv:backend".into(),
            value: "aes".into(),
        })
        .await;
    owner.roundtrip().await;

    viewer
        .send(CoreRequest::GetObjectHandle { seq: 5, target: 1 })
        .await;
    let events = viewer.roundtrip().await;

    assert!(events.iter().any(
        |ev| matches!(ev, CoreEvent::Name { handle: 5, name } if name == "beer-engine")
    ));
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::Protocols { handle: 5, names, revisions }
            if names == &["kv"] && revisions == &[3]
    )));
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::Properties { handle: 5, properties }
            if properties == &["kv:backend=aes"]
    )));
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Done { handle: 5 })));

    // Destroy the object; a fresh handle snapshot fails.
    owner.send(CoreRequest::Destroy { object: 1 }).await;
    owner.roundtrip().await;

    viewer
        .send(CoreRequest::GetObjectHandle { seq: 6, target: 1 })
        .await;
    let events = viewer.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Failed { handle: 6 })));

    // Connect through the stale handle: socket_failed.
    viewer.send(CoreRequest::Connect { handle: 6 }).await;
    let events = viewer.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::SocketFailed { handle: 6 })));
}

#[tokio::test]
async fn rendezvous_identity_redeems_exactly_once() {
    let state = shared(String::new());
    let mut owner = TestClient::start(&state, None).await;
    let mut spy = TestClient::start(&state, None).await;

    owner
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "hyprtavern-kv".into(),
        })
        .await;
    owner.roundtrip().await;

    // The requester sets up identity "spy" with one granted permission.
    spy.send(CoreRequest::GetSecurityObject {
        seq: 1,
        token: String::new(),
    })
    .await;
    spy.send(CoreRequest::SetIdentity {
        object: 1,
        name: "spy".into(),
        description: "a very sneaky client".into(),
    })
    .await;
    spy.send(CoreRequest::ObtainPermission {
        object: 1,
        permission: PERMISSION_MONITORING_ALL_BUS_OBJECTS,
        mode: PermissionMode::Session,
    })
    .await;

    let events = spy.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Token { security: 1, .. })));

    // Connect to the owner's object.
    spy.send(CoreRequest::GetObjectHandle { seq: 2, target: 1 })
        .await;
    spy.send(CoreRequest::Connect { handle: 2 }).await;

    let events = spy.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Socket { handle: 2 })));
    assert!(spy.conn.take_fd().is_some());

    // The owner receives new_fd with a non-empty rendezvous token.
    let rendezvous = loop {
        match owner.next_event().await {
            CoreEvent::NewFd { object: 1, rendezvous } => break rendezvous,
            _ => {}
        }
    };
    assert!(!rendezvous.is_empty());
    assert!(owner.conn.take_fd().is_some());

    // First redemption: identity and permissions of the spy.
    owner
        .send(CoreRequest::GetSecurityResponse {
            seq: 10,
            rendezvous: rendezvous.clone(),
        })
        .await;
    let events = owner.roundtrip().await;
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::Identity { response: 10, name, .. } if name == "spy"
    )));
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::Permissions { response: 10, permissions }
            if permissions == &[PERMISSION_MONITORING_ALL_BUS_OBJECTS]
    )));
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::ResponseDone { response: 10 })));

    // Second redemption of the same token fails.
    owner
        .send(CoreRequest::GetSecurityResponse {
            seq: 11,
            rendezvous,
        })
        .await;
    let events = owner.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::ResponseFailed { response: 11 })));
}

#[tokio::test]
async fn tokenless_requester_connects_with_empty_rendezvous() {
    let state = shared(String::new());
    let mut owner = TestClient::start(&state, None).await;
    let mut anon = TestClient::start(&state, None).await;

    owner
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "o".into(),
        })
        .await;
    owner.roundtrip().await;

    anon.send(CoreRequest::GetObjectHandle { seq: 1, target: 1 })
        .await;
    anon.send(CoreRequest::Connect { handle: 1 }).await;
    anon.roundtrip().await;

    let rendezvous = loop {
        match owner.next_event().await {
            CoreEvent::NewFd { rendezvous, .. } => break rendezvous,
            _ => {}
        }
    };
    assert!(rendezvous.is_empty());
}

#[tokio::test]
async fn tavernkeep_sentinel_redeems_to_full_permissions() {
    let sentinel = "__tavernkeep__7_7".to_owned();
    let state = shared(sentinel.clone());

    let mut owner = TestClient::start(&state, None).await;
    let mut keeper = TestClient::start(&state, Some(&sentinel)).await;

    owner
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "o".into(),
        })
        .await;
    owner.roundtrip().await;

    keeper
        .send(CoreRequest::GetObjectHandle { seq: 1, target: 1 })
        .await;
    keeper.send(CoreRequest::Connect { handle: 1 }).await;
    keeper.roundtrip().await;

    let rendezvous = loop {
        match owner.next_event().await {
            CoreEvent::NewFd { rendezvous, .. } => break rendezvous,
            _ => {}
        }
    };
    assert!(!rendezvous.is_empty());

    owner
        .send(CoreRequest::GetSecurityResponse { seq: 2, rendezvous })
        .await;
    let events = owner.roundtrip().await;
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::Identity { response: 2, name, .. } if name == "tavernkeep"
    )));
    assert!(events.iter().any(|ev| matches!(
        ev,
        CoreEvent::Permissions { response: 2, permissions } if !permissions.is_empty()
    )));
}

#[tokio::test]
async fn disconnect_destroys_owned_objects() {
    let state = shared(String::new());
    let mut owner = TestClient::start(&state, None).await;
    let mut viewer = TestClient::start(&state, None).await;

    owner
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "ephemeral".into(),
        })
        .await;
    owner.roundtrip().await;

    drop(owner);

    // Poll until the server has torn the client down.
    let mut tries = 0;
    loop {
        viewer
            .send(CoreRequest::GetQuery {
                seq: 100 + tries,
                protocols: vec![],
                protocol_filter: FilterMode::All,
                properties: vec![],
                property_filter: FilterMode::All,
            })
            .await;
        let events = viewer.roundtrip().await;
        let ids = results_of(&events, 100 + tries);
        if ids.is_empty() {
            break;
        }
        tries += 1;
        assert!(tries < 100, "object of dead client never disappeared");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn invalid_property_name_is_reported_and_ignored() {
    let state = shared(String::new());
    let mut client = TestClient::start(&state, None).await;

    client
        .send(CoreRequest::GetBusObject {
            seq: 1,
            name: "o".into(),
        })
        .await;
    client
        .send(CoreRequest::ExposeProperty {
            object: 1,
            name: "bad name".into(),
            value: "v".into(),
        })
        .await;

    let events = client.roundtrip().await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, CoreEvent::Error { object: 1, .. })));

    let st = hyprtavern_daemon::state::lock(&state);
    assert!(st.registry.get(1).unwrap().properties.is_empty());
}

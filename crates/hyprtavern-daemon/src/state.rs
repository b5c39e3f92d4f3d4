//! The core's single top-level state value.
//!
//! Everything the protocol handlers share lives here behind one lock:
//! connected clients and their event senders, the object registry, the
//! security subsystem, the tavern environment, and the bridge to the
//! barmaid once its init completes. Handlers take the lock briefly and
//! never across an await.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use hyprtavern_core::proto::ServerMessage;

use crate::bridge::KvBridge;
use crate::registry::Registry;
use crate::security::SecurityState;

/// Per-process client identifier; never reused within one run.
pub type ClientId = u64;

/// One event on its way to a client, with an optional descriptor riding
/// on its frame.
#[derive(Debug)]
pub struct Outgoing {
    /// The event.
    pub msg: ServerMessage,
    /// Descriptor to attach, if any.
    pub fd: Option<OwnedFd>,
}

impl Outgoing {
    /// An event without a descriptor.
    #[must_use]
    pub const fn msg(msg: ServerMessage) -> Self {
        Self { msg, fd: None }
    }

    /// An event with a descriptor attached.
    #[must_use]
    pub const fn with_fd(msg: ServerMessage, fd: OwnedFd) -> Self {
        Self { msg, fd: Some(fd) }
    }
}

/// What the core knows about a connected client.
#[derive(Debug)]
pub struct ClientHandle {
    /// Queue into the client's writer task.
    pub sender: mpsc::UnboundedSender<Outgoing>,
    /// Peer pid, from `SO_PEERCRED` where available.
    pub pid: Option<i32>,
    /// The manager's associated security token; empty until the client
    /// creates a security object, the sentinel for the tavernkeep.
    pub token: String,
}

/// The core's shared state.
#[derive(Debug, Default)]
pub struct CoreState {
    next_client: ClientId,
    clients: HashMap<ClientId, ClientHandle>,
    /// The bus object registry.
    pub registry: Registry,
    /// Security objects and the one-time rendezvous map.
    pub security: SecurityState,
    /// The tavern environment, last write wins per name.
    pub env: Vec<(String, String)>,
    /// The tavernkeep's sentinel token, fixed at startup.
    pub tavernkeep_token: String,
    /// Bridge to the barmaid's key-value store; `None` until barmaid init
    /// completes.
    pub bridge: Option<KvBridge>,
}

impl CoreState {
    /// Fresh state carrying the given sentinel.
    #[must_use]
    pub fn new(tavernkeep_token: String) -> Self {
        Self {
            registry: Registry::new(),
            tavernkeep_token,
            ..Self::default()
        }
    }

    /// Register a connected client.
    pub fn add_client(&mut self, handle: ClientHandle) -> ClientId {
        let id = self.next_client;
        self.next_client += 1;
        self.clients.insert(id, handle);
        id
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Look up a client.
    #[must_use]
    pub fn client(&self, id: ClientId) -> Option<&ClientHandle> {
        self.clients.get(&id)
    }

    /// Look up a client, mutable.
    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut ClientHandle> {
        self.clients.get_mut(&id)
    }

    /// Queue an event to a client. Delivery is best effort: a client past
    /// hangup just drops it.
    pub fn send_to(&self, id: ClientId, out: Outgoing) {
        if let Some(client) = self.clients.get(&id) {
            if client.sender.send(out).is_err() {
                debug!("client {id} writer already gone");
            }
        }
    }

    /// Tear down a disconnected client: its registry objects and security
    /// objects go with it.
    pub fn remove_client(&mut self, id: ClientId) {
        self.clients.remove(&id);
        self.registry.remove_by_owner(id);
        self.security.remove_by_owner(id);
    }

    /// Apply environment updates, last write wins per name.
    pub fn update_env(&mut self, names: &[String], values: &[String]) {
        for (name, value) in names.iter().zip(values) {
            if let Some(slot) = self.env.iter_mut().find(|(n, _)| n == name) {
                slot.1 = value.clone();
            } else {
                self.env.push((name.clone(), value.clone()));
            }
        }
    }
}

/// Shared handle to the core state.
pub type SharedState = Arc<Mutex<CoreState>>;

/// Build a fresh shared state.
#[must_use]
pub fn shared(tavernkeep_token: String) -> SharedState {
    Arc::new(Mutex::new(CoreState::new(tavernkeep_token)))
}

/// Take the state lock; poisoning is unrecoverable.
pub fn lock(state: &SharedState) -> MutexGuard<'_, CoreState> {
    state.lock().expect("core state lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ClientHandle, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientHandle {
                sender: tx,
                pid: Some(1),
                token: String::new(),
            },
            rx,
        )
    }

    #[test]
    fn client_ids_are_never_reused() {
        let mut state = CoreState::new("__tavernkeep__1_2".into());
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        let a = state.add_client(h1);
        state.remove_client(a);
        let b = state.add_client(h2);
        assert_ne!(a, b);
    }

    #[test]
    fn removing_a_client_sweeps_its_objects() {
        let mut state = CoreState::new(String::new());
        let (h, _rx) = handle();
        let id = state.add_client(h);
        state.registry.add("o", id, 1);

        state.remove_client(id);
        assert_eq!(state.registry.iter().count(), 0);
    }

    #[test]
    fn env_updates_are_last_write_wins() {
        let mut state = CoreState::new(String::new());
        state.update_env(&["A".into(), "B".into()], &["1".into(), "2".into()]);
        state.update_env(&["A".into()], &["3".into()]);

        assert_eq!(
            state.env,
            vec![("A".into(), "3".into()), ("B".into(), "2".into())]
        );
    }
}

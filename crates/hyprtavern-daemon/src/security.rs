//! The security subsystem.
//!
//! Security objects record a requester's identity and capabilities, keyed
//! by an opaque token: a UUID for clients, a printable sentinel for the
//! tavernkeep, so string comparison alone suffices for identity checks.
//! Rendezvous tokens are one-use UUIDs tying a freshly delivered peer
//! descriptor back to the security object of whoever asked for it.

use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hyprtavern_core::proto::{GrantResult, PermissionId, PermissionMode};

use crate::state::ClientId;

/// The JSON record persisted in the tavern namespace under
/// `token:{token}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentRecord {
    /// Permanent permission grants.
    #[serde(rename = "persistentPerms")]
    pub persistent_perms: Vec<PermissionId>,
}

/// The tavern key a token's record is stored under.
#[must_use]
pub fn token_key(token: &str) -> String {
    format!("token:{token}")
}

/// Mint the tavernkeep's process-unique sentinel token.
#[must_use]
pub fn mint_sentinel() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "__tavernkeep__{}_{}",
        rng.gen::<u64>(),
        rng.gen::<u64>()
    )
}

/// Mint a fresh client security token.
#[must_use]
pub fn mint_token() -> String {
    Uuid::new_v4().to_string()
}

/// A requester's capability record.
#[derive(Debug, Clone)]
pub struct SecurityObject {
    /// Opaque token: UUID string or the tavernkeep sentinel.
    pub token: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Requester pid.
    pub pid: i32,
    /// Grants that die with this object.
    pub session_perms: BTreeSet<PermissionId>,
    /// Grants mirrored in the tavern key-value store.
    pub persistent_perms: BTreeSet<PermissionId>,
    /// The manager this object hangs off (weak: checked for liveness at
    /// redemption).
    pub owner: ClientId,
    /// The owner's wire id for this object.
    pub wire_id: u32,
}

impl SecurityObject {
    /// A fresh record with no grants.
    #[must_use]
    pub fn new(token: String, pid: i32, owner: ClientId, wire_id: u32) -> Self {
        Self {
            token,
            name: String::new(),
            description: String::new(),
            pid,
            session_perms: BTreeSet::new(),
            persistent_perms: BTreeSet::new(),
            owner,
            wire_id,
        }
    }

    /// Every permission held, session and persistent, in tag order.
    #[must_use]
    pub fn all_permissions(&self) -> Vec<PermissionId> {
        self.session_perms
            .union(&self.persistent_perms)
            .copied()
            .collect()
    }

    /// Whether a permission is held in either set.
    #[must_use]
    pub fn holds(&self, perm: PermissionId) -> bool {
        self.session_perms.contains(&perm) || self.persistent_perms.contains(&perm)
    }

    /// Grant bookkeeping. Idempotent: a held permission answers
    /// `already_granted`, and a permanent request for a session-held
    /// permission promotes it. The permission authority itself is a
    /// pluggable collaborator; until one exists every new grant answers
    /// `granted_by_policy`.
    ///
    /// Returns the result plus whether the persistent set changed (the
    /// caller writes it through to the store if so).
    pub fn obtain(&mut self, perm: PermissionId, mode: PermissionMode) -> (GrantResult, bool) {
        let held = self.holds(perm);

        let persisted = match mode {
            PermissionMode::Session => {
                if !held {
                    self.session_perms.insert(perm);
                }
                false
            }
            PermissionMode::Permanent => self.persistent_perms.insert(perm),
        };

        let result = if held {
            GrantResult::AlreadyGranted
        } else {
            GrantResult::GrantedByPolicy
        };

        (result, persisted)
    }

    /// The record to persist for this object.
    #[must_use]
    pub fn persistent_record(&self) -> PersistentRecord {
        PersistentRecord {
            persistent_perms: self.persistent_perms.iter().copied().collect(),
        }
    }
}

/// Owning collections for security objects and the one-time rendezvous
/// map.
#[derive(Debug, Default)]
pub struct SecurityState {
    objects: Vec<SecurityObject>,
    one_time: HashMap<String, String>,
}

impl SecurityState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new security object.
    pub fn insert(&mut self, obj: SecurityObject) {
        self.objects.push(obj);
    }

    /// Find by token.
    #[must_use]
    pub fn find(&self, token: &str) -> Option<&SecurityObject> {
        self.objects.iter().find(|o| o.token == token)
    }

    /// Find by token, mutable.
    pub fn find_mut(&mut self, token: &str) -> Option<&mut SecurityObject> {
        self.objects.iter_mut().find(|o| o.token == token)
    }

    /// Find the object a client created under a given wire id.
    pub fn find_wire_mut(&mut self, owner: ClientId, wire_id: u32) -> Option<&mut SecurityObject> {
        self.objects
            .iter_mut()
            .find(|o| o.owner == owner && o.wire_id == wire_id)
    }

    /// Drop one wire object.
    pub fn remove_wire(&mut self, owner: ClientId, wire_id: u32) {
        self.objects
            .retain(|o| !(o.owner == owner && o.wire_id == wire_id));
    }

    /// Drop everything a disconnecting client owned. Session grants die
    /// here; persistent grants live on in the store.
    pub fn remove_by_owner(&mut self, owner: ClientId) {
        self.objects.retain(|o| o.owner != owner);
    }

    /// Mint a one-time rendezvous token resolving to `security_token`.
    pub fn mint_rendezvous(&mut self, security_token: &str) -> String {
        let rendezvous = Uuid::new_v4().to_string();
        self.one_time
            .insert(rendezvous.clone(), security_token.to_owned());
        rendezvous
    }

    /// Redeem a rendezvous token: removes the entry, first caller wins.
    pub fn redeem(&mut self, rendezvous: &str) -> Option<String> {
        self.one_time.remove(rendezvous)
    }

    /// Live rendezvous entries; unredeemed entries stay until process
    /// exit.
    #[must_use]
    pub fn rendezvous_len(&self) -> usize {
        self.one_time.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_distinguishable_and_unique() {
        let a = mint_sentinel();
        let b = mint_sentinel();
        assert!(a.starts_with("__tavernkeep__"));
        assert_ne!(a, b);
    }

    #[test]
    fn grants_are_idempotent() {
        let mut obj = SecurityObject::new(mint_token(), 1, 1, 1);

        let (r, persisted) = obj.obtain(2, PermissionMode::Session);
        assert_eq!(r, GrantResult::GrantedByPolicy);
        assert!(!persisted);

        let (r, _) = obj.obtain(2, PermissionMode::Session);
        assert_eq!(r, GrantResult::AlreadyGranted);

        assert_eq!(obj.all_permissions(), vec![2]);
    }

    #[test]
    fn permanent_grant_marks_the_record_dirty() {
        let mut obj = SecurityObject::new(mint_token(), 1, 1, 1);

        let (r, persisted) = obj.obtain(1, PermissionMode::Permanent);
        assert_eq!(r, GrantResult::GrantedByPolicy);
        assert!(persisted);
        assert_eq!(obj.persistent_record().persistent_perms, vec![1]);

        // Re-requesting permanently changes nothing.
        let (r, persisted) = obj.obtain(1, PermissionMode::Permanent);
        assert_eq!(r, GrantResult::AlreadyGranted);
        assert!(!persisted);
    }

    #[test]
    fn permanent_request_promotes_a_session_grant() {
        let mut obj = SecurityObject::new(mint_token(), 1, 1, 1);
        obj.obtain(3, PermissionMode::Session);

        let (r, persisted) = obj.obtain(3, PermissionMode::Permanent);
        assert_eq!(r, GrantResult::AlreadyGranted);
        assert!(persisted);
        assert!(obj.persistent_perms.contains(&3));
    }

    #[test]
    fn rendezvous_redeems_exactly_once() {
        let mut state = SecurityState::new();
        let token = mint_token();
        let u = state.mint_rendezvous(&token);

        assert_eq!(state.redeem(&u), Some(token));
        assert_eq!(state.redeem(&u), None);
        assert_eq!(state.redeem("no-such"), None);
    }

    #[test]
    fn rendezvous_tokens_are_unique() {
        let mut state = SecurityState::new();
        let a = state.mint_rendezvous("t");
        let b = state.mint_rendezvous("t");
        assert_ne!(a, b);
        assert_eq!(state.rendezvous_len(), 2);
    }

    #[test]
    fn owner_sweep_kills_session_grants() {
        let mut state = SecurityState::new();
        let mut obj = SecurityObject::new(mint_token(), 1, 42, 1);
        obj.obtain(0, PermissionMode::Session);
        let token = obj.token.clone();
        state.insert(obj);

        state.remove_by_owner(42);
        assert!(state.find(&token).is_none());
    }

    #[test]
    fn persistent_record_json_shape() {
        let rec = PersistentRecord {
            persistent_perms: vec![1, 2],
        };
        assert_eq!(
            serde_json::to_string(&rec).unwrap(),
            r#"{"persistentPerms":[1,2]}"#
        );
    }
}

//! The bus object registry.
//!
//! A small, insertion-ordered set of published objects. Internal ids come
//! from a process-wide monotonically increasing counter and are never
//! reused within one run. Removal is a linear scan; the expected
//! population is tens to low hundreds.

use thiserror::Error;

use hyprtavern_core::proto::PermissionId;

use crate::state::ClientId;

/// One protocol exposed on a bus object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEntry {
    /// Protocol name.
    pub name: String,
    /// Protocol revision.
    pub revision: u32,
    /// Permissions a connecting peer must hold.
    pub required_permissions: Vec<PermissionId>,
    /// Whether this exposure claimed the protocol exclusively.
    pub exclusive: bool,
}

/// A published bus object.
#[derive(Debug, Clone)]
pub struct BusObject {
    /// Server-assigned id, unique for the process lifetime.
    pub internal_id: u32,
    /// Published name.
    pub name: String,
    /// Owning client.
    pub owner: ClientId,
    /// The owner's wire id for this object, for event delivery.
    pub owner_wire_id: u32,
    /// Exposed protocols, in exposure order.
    pub protocols: Vec<ProtocolEntry>,
    /// Properties, in exposure order.
    pub properties: Vec<(String, String)>,
}

/// Property name rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PropertyError {
    /// Empty name.
    #[error("invalid property name (empty)")]
    Empty,
    /// A character outside `[A-Za-z0-9_+:]`.
    #[error("invalid property name (invalid chars)")]
    InvalidChars,
    /// Not exactly one `:`, or a `:` at either end.
    #[error("invalid property name (invalid colons)")]
    InvalidColons,
}

/// Validate a property name: `[A-Za-z0-9_+:]+` with exactly one `:`, not
/// at either end.
///
/// # Errors
///
/// The specific [`PropertyError`] that applies.
pub fn validate_property_name(name: &str) -> Result<(), PropertyError> {
    if name.is_empty() {
        return Err(PropertyError::Empty);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '+' || c == ':')
    {
        return Err(PropertyError::InvalidChars);
    }

    if name.matches(':').count() != 1 || name.starts_with(':') || name.ends_with(':') {
        return Err(PropertyError::InvalidColons);
    }

    Ok(())
}

/// Exclusive-exposure refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("protocol already exposed")]
pub struct AlreadyExposed;

/// The registry proper.
#[derive(Debug)]
pub struct Registry {
    next_id: u32,
    objects: Vec<BusObject>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry; the first object gets id 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: 1,
            objects: Vec::new(),
        }
    }

    /// Publish a new object, returning its internal id.
    pub fn add(&mut self, name: &str, owner: ClientId, owner_wire_id: u32) -> u32 {
        let internal_id = self.next_id;
        self.next_id += 1;

        self.objects.push(BusObject {
            internal_id,
            name: name.to_owned(),
            owner,
            owner_wire_id,
            protocols: Vec::new(),
            properties: Vec::new(),
        });

        internal_id
    }

    /// Look up by internal id.
    #[must_use]
    pub fn get(&self, internal_id: u32) -> Option<&BusObject> {
        self.objects.iter().find(|o| o.internal_id == internal_id)
    }

    fn get_mut(&mut self, internal_id: u32) -> Option<&mut BusObject> {
        self.objects
            .iter_mut()
            .find(|o| o.internal_id == internal_id)
    }

    /// Remove by internal id.
    pub fn remove(&mut self, internal_id: u32) {
        self.objects.retain(|o| o.internal_id != internal_id);
    }

    /// Remove every object a disconnecting client owned.
    pub fn remove_by_owner(&mut self, owner: ClientId) {
        self.objects.retain(|o| o.owner != owner);
    }

    /// Iterate live objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BusObject> {
        self.objects.iter()
    }

    /// Expose a protocol on an object.
    ///
    /// An exclusive exposure succeeds only if no other live object exposes
    /// the same protocol name; refusal leaves the registry untouched.
    ///
    /// # Errors
    ///
    /// [`AlreadyExposed`] on an exclusive collision.
    pub fn expose_protocol(
        &mut self,
        internal_id: u32,
        entry: ProtocolEntry,
    ) -> Result<(), AlreadyExposed> {
        if entry.exclusive {
            let taken = self.objects.iter().any(|o| {
                o.internal_id != internal_id && o.protocols.iter().any(|p| p.name == entry.name)
            });
            if taken {
                return Err(AlreadyExposed);
            }
        }

        if let Some(obj) = self.get_mut(internal_id) {
            obj.protocols.push(entry);
        }

        Ok(())
    }

    /// Set a property on an object; an empty value deletes by name.
    ///
    /// # Errors
    ///
    /// [`PropertyError`] when the name fails validation; state is
    /// untouched.
    pub fn expose_property(
        &mut self,
        internal_id: u32,
        name: &str,
        value: &str,
    ) -> Result<(), PropertyError> {
        validate_property_name(name)?;

        let Some(obj) = self.get_mut(internal_id) else {
            return Ok(());
        };

        if value.is_empty() {
            obj.properties.retain(|(n, _)| n != name);
            return Ok(());
        }

        obj.properties.push((name.to_owned(), value.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, exclusive: bool) -> ProtocolEntry {
        ProtocolEntry {
            name: name.into(),
            revision: 1,
            required_permissions: vec![],
            exclusive,
        }
    }

    #[test]
    fn ids_are_one_based_monotonic_and_never_reused() {
        let mut reg = Registry::new();
        let a = reg.add("a", 1, 1);
        let b = reg.add("b", 1, 2);
        assert_eq!((a, b), (1, 2));

        reg.remove(a);
        let c = reg.add("c", 1, 3);
        assert_eq!(c, 3);
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn iteration_is_insertion_order() {
        let mut reg = Registry::new();
        reg.add("x", 1, 1);
        reg.add("y", 2, 1);
        reg.add("z", 1, 2);
        reg.remove(2);

        let names: Vec<_> = reg.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["x", "z"]);
    }

    #[test]
    fn owner_disconnect_sweeps_their_objects() {
        let mut reg = Registry::new();
        reg.add("keep", 1, 1);
        reg.add("gone", 2, 1);
        reg.add("gone2", 2, 2);

        reg.remove_by_owner(2);
        assert_eq!(reg.iter().count(), 1);
        assert_eq!(reg.iter().next().unwrap().name, "keep");
    }

    #[test]
    fn property_name_validation() {
        assert_eq!(validate_property_name(""), Err(PropertyError::Empty));
        assert_eq!(
            validate_property_name("has space:x"),
            Err(PropertyError::InvalidChars)
        );
        assert_eq!(
            validate_property_name("nocolon"),
            Err(PropertyError::InvalidColons)
        );
        assert_eq!(
            validate_property_name("two:co:lons"),
            Err(PropertyError::InvalidColons)
        );
        assert_eq!(
            validate_property_name(":leading"),
            Err(PropertyError::InvalidColons)
        );
        assert_eq!(
            validate_property_name("trailing:"),
            Err(PropertyError::InvalidColons)
        );
        assert!(validate_property_name("core:security_token").is_ok());
        assert!(validate_property_name("a+b:c_9").is_ok());
    }

    #[test]
    fn empty_value_deletes_property() {
        let mut reg = Registry::new();
        let id = reg.add("o", 1, 1);

        reg.expose_property(id, "kv:backend", "aes").unwrap();
        assert_eq!(reg.get(id).unwrap().properties.len(), 1);

        reg.expose_property(id, "kv:backend", "").unwrap();
        assert!(reg.get(id).unwrap().properties.is_empty());

        // Deleting a property that is not there is not an error.
        reg.expose_property(id, "kv:missing", "").unwrap();
    }

    #[test]
    fn exclusive_collision_refused_without_mutation() {
        let mut reg = Registry::new();
        let a = reg.add("a", 1, 1);
        let b = reg.add("b", 2, 1);

        reg.expose_protocol(a, entry("kv", true)).unwrap();
        assert_eq!(
            reg.expose_protocol(b, entry("kv", true)),
            Err(AlreadyExposed)
        );

        // Registry still contains exactly A's exposure.
        assert!(reg.get(b).unwrap().protocols.is_empty());
        assert_eq!(reg.get(a).unwrap().protocols.len(), 1);
    }

    #[test]
    fn exclusive_collides_with_non_exclusive_exposure_too() {
        let mut reg = Registry::new();
        let a = reg.add("a", 1, 1);
        let b = reg.add("b", 2, 1);

        reg.expose_protocol(a, entry("p", false)).unwrap();
        assert_eq!(
            reg.expose_protocol(b, entry("p", true)),
            Err(AlreadyExposed)
        );
    }

    #[test]
    fn exclusive_frees_up_when_owner_dies() {
        let mut reg = Registry::new();
        let a = reg.add("a", 1, 1);
        reg.expose_protocol(a, entry("kv", true)).unwrap();
        reg.remove(a);

        let b = reg.add("b", 2, 1);
        assert!(reg.expose_protocol(b, entry("kv", true)).is_ok());
    }
}

//! Three-namespace key-value storage.
//!
//! All namespaces are ordered lists scanned front to back; the first match
//! wins and insertion order survives every rewrite. `set` updates in place
//! when the key exists and appends otherwise. An empty value is stored as
//! an empty string: the store has no delete.
//!
//! [`KvStore`] wraps the in-memory [`KvStorage`] with write-through
//! persistence: every mutation re-seals the JSON encoding into the
//! encrypted container and rewrites the store file before returning.
//! Write failures are logged, not propagated.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use zeroize::Zeroizing;

use crate::blob::EncryptedBlob;

/// One key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    /// Key, unique within its list.
    pub key: String,
    /// Value, possibly empty.
    pub value: String,
}

/// Per-application bucket, keyed by canonical binary path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvApp {
    /// Canonicalized absolute binary path, or `"anonymous"`.
    #[serde(rename = "appName")]
    pub app_name: String,
    /// The bucket's entries.
    pub entries: Vec<KvEntry>,
}

/// The full store content; this struct is the JSON plaintext of the
/// encrypted container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStorage {
    /// Per-application buckets.
    #[serde(default)]
    pub apps: Vec<KvApp>,
    /// The unbounded namespace.
    #[serde(default)]
    pub global: Vec<KvEntry>,
    /// The tavernkeep-only namespace.
    #[serde(default)]
    pub tavern: Vec<KvEntry>,
}

fn set_entry(list: &mut Vec<KvEntry>, key: &str, value: &str) {
    for entry in list.iter_mut() {
        if entry.key == key {
            entry.value = value.to_owned();
            return;
        }
    }
    list.push(KvEntry {
        key: key.to_owned(),
        value: value.to_owned(),
    });
}

fn get_entry<'a>(list: &'a [KvEntry], key: &str) -> Option<&'a str> {
    list.iter()
        .find(|e| e.key == key)
        .map(|e| e.value.as_str())
}

impl KvStorage {
    /// Set in the unbounded namespace.
    pub fn set_global(&mut self, key: &str, value: &str) {
        set_entry(&mut self.global, key, value);
    }

    /// Set in the tavern namespace.
    pub fn set_tavern(&mut self, key: &str, value: &str) {
        set_entry(&mut self.tavern, key, value);
    }

    /// Set in an app bucket, creating the bucket on first write.
    pub fn set_app(&mut self, app: &str, key: &str, value: &str) {
        if let Some(bucket) = self.apps.iter_mut().find(|a| a.app_name == app) {
            set_entry(&mut bucket.entries, key, value);
            return;
        }
        self.apps.push(KvApp {
            app_name: app.to_owned(),
            entries: vec![KvEntry {
                key: key.to_owned(),
                value: value.to_owned(),
            }],
        });
    }

    /// Get from the unbounded namespace.
    #[must_use]
    pub fn get_global(&self, key: &str) -> Option<&str> {
        get_entry(&self.global, key)
    }

    /// Get from the tavern namespace.
    #[must_use]
    pub fn get_tavern(&self, key: &str) -> Option<&str> {
        get_entry(&self.tavern, key)
    }

    /// Get from an app bucket.
    #[must_use]
    pub fn get_app(&self, app: &str, key: &str) -> Option<&str> {
        self.apps
            .iter()
            .find(|a| a.app_name == app)
            .and_then(|a| get_entry(&a.entries, key))
    }
}

/// Persistent store: in-memory content plus the sealing context.
#[derive(Debug)]
pub struct KvStore {
    storage: KvStorage,
    path: PathBuf,
    password: Zeroizing<String>,
}

impl KvStore {
    /// Wrap already-loaded content for write-through persistence.
    #[must_use]
    pub fn new(storage: KvStorage, path: PathBuf, password: Zeroizing<String>) -> Self {
        Self {
            storage,
            path,
            password,
        }
    }

    /// Read-only view of the content.
    #[must_use]
    pub const fn storage(&self) -> &KvStorage {
        &self.storage
    }

    /// Set in the unbounded namespace and persist.
    pub fn set_global(&mut self, key: &str, value: &str) {
        self.storage.set_global(key, value);
        self.save();
    }

    /// Set in the tavern namespace and persist.
    pub fn set_tavern(&mut self, key: &str, value: &str) {
        self.storage.set_tavern(key, value);
        self.save();
    }

    /// Set in an app bucket and persist.
    pub fn set_app(&mut self, app: &str, key: &str, value: &str) {
        self.storage.set_app(app, key, value);
        self.save();
    }

    /// Get from the unbounded namespace.
    #[must_use]
    pub fn get_global(&self, key: &str) -> Option<&str> {
        self.storage.get_global(key)
    }

    /// Get from the tavern namespace.
    #[must_use]
    pub fn get_tavern(&self, key: &str) -> Option<&str> {
        self.storage.get_tavern(key)
    }

    /// Get from an app bucket.
    #[must_use]
    pub fn get_app(&self, app: &str, key: &str) -> Option<&str> {
        self.storage.get_app(app, key)
    }

    /// Re-seal and rewrite the store file. Best effort: failures are
    /// logged and the in-memory content stays authoritative.
    pub fn save(&self) {
        let json = match serde_json::to_vec(&self.storage) {
            Ok(json) => Zeroizing::new(json),
            Err(e) => {
                error!("failed to encode kv store: {e}");
                return;
            }
        };

        let blob = match EncryptedBlob::seal(&json, &self.password) {
            Ok(blob) => blob,
            Err(e) => {
                error!("failed to seal kv store: {e}");
                return;
            }
        };

        if let Err(e) = blob.write_file(&self.path) {
            error!("failed to store kv data on disk: {e}");
        } else {
            debug!("kv store written to {:?}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_observes_the_write() {
        let mut s = KvStorage::default();
        s.set_global("ale", "dark");
        assert_eq!(s.get_global("ale"), Some("dark"));
        assert_eq!(s.get_tavern("ale"), None);
        assert_eq!(s.get_app("anonymous", "ale"), None);
    }

    #[test]
    fn set_updates_in_place_preserving_order() {
        let mut s = KvStorage::default();
        s.set_global("a", "1");
        s.set_global("b", "2");
        s.set_global("a", "3");

        assert_eq!(s.global.len(), 2);
        assert_eq!(s.global[0], KvEntry { key: "a".into(), value: "3".into() });
        assert_eq!(s.global[1], KvEntry { key: "b".into(), value: "2".into() });
    }

    #[test]
    fn empty_value_is_stored_not_deleted() {
        let mut s = KvStorage::default();
        s.set_tavern("k", "v");
        s.set_tavern("k", "");
        assert_eq!(s.get_tavern("k"), Some(""));
    }

    #[test]
    fn app_buckets_are_created_lazily_and_kept_apart() {
        let mut s = KvStorage::default();
        s.set_app("/usr/bin/spy", "token", "aa");
        s.set_app("/usr/bin/env", "token", "bb");

        assert_eq!(s.apps.len(), 2);
        assert_eq!(s.get_app("/usr/bin/spy", "token"), Some("aa"));
        assert_eq!(s.get_app("/usr/bin/env", "token"), Some("bb"));
        assert_eq!(s.get_app("/usr/bin/other", "token"), None);
    }

    #[test]
    fn json_field_names_match_the_store_format() {
        let mut s = KvStorage::default();
        s.set_app("/bin/a", "k", "v");
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["apps"][0]["appName"], "/bin/a");
        assert_eq!(json["apps"][0]["entries"][0]["key"], "k");
    }

    #[test]
    fn storage_json_roundtrip() {
        let mut s = KvStorage::default();
        s.set_global("g", "1");
        s.set_tavern("t", "2");
        s.set_app("/bin/x", "a", "3");

        let json = serde_json::to_vec(&s).unwrap();
        let back: KvStorage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn persistent_store_roundtrips_through_the_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hyprtavern-kv.dat");

        let mut store = KvStore::new(
            KvStorage::default(),
            path.clone(),
            Zeroizing::new("hunter2".to_owned()),
        );
        store.set_global("g", "1");
        store.set_app("/bin/x", "a", "2");

        let blob = EncryptedBlob::read_file(&path).unwrap();
        let plain = blob.decrypt("hunter2").unwrap();
        let loaded: KvStorage = serde_json::from_slice(&plain).unwrap();
        assert_eq!(&loaded, store.storage());
    }
}

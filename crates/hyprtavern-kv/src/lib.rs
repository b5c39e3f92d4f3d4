//! # hyprtavern-kv
//!
//! The tavern's key-value barmaid: a companion process connected to the
//! bus through a capability-scoped channel, owning an on-disk
//! authenticated-encrypted store with three namespaces (per-app,
//! tavern-private, global).
//!
//! - [`blob`] — the AES-256-GCM container and its on-disk layout.
//! - [`store`] — the in-memory namespaces with write-through persistence.
//! - [`open`] — the blocking open pipeline (password loop, first-run
//!   setup).
//! - [`dialog`] — the password prompt collaborator interface.
//! - [`ident`] — pid → binary path resolution for app buckets.
//! - [`runtime`] — the async barmaid: bus object, clients, readiness.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod dialog;
pub mod ident;
pub mod open;
pub mod runtime;
pub mod store;

pub use blob::{BlobError, EncryptedBlob};
pub use store::{KvStorage, KvStore};

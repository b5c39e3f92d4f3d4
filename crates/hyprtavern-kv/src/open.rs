//! The blocking store-open pipeline.
//!
//! Runs on a worker thread (`spawn_blocking`), never on the protocol
//! thread: the dialog collaborator is allowed to block for as long as the
//! user stares at the prompt.
//!
//! Outcomes map onto the open state machine:
//! - `Ok(store)` — the store is `OPEN`.
//! - `Err(Unavailable)` — no prompt could be shown; the caller parks in
//!   `UNAVAILABLE` until an environment update makes a retry worthwhile.
//! - `Err(Fatal)` — the store directory is unusable; the barmaid gives up.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::blob::{BlobError, EncryptedBlob};
use crate::dialog::Dialog;
use crate::store::{KvStorage, KvStore};

/// Store file name under the data directory.
pub const KV_STORE_FILE_NAME: &str = "hyprtavern-kv.dat";
/// Data directory name under `$HOME/.local/share`.
pub const TAVERN_DATA_DIR_NAME: &str = "hyprtavern";

/// Why an open attempt did not produce an open store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpenError {
    /// The dialog (or `$HOME` itself) is unreachable; retry after an
    /// environment update.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store location is unusable; no retry will help.
    #[error("store open failed: {0}")]
    Fatal(String),
}

/// Resolve the store file path from `$HOME`.
///
/// # Errors
///
/// [`OpenError::Unavailable`] when `$HOME` is unset — an environment
/// update may yet deliver it.
pub fn store_path() -> Result<PathBuf, OpenError> {
    let home = std::env::var_os("HOME")
        .ok_or_else(|| OpenError::Unavailable("no $HOME".into()))?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(TAVERN_DATA_DIR_NAME)
        .join(KV_STORE_FILE_NAME))
}

/// One complete open attempt against the default store path.
///
/// # Errors
///
/// See [`OpenError`].
pub fn open_store(dialog: &dyn Dialog) -> Result<KvStore, OpenError> {
    open_store_at(dialog, store_path()?)
}

/// One complete open attempt against an explicit path.
///
/// # Errors
///
/// See [`OpenError`].
pub fn open_store_at(dialog: &dyn Dialog, path: PathBuf) -> Result<KvStore, OpenError> {
    if let Some(dir) = path.parent() {
        if !dir.is_dir() {
            debug!("store dir at {dir:?} seems to not exist, creating");
            std::fs::create_dir_all(dir)
                .map_err(|e| OpenError::Fatal(format!("failed to create store dir: {e}")))?;
        }
    }

    let blob = match EncryptedBlob::read_file(&path) {
        Ok(blob) => blob,
        Err(BlobError::FileNotFound | BlobError::BadFile(_)) => {
            warn!("kv store missing or corrupt, creating one");
            return first_time_setup(dialog, path);
        }
        Err(e) => return Err(OpenError::Fatal(e.to_string())),
    };

    // Try the empty password first so passwordless stores open silently.
    let mut password = Zeroizing::new(String::new());

    loop {
        match blob.decrypt(&password) {
            Ok(plain) => {
                let Ok(storage) = serde_json::from_slice::<KvStorage>(&plain) else {
                    warn!("kv store decrypted but content is corrupt, recreating");
                    return first_time_setup(dialog, path);
                };
                info!("loaded kv store");
                return Ok(KvStore::new(storage, path, password));
            }
            Err(BlobError::BadPassword) => {
                password = dialog
                    .password_ask()
                    .map_err(|e| OpenError::Unavailable(e.to_string()))?;
            }
            Err(e) => {
                warn!("kv store corrupt ({e}), recreating");
                return first_time_setup(dialog, path);
            }
        }
    }
}

fn first_time_setup(dialog: &dyn Dialog, path: PathBuf) -> Result<KvStore, OpenError> {
    let password = dialog
        .first_time_setup()
        .map_err(|e| OpenError::Unavailable(e.to_string()))?;

    let store = KvStore::new(KvStorage::default(), path, password);
    store.save();
    Ok(store)
}

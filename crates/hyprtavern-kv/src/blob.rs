//! Authenticated-encrypted on-disk container.
//!
//! Layout, fixed:
//!
//! ```text
//! "TAVERNKV" | version byte '1' | salt[16] | iv[12] | ciphertext | tag[16]
//! ```
//!
//! AEAD is AES-256-GCM; the key is PBKDF2-HMAC-SHA256(password, salt,
//! 100 000 iterations, 32 bytes). A GCM tag mismatch is indistinguishable
//! from a wrong password and is reported as [`BlobError::BadPassword`].

use std::fs;
use std::io;
use std::path::Path;

use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Magic prefix of every store file.
pub const BLOB_MAGIC: &[u8; 8] = b"TAVERNKV";
/// Container format version byte.
pub const BLOB_VERSION: u8 = b'1';

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERS: u32 = 100_000;

/// Smallest parseable container: header plus an empty ciphertext.
const MIN_BLOB_LEN: usize = BLOB_MAGIC.len() + 1 + SALT_LEN + IV_LEN + TAG_LEN;

/// Why a container could not be produced or opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobError {
    /// No store file at the given path.
    #[error("store file not found")]
    FileNotFound,

    /// Bad magic, unknown version, or a truncated file.
    #[error("store file corrupt: {0}")]
    BadFile(&'static str),

    /// Authentication failed: wrong password or a tampered store.
    #[error("store authentication failed (bad password or tampered file)")]
    BadPassword,

    /// Anything else (RNG failure, filesystem trouble on write).
    #[error("store error: {0}")]
    Generic(String),
}

impl From<io::Error> for BlobError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Self::FileNotFound
        } else {
            Self::Generic(e.to_string())
        }
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERS, &mut key[..]);
    key
}

/// One sealed container: parsed header fields plus ciphertext.
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    salt: [u8; SALT_LEN],
    iv: [u8; IV_LEN],
    /// Ciphertext with the 16-byte GCM tag appended.
    sealed: Vec<u8>,
}

impl EncryptedBlob {
    /// Encrypt `plaintext` under `password` with a fresh random salt and IV.
    ///
    /// # Errors
    ///
    /// [`BlobError::Generic`] if encryption fails.
    pub fn seal(plaintext: &[u8], password: &str) -> Result<Self, BlobError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let key = derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| BlobError::Generic(e.to_string()))?;

        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| BlobError::Generic(e.to_string()))?;

        Ok(Self { salt, iv, sealed })
    }

    /// Decrypt with `password`.
    ///
    /// # Errors
    ///
    /// [`BlobError::BadPassword`] on tag mismatch, [`BlobError::Generic`]
    /// on other crypto failures.
    pub fn decrypt(&self, password: &str) -> Result<Zeroizing<Vec<u8>>, BlobError> {
        let key = derive_key(password, &self.salt);
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| BlobError::Generic(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(&self.iv), self.sealed.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| BlobError::BadPassword)
    }

    /// Parse a container from raw bytes.
    ///
    /// # Errors
    ///
    /// [`BlobError::BadFile`] on bad magic, unknown version, or truncation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() < MIN_BLOB_LEN {
            return Err(BlobError::BadFile("truncated"));
        }

        let (magic, rest) = bytes.split_at(BLOB_MAGIC.len());
        if magic != BLOB_MAGIC {
            return Err(BlobError::BadFile("invalid magic"));
        }

        let (version, rest) = rest.split_at(1);
        if version[0] != BLOB_VERSION {
            return Err(BlobError::BadFile("invalid version"));
        }

        let (salt, rest) = rest.split_at(SALT_LEN);
        let (iv, sealed) = rest.split_at(IV_LEN);

        // The GCM tag rides at the end of `sealed`; MIN_BLOB_LEN already
        // guaranteed there is room for it.
        Ok(Self {
            salt: salt.try_into().expect("salt length checked"),
            iv: iv.try_into().expect("iv length checked"),
            sealed: sealed.to_vec(),
        })
    }

    /// Serialize the container in the on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_BLOB_LEN + self.sealed.len());
        out.extend_from_slice(BLOB_MAGIC);
        out.push(BLOB_VERSION);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.sealed);
        out
    }

    /// Read and parse a container from `path`.
    ///
    /// # Errors
    ///
    /// [`BlobError::FileNotFound`] when absent, [`BlobError::BadFile`] when
    /// unparseable.
    pub fn read_file(path: &Path) -> Result<Self, BlobError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Write the container to `path`, truncating any previous store.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub fn write_file(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let blob = EncryptedBlob::seal(b"{\"global\":[]}", "hunter2").unwrap();
        let bytes = blob.to_bytes();

        let parsed = EncryptedBlob::from_bytes(&bytes).unwrap();
        let plain = parsed.decrypt("hunter2").unwrap();
        assert_eq!(plain.as_slice(), b"{\"global\":[]}");
    }

    #[test]
    fn empty_password_roundtrip() {
        let blob = EncryptedBlob::seal(b"beer", "").unwrap();
        assert_eq!(blob.decrypt("").unwrap().as_slice(), b"beer");
    }

    #[test]
    fn wrong_password_is_bad_password() {
        let blob = EncryptedBlob::seal(b"secret", "right").unwrap();
        assert_eq!(blob.decrypt("wrong").unwrap_err(), BlobError::BadPassword);
    }

    #[test]
    fn any_flipped_byte_fails_authentication() {
        let blob = EncryptedBlob::seal(b"tamper target", "pw").unwrap();
        let bytes = blob.to_bytes();

        // Every byte past the magic+version header participates in
        // decryption: salt, iv, ciphertext and tag. Flip each one.
        for i in (BLOB_MAGIC.len() + 1)..bytes.len() {
            let mut evil = bytes.clone();
            evil[i] ^= 0x01;
            let parsed = EncryptedBlob::from_bytes(&evil).unwrap();
            assert_eq!(
                parsed.decrypt("pw").unwrap_err(),
                BlobError::BadPassword,
                "byte {i} flipped but decrypt did not fail"
            );
        }
    }

    #[test]
    fn truncation_is_bad_file() {
        let blob = EncryptedBlob::seal(b"x", "pw").unwrap();
        let bytes = blob.to_bytes();

        for len in 0..MIN_BLOB_LEN {
            assert_eq!(
                EncryptedBlob::from_bytes(&bytes[..len]).unwrap_err(),
                BlobError::BadFile("truncated"),
                "length {len} parsed but should not have"
            );
        }
    }

    #[test]
    fn bad_magic_and_version_are_bad_file() {
        let blob = EncryptedBlob::seal(b"x", "pw").unwrap();
        let mut bytes = blob.to_bytes();

        bytes[0] = b'X';
        assert_eq!(
            EncryptedBlob::from_bytes(&bytes).unwrap_err(),
            BlobError::BadFile("invalid magic")
        );

        bytes[0] = b'T';
        bytes[BLOB_MAGIC.len()] = b'2';
        assert_eq!(
            EncryptedBlob::from_bytes(&bytes).unwrap_err(),
            BlobError::BadFile("invalid version")
        );
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            EncryptedBlob::read_file(&dir.path().join("nope.dat")).unwrap_err(),
            BlobError::FileNotFound
        );
    }
}

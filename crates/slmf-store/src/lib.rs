// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only encrypted event store.
//!
//! Selected envelopes are teed here by the broker according to the
//! [`policy::PersistencePolicy`]; scheduled-task definitions and execution
//! records share the same database in their own table group. Payload bytes
//! are encrypted at rest; topics, sources and timestamps stay queryable in
//! the clear.
//!
//! The store is deliberately loss-tolerant: a failed write is logged and
//! counted, and routing continues. Loss of a persisted event is
//! acceptable; loss of routing is not.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod events;
pub mod policy;
pub mod tasks;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use slmf_core::{Coded, FabricCode};
use thiserror::Error;

pub use events::{EventFilter, EventRecord, EventStore};
pub use policy::{Persistence, PersistencePolicy, PersistenceProbe};
pub use tasks::{ExecutionRecord, TaskRecord, TaskStore};

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database-level failure.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// At-rest encryption or decryption failure.
    #[error("store cipher failure: {0}")]
    Cipher(String),

    /// Metadata could not be serialized.
    #[error("metadata serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Coded for StoreError {
    fn code(&self) -> FabricCode {
        FabricCode::StoreWriteFailed
    }
}

/// Where the store lives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// sqlx connection URL.
    pub database_url: String,
}

impl StoreConfig {
    /// A store backed by a file at `path`, created if absent.
    #[must_use]
    pub fn at_path(path: &std::path::Path) -> Self {
        Self {
            database_url: format!("sqlite://{}?mode=rwc", path.display()),
        }
    }

    /// An in-memory store, for tests and ephemeral deployments.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_owned(),
        }
    }
}

/// Symmetric cipher for payloads at rest.
///
/// Stored blobs are `nonce (12) || ciphertext`; the nonce is random per
/// record.
#[derive(Clone)]
pub struct StoreCipher {
    cipher: ChaCha20Poly1305,
}

const NONCE_LEN: usize = 12;

impl StoreCipher {
    /// Derive the at-rest key from 32 bytes of component key material.
    #[must_use]
    pub fn derive(seed: &[u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, seed);
        let mut key = [0u8; 32];
        hk.expand(b"slmf/store-at-rest/v1", &mut key)
            .expect("32 bytes is a valid HKDF output length");
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Cipher("payload encryption failed".into()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub(crate) fn open(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() < NONCE_LEN {
            return Err(StoreError::Cipher("stored blob shorter than nonce".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Cipher("payload authentication failed".into()))
    }
}

impl std::fmt::Debug for StoreCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreCipher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_roundtrip() {
        let cipher = StoreCipher::derive(&[1u8; 32]);
        let blob = cipher.seal(b"payload").unwrap();
        assert_ne!(blob, b"payload");
        assert_eq!(cipher.open(&blob).unwrap(), b"payload");
    }

    #[test]
    fn distinct_seeds_cannot_read_each_other() {
        let a = StoreCipher::derive(&[1u8; 32]);
        let b = StoreCipher::derive(&[2u8; 32]);
        let blob = a.seal(b"payload").unwrap();
        assert!(b.open(&blob).is_err());
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let cipher = StoreCipher::derive(&[3u8; 32]);
        assert!(cipher.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn store_error_maps_to_store_write_failed() {
        let err = StoreError::Cipher("x".into());
        assert_eq!(err.code(), FabricCode::StoreWriteFailed);
    }
}

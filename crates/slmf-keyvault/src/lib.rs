// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic keypair derivation from the master secret.
//!
//! Every component's long-term Curve25519 keypair is a pure function of the
//! master secret and the component identity:
//!
//! ```text
//! seed = Argon2id(master, salt = H(fixed_salt, component_id))
//! (Kpub, Ksec) = x25519_keypair(seed)
//! ```
//!
//! The master secret is supplied once per process by an external provider,
//! held only in memory, and zeroized on drop. Nothing here ever persists or
//! transmits it. When no secret was supplied, every derivation fails with
//! [`KeyVaultError::KeyMaterialUnavailable`]; there is no fallback.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod z85;

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use slmf_core::{Coded, ComponentId, FabricCode, AUTHORIZED_COMPONENTS, BROKER_IDENTITY};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Minimum master secret length in bytes.
pub const MIN_MASTER_SECRET_LEN: usize = 32;

/// Domain-separation constant mixed into every component salt.
const COMPONENT_SALT: &[u8] = b"slmf/component-kdf/v1";

// Argon2id cost parameters for seed derivation. Derivation happens a
// handful of times per process start, so the memory cost can be generous.
const KDF_MEM_KIB: u32 = 19 * 1024;
const KDF_ITERS: u32 = 2;
const KDF_LANES: u32 = 1;

/// Errors from key material handling.
#[derive(Debug, Error)]
pub enum KeyVaultError {
    /// No master secret was supplied to this process.
    #[error("master secret is unavailable")]
    KeyMaterialUnavailable,

    /// The supplied master secret is too short to be credible key material.
    #[error("master secret must be at least {MIN_MASTER_SECRET_LEN} bytes, got {len}")]
    MasterSecretTooShort {
        /// Length that was supplied.
        len: usize,
    },

    /// The KDF itself failed.
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

impl Coded for KeyVaultError {
    fn code(&self) -> FabricCode {
        FabricCode::KeyMaterialUnavailable
    }
}

/// The process-lifetime root secret. Never persisted, never transmitted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    /// Wrap raw secret bytes from the external provider.
    ///
    /// # Errors
    ///
    /// Returns [`KeyVaultError::MasterSecretTooShort`] below 32 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, KeyVaultError> {
        if bytes.len() < MIN_MASTER_SECRET_LEN {
            return Err(KeyVaultError::MasterSecretTooShort { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the bytes.
        f.debug_struct("MasterSecret").field("len", &self.0.len()).finish()
    }
}

/// A derived long-term Curve25519 keypair.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// The public half, as raw bytes.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// The public half in the 40-character Z85 transport encoding.
    #[must_use]
    pub fn public_z85(&self) -> String {
        z85::encode(self.public.as_bytes())
    }

    /// The secret half, for the transport handshake.
    #[must_use]
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// The public half.
    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("public", &self.public_z85()).finish()
    }
}

/// Derives and caches per-component keypairs for one process.
///
/// The in-memory cache lives for the process lifetime only;
/// [`KeyVault::forget_cached`] drops it so a rotated master secret takes
/// effect on the next derivation.
pub struct KeyVault {
    master: Option<MasterSecret>,
    cache: Mutex<BTreeMap<String, Keypair>>,
}

impl KeyVault {
    /// Build a vault holding the supplied master secret.
    #[must_use]
    pub fn new(master: MasterSecret) -> Self {
        Self {
            master: Some(master),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build a vault for a process whose secret provider came up empty.
    ///
    /// Every derivation on a locked vault fails; this exists so startup can
    /// surface [`KeyVaultError::KeyMaterialUnavailable`] through the normal
    /// error path instead of panicking.
    #[must_use]
    pub fn locked() -> Self {
        Self {
            master: None,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether a master secret is present.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.master.is_some()
    }

    /// Derive the keypair for `component_id`.
    ///
    /// Deterministic: the same master secret and identity always produce
    /// the same keypair. Results are cached for the process lifetime.
    ///
    /// # Errors
    ///
    /// Fails with [`KeyVaultError::KeyMaterialUnavailable`] on a locked
    /// vault, or [`KeyVaultError::Derivation`] if the KDF rejects its
    /// parameters.
    pub fn derive(&self, component_id: &ComponentId) -> Result<Keypair, KeyVaultError> {
        {
            let cache = self.cache.lock().expect("keyvault cache lock poisoned");
            if let Some(kp) = cache.get(component_id.as_str()) {
                return Ok(kp.clone());
            }
        }

        let master = self.master.as_ref().ok_or(KeyVaultError::KeyMaterialUnavailable)?;
        let keypair = derive_keypair(master, component_id)?;

        let mut cache = self.cache.lock().expect("keyvault cache lock poisoned");
        cache.insert(component_id.as_str().to_owned(), keypair.clone());
        Ok(keypair)
    }

    /// The broker's public key.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`KeyVault::derive`].
    pub fn broker_identity(&self) -> Result<PublicKey, KeyVaultError> {
        Ok(*self.derive(&ComponentId::broker())?.public())
    }

    /// Public keys of every authorized component, keyed by raw key bytes.
    ///
    /// This is the allow-list the broker checks presented keys against.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`KeyVault::derive`].
    pub fn authorized_client_keys(
        &self,
    ) -> Result<BTreeMap<[u8; 32], ComponentId>, KeyVaultError> {
        let mut keys = BTreeMap::new();
        for component in AUTHORIZED_COMPONENTS {
            if component.identity == BROKER_IDENTITY {
                continue;
            }
            let id = ComponentId::new(component.identity);
            let kp = self.derive(&id)?;
            keys.insert(kp.public_bytes(), id);
        }
        Ok(keys)
    }

    /// Drop every cached keypair.
    ///
    /// Called when the control plane signals a key rotation: the next
    /// derivation re-runs the KDF against whatever master secret the
    /// process now holds.
    pub fn forget_cached(&self) {
        self.cache.lock().expect("keyvault cache lock poisoned").clear();
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

/// Mix the fixed salt and the component identity into a 16-byte KDF salt.
fn salt_for(component_id: &ComponentId) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(COMPONENT_SALT);
    hasher.update([0x00]);
    hasher.update(component_id.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest[..16]);
    salt
}

fn derive_keypair(
    master: &MasterSecret,
    component_id: &ComponentId,
) -> Result<Keypair, KeyVaultError> {
    let params = Params::new(KDF_MEM_KIB, KDF_ITERS, KDF_LANES, Some(32))
        .map_err(|e| KeyVaultError::Derivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = salt_for(component_id);
    let mut seed = [0u8; 32];
    argon
        .hash_password_into(master.expose(), &salt, &mut seed)
        .map_err(|e| KeyVaultError::Derivation(e.to_string()))?;

    let secret = StaticSecret::from(seed);
    let public = PublicKey::from(&secret);
    seed.zeroize();
    Ok(Keypair { secret, public })
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Curve25519 handshake and session key schedule.
//!
//! Both sides exchange a 64-byte hello (`long-term public || ephemeral
//! public`), then derive directional session keys from three
//! Diffie-Hellman results:
//!
//! ```text
//! dh1 = DH(eph_client,    eph_server)      forward secrecy
//! dh2 = DH(static_client, eph_server)      proves the client's identity
//! dh3 = DH(eph_client,    static_server)   proves the server's identity
//! keys = HKDF-SHA256(salt = H(hellos), ikm = dh1 || dh2 || dh3)
//! ```
//!
//! An encrypted confirmation frame in each direction completes the
//! handshake; a peer that cannot produce it never held the static secret
//! it claimed, and the connection dies before any application byte moves.

use crate::TransportError;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Plaintext of the confirmation frame, one per direction.
pub(crate) const CONFIRM: &[u8] = b"slmf/handshake-confirm/v1";

/// One side's 64-byte hello message.
pub(crate) fn hello_bytes(static_public: &PublicKey, ephemeral_public: &PublicKey) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(static_public.as_bytes());
    out[32..].copy_from_slice(ephemeral_public.as_bytes());
    out
}

/// Parse a received hello into `(static, ephemeral)` public keys.
pub(crate) fn parse_hello(bytes: &[u8; 64]) -> (PublicKey, PublicKey) {
    let mut static_raw = [0u8; 32];
    let mut eph_raw = [0u8; 32];
    static_raw.copy_from_slice(&bytes[..32]);
    eph_raw.copy_from_slice(&bytes[32..]);
    (PublicKey::from(static_raw), PublicKey::from(eph_raw))
}

/// Directional session keys. The client sends with `client_to_server` and
/// receives with `server_to_client`; the server does the opposite.
pub(crate) struct SessionKeys {
    pub client_to_server: [u8; 32],
    pub server_to_client: [u8; 32],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.client_to_server.zeroize();
        self.server_to_client.zeroize();
    }
}

/// Derive session keys on the client side.
pub(crate) fn client_session_keys(
    client_static: &StaticSecret,
    client_ephemeral: StaticSecret,
    server_static_public: &PublicKey,
    server_ephemeral_public: &PublicKey,
    client_hello: &[u8; 64],
    server_hello: &[u8; 64],
) -> Result<SessionKeys, TransportError> {
    let dh1 = client_ephemeral.diffie_hellman(server_ephemeral_public);
    let dh2 = client_static.diffie_hellman(server_ephemeral_public);
    let dh3 = client_ephemeral.diffie_hellman(server_static_public);
    derive_keys(dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), client_hello, server_hello)
}

/// Derive session keys on the server side.
pub(crate) fn server_session_keys(
    server_static: &StaticSecret,
    server_ephemeral: StaticSecret,
    client_static_public: &PublicKey,
    client_ephemeral_public: &PublicKey,
    client_hello: &[u8; 64],
    server_hello: &[u8; 64],
) -> Result<SessionKeys, TransportError> {
    let dh1 = server_ephemeral.diffie_hellman(client_ephemeral_public);
    let dh2 = server_ephemeral.diffie_hellman(client_static_public);
    let dh3 = server_static.diffie_hellman(client_ephemeral_public);
    derive_keys(dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), client_hello, server_hello)
}

fn derive_keys(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    client_hello: &[u8; 64],
    server_hello: &[u8; 64],
) -> Result<SessionKeys, TransportError> {
    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(dh1);
    ikm[32..64].copy_from_slice(dh2);
    ikm[64..].copy_from_slice(dh3);

    // The transcript hash binds the keys to these exact hello messages.
    let mut transcript = Sha256::new();
    transcript.update(client_hello);
    transcript.update(server_hello);
    let salt = transcript.finalize();

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut client_to_server = [0u8; 32];
    let mut server_to_client = [0u8; 32];
    hk.expand(b"slmf/c2s/v1", &mut client_to_server)
        .map_err(|_| TransportError::crypto("HKDF expand failed"))?;
    hk.expand(b"slmf/s2c/v1", &mut server_to_client)
        .map_err(|_| TransportError::crypto("HKDF expand failed"))?;
    ikm.zeroize();

    Ok(SessionKeys { client_to_server, server_to_client })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn both_sides_derive_identical_keys() {
        let (client_static, client_static_pub) = keypair();
        let (server_static, server_static_pub) = keypair();
        let (client_eph, client_eph_pub) = keypair();
        let (server_eph, server_eph_pub) = keypair();

        let ch = hello_bytes(&client_static_pub, &client_eph_pub);
        let sh = hello_bytes(&server_static_pub, &server_eph_pub);

        let client = client_session_keys(
            &client_static, client_eph, &server_static_pub, &server_eph_pub, &ch, &sh,
        )
        .unwrap();
        let server = server_session_keys(
            &server_static, server_eph, &client_static_pub, &client_eph_pub, &ch, &sh,
        )
        .unwrap();

        assert_eq!(client.client_to_server, server.client_to_server);
        assert_eq!(client.server_to_client, server.server_to_client);
        assert_ne!(client.client_to_server, client.server_to_client);
    }

    #[test]
    fn impostor_server_derives_different_keys() {
        let (client_static, client_static_pub) = keypair();
        let (_real_server_static, real_server_static_pub) = keypair();
        let (impostor_static, _) = keypair();
        let (client_eph, client_eph_pub) = keypair();
        let (server_eph, server_eph_pub) = keypair();

        // The impostor presents the real server's public key in its hello
        // but only holds its own static secret.
        let ch = hello_bytes(&client_static_pub, &client_eph_pub);
        let sh = hello_bytes(&real_server_static_pub, &server_eph_pub);

        let client = client_session_keys(
            &client_static, client_eph, &real_server_static_pub, &server_eph_pub, &ch, &sh,
        )
        .unwrap();
        let impostor = server_session_keys(
            &impostor_static, server_eph, &client_static_pub, &client_eph_pub, &ch, &sh,
        )
        .unwrap();

        // dh3 differs, so the key schedules diverge and the confirmation
        // frames can never authenticate.
        assert_ne!(client.client_to_server, impostor.client_to_server);
    }

    #[test]
    fn hello_roundtrip() {
        let (_, a) = keypair();
        let (_, b) = keypair();
        let hello = hello_bytes(&a, &b);
        let (pa, pb) = parse_hello(&hello);
        assert_eq!(pa, a);
        assert_eq!(pb, b);
    }
}

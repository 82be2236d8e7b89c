// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secure connection establishment and the stream handle.

use crate::frame::{FrameOpener, FrameSealer};
use crate::handshake::{
    client_session_keys, hello_bytes, parse_hello, server_session_keys, CONFIRM,
};
use crate::{TransportConfig, TransportError};
use rand::rngs::OsRng;
use slmf_core::ComponentId;
use slmf_keyvault::{z85, Keypair};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};

/// Allow-list mapping raw public keys to component identities.
pub type AuthorizedKeys = Arc<BTreeMap<[u8; 32], ComponentId>>;

/// Receiving half of a [`SecureStream`].
#[derive(Debug)]
pub struct SecureReader {
    io: OwnedReadHalf,
    opener: FrameOpener,
}

impl SecureReader {
    /// Receive and open the next frame.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionClosed`] on clean EOF; authentication
    /// and size failures otherwise.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        self.opener.read_frame(&mut self.io).await
    }
}

/// Sending half of a [`SecureStream`].
#[derive(Debug)]
pub struct SecureWriter {
    io: OwnedWriteHalf,
    sealer: FrameSealer,
}

impl SecureWriter {
    /// Seal and send one frame.
    ///
    /// # Errors
    ///
    /// Propagates socket and sealing failures.
    pub async fn send_frame(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        self.sealer.write_frame(&mut self.io, plaintext).await
    }

    /// Flush and close the sending direction.
    ///
    /// # Errors
    ///
    /// Propagates socket shutdown failures.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// An established, mutually authenticated connection.
///
/// Constructed only by [`SecureStream::connect`] or
/// [`SecureListener::accept`]; there is no way to obtain one without a
/// completed handshake.
#[derive(Debug)]
pub struct SecureStream {
    reader: SecureReader,
    writer: SecureWriter,
    peer_static: PublicKey,
}

impl SecureStream {
    /// Connect to `addr` and run the client side of the handshake.
    ///
    /// `expected_peer` is the public key the server must prove possession
    /// of; anything else aborts the handshake.
    ///
    /// # Errors
    ///
    /// [`TransportError::HandshakeTimeout`] past the configured deadline,
    /// [`TransportError::SecurityInitializationFailed`] on any crypto or
    /// identity mismatch, I/O errors otherwise.
    pub async fn connect(
        addr: SocketAddr,
        identity: &Keypair,
        expected_peer: &PublicKey,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        timeout(
            config.handshake_timeout,
            Self::client_handshake(stream, identity, expected_peer, config),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
    }

    async fn client_handshake(
        stream: TcpStream,
        identity: &Keypair,
        expected_peer: &PublicKey,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let client_hello = hello_bytes(identity.public(), &ephemeral_public);
        write_half.write_all(&client_hello).await?;

        let mut server_hello = [0u8; 64];
        read_half.read_exact(&mut server_hello).await?;
        let (server_static_pub, server_ephemeral_pub) = parse_hello(&server_hello);

        if server_static_pub != *expected_peer {
            return Err(TransportError::crypto("peer presented an unexpected identity key"));
        }

        let keys = client_session_keys(
            identity.secret(),
            ephemeral,
            &server_static_pub,
            &server_ephemeral_pub,
            &client_hello,
            &server_hello,
        )?;

        let mut sealer = FrameSealer::new(&keys.client_to_server, config.max_frame_bytes);
        let mut opener = FrameOpener::new(&keys.server_to_client, config.max_frame_bytes);

        // Confirm both directions before any application byte moves.
        sealer.write_frame(&mut write_half, CONFIRM).await?;
        let confirm = opener.read_frame(&mut read_half).await?;
        if confirm != CONFIRM {
            return Err(TransportError::crypto("peer confirmation mismatch"));
        }

        Ok(Self {
            reader: SecureReader { io: read_half, opener },
            writer: SecureWriter { io: write_half, sealer },
            peer_static: server_static_pub,
        })
    }

    /// The peer's long-term public key.
    #[must_use]
    pub fn peer_public(&self) -> &PublicKey {
        &self.peer_static
    }

    /// Receive and open the next frame.
    ///
    /// # Errors
    ///
    /// See [`SecureReader::recv_frame`].
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        self.reader.recv_frame().await
    }

    /// Seal and send one frame.
    ///
    /// # Errors
    ///
    /// See [`SecureWriter::send_frame`].
    pub async fn send_frame(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        self.writer.send_frame(plaintext).await
    }

    /// Split into independently owned read and write halves.
    #[must_use]
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

/// Listening socket that only ever yields authenticated streams.
pub struct SecureListener {
    listener: TcpListener,
    identity: Keypair,
    authorized: AuthorizedKeys,
    config: TransportConfig,
}

impl SecureListener {
    /// Bind to `addr` with the given identity and allow-list.
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub async fn bind(
        addr: SocketAddr,
        identity: Keypair,
        authorized: AuthorizedKeys,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, identity, authorized, config })
    }

    /// The bound local address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Propagates socket introspection failures.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and run the server side of the handshake.
    ///
    /// An unauthorized peer is dropped with nothing sent back and surfaces
    /// as [`TransportError::UnauthorizedPeer`]; the caller decides how to
    /// record the event. Errors here never poison the listener; keep
    /// calling `accept`.
    ///
    /// # Errors
    ///
    /// Handshake, authorization and I/O failures for this one connection.
    pub async fn accept(&self) -> Result<(SecureStream, ComponentId), TransportError> {
        let (stream, remote) = self.listener.accept().await?;
        let result = timeout(self.config.handshake_timeout, self.server_handshake(stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?;
        if let Err(TransportError::UnauthorizedPeer { peer_z85 }) = &result {
            warn!(target: "slmf::security", %remote, peer = %peer_z85, "rejected unauthorized peer");
        }
        result
    }

    async fn server_handshake(
        &self,
        stream: TcpStream,
    ) -> Result<(SecureStream, ComponentId), TransportError> {
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let mut client_hello = [0u8; 64];
        read_half.read_exact(&mut client_hello).await?;
        let (client_static_pub, client_ephemeral_pub) = parse_hello(&client_hello);

        // Fail-secure: an unknown key gets nothing back, not even a hello.
        let Some(peer_identity) = self.authorized.get(client_static_pub.as_bytes()) else {
            return Err(TransportError::UnauthorizedPeer {
                peer_z85: z85::encode(client_static_pub.as_bytes()),
            });
        };

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let server_hello = hello_bytes(self.identity.public(), &ephemeral_public);
        write_half.write_all(&server_hello).await?;

        let keys = server_session_keys(
            self.identity.secret(),
            ephemeral,
            &client_static_pub,
            &client_ephemeral_pub,
            &client_hello,
            &server_hello,
        )?;

        let mut opener = FrameOpener::new(&keys.client_to_server, self.config.max_frame_bytes);
        let mut sealer = FrameSealer::new(&keys.server_to_client, self.config.max_frame_bytes);

        let confirm = opener.read_frame(&mut read_half).await?;
        if confirm != CONFIRM {
            return Err(TransportError::crypto("peer confirmation mismatch"));
        }
        sealer.write_frame(&mut write_half, CONFIRM).await?;

        Ok((
            SecureStream {
                reader: SecureReader { io: read_half, opener },
                writer: SecureWriter { io: write_half, sealer },
                peer_static: client_static_pub,
            },
            peer_identity.clone(),
        ))
    }
}

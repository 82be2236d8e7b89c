// SPDX-License-Identifier: MIT OR Apache-2.0
//! Authenticated, encrypted socket framing.
//!
//! Every fabric connection is a TCP stream wrapped in a mutually
//! authenticated Curve25519 handshake and per-direction ChaCha20-Poly1305
//! framing. There is no plaintext mode: the only way to obtain a
//! [`SecureStream`] is through a completed handshake, and any failure along
//! the way tears the connection down with
//! [`TransportError::SecurityInitializationFailed`].
//!
//! What this layer does not hide: topic names are visible to the broker
//! process (it routes on them after decryption), and message timing and
//! sizes are observable on the wire.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod frame;
mod handshake;
mod stream;

pub use stream::{AuthorizedKeys, SecureListener, SecureReader, SecureStream, SecureWriter};

use slmf_core::{Coded, FabricCode};
use std::time::Duration;
use thiserror::Error;

/// Hard cap on a single encrypted frame. Generous enough for the largest
/// permitted envelope plus AEAD overhead.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Tunables for one side of a connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on a received or sent frame, ciphertext included.
    pub max_frame_bytes: usize,
    /// Deadline for the whole handshake, both directions.
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer's long-term key is not in the allow-list.
    ///
    /// The connection is closed with nothing sent back; the peer learns
    /// only that the socket went away.
    #[error("unauthorized peer key {peer_z85}")]
    UnauthorizedPeer {
        /// Z85 encoding of the rejected key, for the security log.
        peer_z85: String,
    },

    /// Handshake or cryptographic failure. Fatal for the connection.
    #[error("security initialization failed: {reason}")]
    SecurityInitializationFailed {
        /// What went wrong, for diagnostics only.
        reason: String,
    },

    /// The handshake did not complete within the configured deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A frame exceeded the configured cap.
    #[error("frame of {size} bytes exceeds the {max} byte cap")]
    FrameTooLarge {
        /// Observed frame size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl TransportError {
    pub(crate) fn crypto(reason: impl Into<String>) -> Self {
        Self::SecurityInitializationFailed { reason: reason.into() }
    }
}

impl Coded for TransportError {
    fn code(&self) -> FabricCode {
        match self {
            Self::UnauthorizedPeer { .. } => FabricCode::UnauthorizedPeer,
            Self::HandshakeTimeout => FabricCode::Timeout,
            Self::FrameTooLarge { .. } => FabricCode::SchemaError,
            Self::Io(_) | Self::SecurityInitializationFailed { .. } | Self::ConnectionClosed => {
                FabricCode::SecurityInitializationFailed
            }
        }
    }
}

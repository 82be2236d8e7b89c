// SPDX-License-Identifier: MIT OR Apache-2.0
//! AEAD-sealed length-prefixed frames.
//!
//! Wire layout per frame: `[ len: u32 be ][ ciphertext (len bytes) ]` where
//! ciphertext = ChaCha20-Poly1305(key, nonce = frame counter, plaintext).
//! Each direction of a connection has its own key and its own counter, so
//! nonces never repeat and a reflected frame can never decrypt.

use crate::TransportError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sealing half of one direction.
pub(crate) struct FrameSealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
    max_frame_bytes: usize,
}

impl std::fmt::Debug for FrameSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSealer")
            .field("counter", &self.counter)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish()
    }
}

impl FrameSealer {
    pub(crate) fn new(key: &[u8; 32], max_frame_bytes: usize) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
            max_frame_bytes,
        }
    }

    /// Seal `plaintext` and write it to `io` as one frame.
    pub(crate) async fn write_frame<W>(
        &mut self,
        io: &mut W,
        plaintext: &[u8],
    ) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let nonce = nonce_for(self.counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransportError::crypto("frame encryption failed"))?;
        if ciphertext.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: ciphertext.len(),
                max: self.max_frame_bytes,
            });
        }
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| TransportError::crypto("frame counter exhausted"))?;
        io.write_all(&(ciphertext.len() as u32).to_be_bytes()).await?;
        io.write_all(&ciphertext).await?;
        io.flush().await?;
        Ok(())
    }
}

/// Opening half of one direction.
pub(crate) struct FrameOpener {
    cipher: ChaCha20Poly1305,
    counter: u64,
    max_frame_bytes: usize,
}

impl std::fmt::Debug for FrameOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameOpener")
            .field("counter", &self.counter)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish()
    }
}

impl FrameOpener {
    pub(crate) fn new(key: &[u8; 32], max_frame_bytes: usize) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
            max_frame_bytes,
        }
    }

    /// Read one frame from `io` and open it.
    ///
    /// Returns [`TransportError::ConnectionClosed`] on a clean EOF at a
    /// frame boundary.
    pub(crate) async fn read_frame<R>(&mut self, io: &mut R) -> Result<Vec<u8>, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match io.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }
        let mut ciphertext = vec![0u8; len];
        io.read_exact(&mut ciphertext).await?;

        let nonce = nonce_for(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| TransportError::crypto("frame authentication failed"))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| TransportError::crypto("frame counter exhausted"))?;
        Ok(plaintext)
    }
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! Z85 armoring of 32-byte keys (ZeroMQ RFC 32 alphabet).
//!
//! Encodes 4-byte groups as 5 printable characters, so a 32-byte key is
//! always 40 characters. Input length must be a multiple of 4; key material
//! always is.

use thiserror::Error;

const ALPHABET: &[u8; 85] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

/// Z85 decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Z85Error {
    /// Encoded length must be a multiple of 5.
    #[error("z85 string length {0} is not a multiple of 5")]
    BadLength(usize),
    /// A character outside the Z85 alphabet.
    #[error("invalid z85 character {0:?}")]
    BadCharacter(char),
}

/// Encode bytes whose length is a multiple of 4.
///
/// # Panics
///
/// Debug-asserts the length contract; callers in this crate only pass
/// 32-byte keys.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    debug_assert!(bytes.len() % 4 == 0, "z85 input must be 4-byte aligned");
    let mut out = String::with_capacity(bytes.len() / 4 * 5);
    for chunk in bytes.chunks_exact(4) {
        let mut value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;
        let mut group = [0u8; 5];
        for slot in group.iter_mut().rev() {
            *slot = ALPHABET[(value % 85) as usize];
            value /= 85;
        }
        out.push_str(std::str::from_utf8(&group).expect("alphabet is ascii"));
    }
    out
}

/// Decode a Z85 string back into bytes.
///
/// # Errors
///
/// Returns [`Z85Error`] on a misaligned length or a character outside the
/// alphabet.
pub fn decode(encoded: &str) -> Result<Vec<u8>, Z85Error> {
    if encoded.len() % 5 != 0 {
        return Err(Z85Error::BadLength(encoded.len()));
    }
    let mut out = Vec::with_capacity(encoded.len() / 5 * 4);
    for group in encoded.as_bytes().chunks_exact(5) {
        let mut value: u64 = 0;
        for &ch in group {
            let digit = ALPHABET
                .iter()
                .position(|&a| a == ch)
                .ok_or(Z85Error::BadCharacter(ch as char))?;
            value = value * 85 + digit as u64;
        }
        out.extend_from_slice(&(value as u32).to_be_bytes());
    }
    Ok(out)
}

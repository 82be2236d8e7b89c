// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subscription-filter control frames.
//!
//! On the broker's backend endpoint the client-to-broker direction only
//! ever carries these tiny records: install or remove one byte-prefix
//! filter. Data (envelope) frames flow the other way.

use crate::SchemaError;

const OP_SUBSCRIBE: u8 = 0x01;
const OP_UNSUBSCRIBE: u8 = 0x02;

/// A transport-filter change requested by a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    /// Deliver every envelope whose topic starts with this byte prefix.
    /// The empty prefix matches everything.
    Subscribe(Vec<u8>),
    /// Remove a previously installed prefix.
    Unsubscribe(Vec<u8>),
}

impl FilterOp {
    /// Encode as a one-byte opcode followed by the prefix bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (op, prefix) = match self {
            Self::Subscribe(p) => (OP_SUBSCRIBE, p),
            Self::Unsubscribe(p) => (OP_UNSUBSCRIBE, p),
        };
        let mut out = Vec::with_capacity(1 + prefix.len());
        out.push(op);
        out.extend_from_slice(prefix);
        out
    }

    /// Decode a control frame.
    ///
    /// # Errors
    ///
    /// [`SchemaError::Truncated`] on an empty frame,
    /// [`SchemaError::UnknownRequiredField`] on an unknown opcode.
    pub fn decode(bytes: &[u8]) -> Result<Self, SchemaError> {
        let (&op, prefix) = bytes.split_first().ok_or(SchemaError::Truncated)?;
        match op {
            OP_SUBSCRIBE => Ok(Self::Subscribe(prefix.to_vec())),
            OP_UNSUBSCRIBE => Ok(Self::Unsubscribe(prefix.to_vec())),
            other => Err(SchemaError::UnknownRequiredField { tag: other }),
        }
    }
}

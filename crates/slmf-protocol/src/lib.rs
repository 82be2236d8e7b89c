// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire format for fabric messages.
//!
//! Every message crossing the fabric is an [`Envelope`]: a small set of
//! required metadata fields plus an opaque payload, packed into a
//! length-prefixed, field-tagged binary record by [`codec::BinaryCodec`].
//! Payload bytes are never interpreted here; resolving
//! [`Envelope::payload_type_url`] is the subscriber's concern.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod codec;
pub mod registry;
pub mod subfilter;

use chrono::{DateTime, TimeZone, Utc};
use slmf_core::{Coded, ComponentId, FabricCode, Topic, TopicError};
use thiserror::Error;
use uuid::Uuid;

pub use builder::EnvelopeBuilder;
pub use codec::BinaryCodec;
pub use registry::SchemaRegistry;
pub use subfilter::FilterOp;

/// Current codec version written into every encoded envelope.
pub const CODEC_VERSION: u16 = 1;

/// Oldest codec version this build can still decode.
pub const MIN_CODEC_VERSION: u16 = 1;

/// Hard cap on the encoded size of a single envelope, enforced before
/// encryption. Ten mebibytes.
pub const MAX_ENVELOPE_BYTES: usize = 10 * 1024 * 1024;

/// An unknown optional field carried through decode and re-emitted on
/// encode, so newer peers' additions survive a hop through this build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionField {
    /// Field tag, always in the optional range (`0x40..`).
    pub tag: u8,
    /// Raw field bytes, not interpreted.
    pub bytes: Vec<u8>,
}

/// The fabric message envelope.
///
/// Field semantics:
/// - `message_id` is unique for the lifetime of the publisher.
/// - `timestamp_utc_ms` is informational; routing never consults it.
/// - `topic` is canonical (see [`slmf_core::Topic`]); the broker forwards
///   it verbatim, so the topic at delivery equals the topic at publish.
/// - `schema_version` is monotonically non-decreasing per topic, enforced
///   by [`SchemaRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Unique id of this publish.
    pub message_id: Uuid,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp_utc_ms: u64,
    /// Identity of the publishing component.
    pub source: ComponentId,
    /// Canonical topic this envelope was published on.
    pub topic: Topic,
    /// Version of the payload schema.
    pub schema_version: u32,
    /// Identifier of the payload schema (e.g. `aico.conversation.UserInput`).
    pub payload_type_url: String,
    /// Opaque payload bytes, encoded per `payload_type_url`.
    pub payload: Vec<u8>,
    /// Links a reply to its request.
    pub correlation_id: Option<Uuid>,
    /// End-to-end trace id.
    pub trace_id: Option<Uuid>,
    /// Unknown optional fields preserved for forward compatibility.
    pub extensions: Vec<ExtensionField>,
}

impl Envelope {
    /// The timestamp as a `chrono` instant (millisecond precision).
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_utc_ms as i64)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Envelope malformation and canonical-form violations.
///
/// Per the delivery contract these are dropped and logged at WARNING; they
/// are never propagated to subscriber handlers.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A required field was absent from the record.
    #[error("missing required field: {field}")]
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },

    /// A field appeared more than once.
    #[error("duplicate field: {field}")]
    DuplicateField {
        /// Name of the repeated field.
        field: &'static str,
    },

    /// A fixed-width field had the wrong length.
    #[error("field {field} has length {actual}, expected {expected}")]
    FieldLength {
        /// Name of the field.
        field: &'static str,
        /// Required byte length.
        expected: usize,
        /// Byte length found on the wire.
        actual: usize,
    },

    /// The record did not start with the envelope magic.
    #[error("bad envelope magic")]
    BadMagic,

    /// The codec version is below the minimum this build supports.
    #[error("unsupported codec version {version} (minimum {min})", min = MIN_CODEC_VERSION)]
    UnsupportedCodecVersion {
        /// Version found on the wire.
        version: u16,
    },

    /// An unrecognized tag in the required range.
    #[error("unknown required field tag {tag:#04x}")]
    UnknownRequiredField {
        /// The offending tag.
        tag: u8,
    },

    /// The record ended mid-field.
    #[error("truncated envelope")]
    Truncated,

    /// A field was not valid UTF-8.
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Name of the field.
        field: &'static str,
    },

    /// The topic violated canonical form.
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// The encoded envelope exceeds [`MAX_ENVELOPE_BYTES`].
    #[error("envelope of {size} bytes exceeds the {max} byte cap")]
    TooLarge {
        /// Encoded size that was attempted.
        size: usize,
        /// The enforced cap.
        max: usize,
    },
}

impl SchemaError {
    /// Short stable reason string carried in error replies and logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::DuplicateField { .. } => "duplicate_field",
            Self::FieldLength { .. } => "field_length",
            Self::BadMagic => "bad_magic",
            Self::UnsupportedCodecVersion { .. } => "unsupported_codec_version",
            Self::UnknownRequiredField { .. } => "unknown_required_field",
            Self::Truncated => "truncated",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::Topic(_) => "non_canonical_topic",
            Self::TooLarge { .. } => "too_large",
        }
    }
}

impl Coded for SchemaError {
    fn code(&self) -> FabricCode {
        FabricCode::SchemaError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_accessor_is_millisecond_precise() {
        let env = EnvelopeBuilder::new(
            ComponentId::new("message_bus_client_cli"),
            Topic::parse("system/health").unwrap(),
        )
        .payload("aico.system.Health", b"{}".to_vec())
        .build();
        assert_eq!(env.timestamp().timestamp_millis() as u64, env.timestamp_utc_ms);
    }

    #[test]
    fn too_large_reason_is_stable() {
        let err = SchemaError::TooLarge { size: 11, max: 10 };
        assert_eq!(err.reason(), "too_large");
        assert_eq!(err.code(), FabricCode::SchemaError);
    }
}

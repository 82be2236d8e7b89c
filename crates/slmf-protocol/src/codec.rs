// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-prefixed, field-tagged binary encoding of [`Envelope`]s.
//!
//! Record layout:
//!
//! ```text
//! [ Magic: "SLMF" (4) ]
//! [ Codec version: u16 be (2) ]
//! [ Field ]*            where Field = [ tag: u8 ][ len: u32 be ][ bytes ]
//! ```
//!
//! Tags below [`OPTIONAL_TAG_BASE`] are required-range: an unrecognized one
//! means the record needs semantics this build does not have, so decoding
//! fails. Tags at or above it are optional-range: unrecognized ones are
//! retained verbatim as [`ExtensionField`]s and re-emitted on encode, which
//! is what lets optional fields added by a newer peer survive a round trip
//! through an older one.

use crate::{
    Envelope, ExtensionField, SchemaError, CODEC_VERSION, MAX_ENVELOPE_BYTES, MIN_CODEC_VERSION,
};
use slmf_core::{ComponentId, Topic};
use uuid::Uuid;

const MAGIC: &[u8; 4] = b"SLMF";

/// First tag of the optional range.
pub const OPTIONAL_TAG_BASE: u8 = 0x40;

// Required-range tags.
const TAG_MESSAGE_ID: u8 = 0x01;
const TAG_TIMESTAMP: u8 = 0x02;
const TAG_SOURCE: u8 = 0x03;
const TAG_TOPIC: u8 = 0x04;
const TAG_SCHEMA_VERSION: u8 = 0x05;
const TAG_PAYLOAD_TYPE_URL: u8 = 0x06;
const TAG_PAYLOAD: u8 = 0x07;

// Known optional-range tags.
const TAG_CORRELATION_ID: u8 = 0x41;
const TAG_TRACE_ID: u8 = 0x42;

/// Stateless encoder/decoder for [`Envelope`] records.
#[derive(Debug, Clone, Copy)]
pub struct BinaryCodec;

impl BinaryCodec {
    /// Encode an envelope into a self-contained binary record.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::TooLarge`] when the encoded record would
    /// exceed [`MAX_ENVELOPE_BYTES`]. This check runs before any
    /// encryption, so an oversized publish never reaches a socket.
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, SchemaError> {
        let mut out = Vec::with_capacity(64 + envelope.payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&CODEC_VERSION.to_be_bytes());

        put_field(&mut out, TAG_MESSAGE_ID, envelope.message_id.as_bytes());
        put_field(&mut out, TAG_TIMESTAMP, &envelope.timestamp_utc_ms.to_be_bytes());
        put_field(&mut out, TAG_SOURCE, envelope.source.as_str().as_bytes());
        put_field(&mut out, TAG_TOPIC, envelope.topic.as_bytes());
        put_field(&mut out, TAG_SCHEMA_VERSION, &envelope.schema_version.to_be_bytes());
        put_field(&mut out, TAG_PAYLOAD_TYPE_URL, envelope.payload_type_url.as_bytes());
        put_field(&mut out, TAG_PAYLOAD, &envelope.payload);

        if let Some(id) = envelope.correlation_id {
            put_field(&mut out, TAG_CORRELATION_ID, id.as_bytes());
        }
        if let Some(id) = envelope.trace_id {
            put_field(&mut out, TAG_TRACE_ID, id.as_bytes());
        }
        for ext in &envelope.extensions {
            put_field(&mut out, ext.tag, &ext.bytes);
        }

        if out.len() > MAX_ENVELOPE_BYTES {
            return Err(SchemaError::TooLarge {
                size: out.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }
        Ok(out)
    }

    /// Decode a binary record produced by [`BinaryCodec::encode`] (possibly
    /// by a newer peer).
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] describing the first structural problem:
    /// bad magic, unsupported codec version, truncation, duplicate or
    /// missing required fields, an unknown required-range tag, or a
    /// non-canonical topic.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, SchemaError> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(SchemaError::TooLarge {
                size: bytes.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }
        if bytes.len() < 6 {
            return Err(SchemaError::Truncated);
        }
        if &bytes[..4] != MAGIC {
            return Err(SchemaError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version < MIN_CODEC_VERSION {
            return Err(SchemaError::UnsupportedCodecVersion { version });
        }

        let mut message_id: Option<Uuid> = None;
        let mut timestamp_utc_ms: Option<u64> = None;
        let mut source: Option<ComponentId> = None;
        let mut topic: Option<Topic> = None;
        let mut schema_version: Option<u32> = None;
        let mut payload_type_url: Option<String> = None;
        let mut payload: Option<Vec<u8>> = None;
        let mut correlation_id: Option<Uuid> = None;
        let mut trace_id: Option<Uuid> = None;
        let mut extensions: Vec<ExtensionField> = Vec::new();

        let mut cursor = &bytes[6..];
        while !cursor.is_empty() {
            if cursor.len() < 5 {
                return Err(SchemaError::Truncated);
            }
            let tag = cursor[0];
            let len = u32::from_be_bytes([cursor[1], cursor[2], cursor[3], cursor[4]]) as usize;
            cursor = &cursor[5..];
            if cursor.len() < len {
                return Err(SchemaError::Truncated);
            }
            let (field, rest) = cursor.split_at(len);
            cursor = rest;

            match tag {
                TAG_MESSAGE_ID => {
                    set_once(&mut message_id, parse_uuid("message_id", field)?, "message_id")?;
                }
                TAG_TIMESTAMP => {
                    let raw = fixed::<8>("timestamp_utc_ms", field)?;
                    set_once(
                        &mut timestamp_utc_ms,
                        u64::from_be_bytes(raw),
                        "timestamp_utc_ms",
                    )?;
                }
                TAG_SOURCE => {
                    let s = utf8("source", field)?;
                    set_once(&mut source, ComponentId::new(s), "source")?;
                }
                TAG_TOPIC => {
                    let s = utf8("topic", field)?;
                    set_once(&mut topic, Topic::parse(&s)?, "topic")?;
                }
                TAG_SCHEMA_VERSION => {
                    let raw = fixed::<4>("schema_version", field)?;
                    set_once(&mut schema_version, u32::from_be_bytes(raw), "schema_version")?;
                }
                TAG_PAYLOAD_TYPE_URL => {
                    let s = utf8("payload_type_url", field)?;
                    set_once(&mut payload_type_url, s, "payload_type_url")?;
                }
                TAG_PAYLOAD => {
                    set_once(&mut payload, field.to_vec(), "payload")?;
                }
                TAG_CORRELATION_ID => {
                    set_once(
                        &mut correlation_id,
                        parse_uuid("correlation_id", field)?,
                        "correlation_id",
                    )?;
                }
                TAG_TRACE_ID => {
                    set_once(&mut trace_id, parse_uuid("trace_id", field)?, "trace_id")?;
                }
                t if t >= OPTIONAL_TAG_BASE => {
                    extensions.push(ExtensionField {
                        tag: t,
                        bytes: field.to_vec(),
                    });
                }
                t => return Err(SchemaError::UnknownRequiredField { tag: t }),
            }
        }

        Ok(Envelope {
            message_id: require(message_id, "message_id")?,
            timestamp_utc_ms: require(timestamp_utc_ms, "timestamp_utc_ms")?,
            source: require(source, "source")?,
            topic: require(topic, "topic")?,
            schema_version: require(schema_version, "schema_version")?,
            payload_type_url: require(payload_type_url, "payload_type_url")?,
            payload: require(payload, "payload")?,
            correlation_id,
            trace_id,
            extensions,
        })
    }

    /// Read just the topic out of an encoded record without a full decode.
    ///
    /// The broker routes on this; it must stay cheap and must not touch the
    /// payload field.
    ///
    /// # Errors
    ///
    /// Fails with the same structural errors as [`BinaryCodec::decode`],
    /// or [`SchemaError::MissingField`] if no topic field is present.
    pub fn peek_topic(bytes: &[u8]) -> Result<Topic, SchemaError> {
        if bytes.len() < 6 {
            return Err(SchemaError::Truncated);
        }
        if &bytes[..4] != MAGIC {
            return Err(SchemaError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version < MIN_CODEC_VERSION {
            return Err(SchemaError::UnsupportedCodecVersion { version });
        }
        let mut cursor = &bytes[6..];
        while !cursor.is_empty() {
            if cursor.len() < 5 {
                return Err(SchemaError::Truncated);
            }
            let tag = cursor[0];
            let len = u32::from_be_bytes([cursor[1], cursor[2], cursor[3], cursor[4]]) as usize;
            cursor = &cursor[5..];
            if cursor.len() < len {
                return Err(SchemaError::Truncated);
            }
            let (field, rest) = cursor.split_at(len);
            if tag == TAG_TOPIC {
                let s = utf8("topic", field)?;
                return Ok(Topic::parse(&s)?);
            }
            cursor = rest;
        }
        Err(SchemaError::MissingField { field: "topic" })
    }
}

fn put_field(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<(), SchemaError> {
    if slot.is_some() {
        return Err(SchemaError::DuplicateField { field });
    }
    *slot = Some(value);
    Ok(())
}

fn require<T>(slot: Option<T>, field: &'static str) -> Result<T, SchemaError> {
    slot.ok_or(SchemaError::MissingField { field })
}

fn fixed<const N: usize>(field: &'static str, bytes: &[u8]) -> Result<[u8; N], SchemaError> {
    bytes.try_into().map_err(|_| SchemaError::FieldLength {
        field,
        expected: N,
        actual: bytes.len(),
    })
}

fn parse_uuid(field: &'static str, bytes: &[u8]) -> Result<Uuid, SchemaError> {
    let raw: [u8; 16] = fixed(field, bytes)?;
    Ok(Uuid::from_bytes(raw))
}

fn utf8(field: &'static str, bytes: &[u8]) -> Result<String, SchemaError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| SchemaError::InvalidUtf8 { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnvelopeBuilder;
    use proptest::prelude::*;

    fn sample() -> Envelope {
        EnvelopeBuilder::new(
            ComponentId::new("message_bus_client_api_gateway"),
            Topic::parse("conversation/user/input/v1").unwrap(),
        )
        .payload("aico.conversation.UserInput", b"hello".to_vec())
        .schema_version(3)
        .correlation_id(Uuid::new_v4())
        .build()
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let env = sample();
        let bytes = BinaryCodec::encode(&env).unwrap();
        let back = BinaryCodec::decode(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn roundtrip_without_optionals() {
        let env = EnvelopeBuilder::new(
            ComponentId::new("message_bus_client_cli"),
            Topic::parse("system/health").unwrap(),
        )
        .payload("aico.system.Health", Vec::new())
        .build();
        let back = BinaryCodec::decode(&BinaryCodec::encode(&env).unwrap()).unwrap();
        assert_eq!(back.correlation_id, None);
        assert_eq!(back.trace_id, None);
        assert_eq!(back, env);
    }

    #[test]
    fn unknown_optional_fields_survive_roundtrip() {
        let mut env = sample();
        env.extensions.push(ExtensionField {
            tag: 0x55,
            bytes: b"future-metadata".to_vec(),
        });
        let bytes = BinaryCodec::encode(&env).unwrap();
        let back = BinaryCodec::decode(&bytes).unwrap();
        assert_eq!(back.extensions.len(), 1);
        assert_eq!(back.extensions[0].tag, 0x55);
        assert_eq!(back.extensions[0].bytes, b"future-metadata");
        // A second hop re-emits the field untouched.
        let second = BinaryCodec::decode(&BinaryCodec::encode(&back).unwrap()).unwrap();
        assert_eq!(second, back);
    }

    #[test]
    fn unknown_required_tag_is_rejected() {
        let env = sample();
        let mut bytes = BinaryCodec::encode(&env).unwrap();
        // Append a field with an unused required-range tag.
        bytes.push(0x1f);
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"xx");
        let err = BinaryCodec::decode(&bytes).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownRequiredField { tag: 0x1f }));
    }

    #[test]
    fn missing_message_id_is_rejected() {
        // Build a record by hand with everything except message_id.
        let env = sample();
        let full = BinaryCodec::encode(&env).unwrap();
        let mut bytes = full[..6].to_vec();
        let mut cursor = &full[6..];
        while !cursor.is_empty() {
            let tag = cursor[0];
            let len =
                u32::from_be_bytes([cursor[1], cursor[2], cursor[3], cursor[4]]) as usize;
            let field_end = 5 + len;
            if tag != 0x01 {
                bytes.extend_from_slice(&cursor[..field_end]);
            }
            cursor = &cursor[field_end..];
        }
        let err = BinaryCodec::decode(&bytes).unwrap_err();
        assert!(matches!(err, SchemaError::MissingField { field: "message_id" }));
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let env = sample();
        let mut bytes = BinaryCodec::encode(&env).unwrap();
        // Duplicate the schema_version field at the end.
        bytes.push(0x05);
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&7u32.to_be_bytes());
        let err = BinaryCodec::decode(&bytes).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { field: "schema_version" }));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let env = sample();
        let bytes = BinaryCodec::encode(&env).unwrap();
        let err = BinaryCodec::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, SchemaError::Truncated));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let env = sample();
        let mut bytes = BinaryCodec::encode(&env).unwrap();
        bytes[0] = b'X';
        assert!(matches!(BinaryCodec::decode(&bytes).unwrap_err(), SchemaError::BadMagic));
    }

    #[test]
    fn non_canonical_topic_on_wire_is_rejected() {
        let env = sample();
        let bytes = BinaryCodec::encode(&env).unwrap();
        // Uppercase one letter inside the topic field's bytes.
        let needle = b"conversation/user/input/v1";
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        let mut tampered = bytes.clone();
        tampered[pos] = b'C';
        let err = BinaryCodec::decode(&tampered).unwrap_err();
        assert!(matches!(err, SchemaError::Topic(_)));
    }

    #[test]
    fn oversized_envelope_is_rejected_before_encode_completes() {
        let mut env = sample();
        env.payload = vec![0u8; MAX_ENVELOPE_BYTES];
        let err = BinaryCodec::encode(&env).unwrap_err();
        assert!(matches!(err, SchemaError::TooLarge { .. }));
        assert_eq!(err.reason(), "too_large");
    }

    #[test]
    fn peek_topic_matches_full_decode() {
        let env = sample();
        let bytes = BinaryCodec::encode(&env).unwrap();
        assert_eq!(BinaryCodec::peek_topic(&bytes).unwrap(), env.topic);
    }

    proptest! {
        #[test]
        fn roundtrip_holds_for_arbitrary_envelopes(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            schema_version in 0u32..1000,
            ts in 0u64..4_102_444_800_000,
            with_corr in any::<bool>(),
            with_trace in any::<bool>(),
            ext_bytes in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut env = EnvelopeBuilder::new(
                ComponentId::new("message_bus_client_backend_modules"),
                Topic::parse("learning/progress/v1").unwrap(),
            )
            .payload("aico.learning.Progress", payload)
            .schema_version(schema_version)
            .build();
            env.timestamp_utc_ms = ts;
            if with_corr {
                env.correlation_id = Some(Uuid::new_v4());
            }
            if with_trace {
                env.trace_id = Some(Uuid::new_v4());
            }
            env.extensions.push(ExtensionField { tag: 0x60, bytes: ext_bytes });
            let back = BinaryCodec::decode(&BinaryCodec::encode(&env).unwrap()).unwrap();
            prop_assert_eq!(back, env);
        }
    }
}

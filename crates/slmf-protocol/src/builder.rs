// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fluent construction of [`Envelope`]s.

use crate::Envelope;
use chrono::Utc;
use slmf_core::{ComponentId, Topic};
use uuid::Uuid;

/// Builder for [`Envelope`].
///
/// Fills in a fresh v4 `message_id` and the current UTC time; everything
/// else comes from the caller. The payload defaults to empty bytes with an
/// empty type url, which is only appropriate for signal-style messages.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    source: ComponentId,
    topic: Topic,
    schema_version: u32,
    payload_type_url: String,
    payload: Vec<u8>,
    correlation_id: Option<Uuid>,
    trace_id: Option<Uuid>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from `source` on `topic`.
    #[must_use]
    pub fn new(source: ComponentId, topic: Topic) -> Self {
        Self {
            source,
            topic,
            schema_version: 1,
            payload_type_url: String::new(),
            payload: Vec::new(),
            correlation_id: None,
            trace_id: None,
        }
    }

    /// Set the payload bytes and their schema identifier.
    #[must_use]
    pub fn payload(mut self, type_url: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.payload_type_url = type_url.into();
        self.payload = bytes;
        self
    }

    /// Set the payload schema version (defaults to 1).
    #[must_use]
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Link this envelope to a request.
    #[must_use]
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Attach an end-to-end trace id.
    #[must_use]
    pub fn trace_id(mut self, id: Uuid) -> Self {
        self.trace_id = Some(id);
        self
    }

    /// Finalize with a fresh `message_id` and the current timestamp.
    #[must_use]
    pub fn build(self) -> Envelope {
        Envelope {
            message_id: Uuid::new_v4(),
            timestamp_utc_ms: Utc::now().timestamp_millis().max(0) as u64,
            source: self.source,
            topic: self.topic,
            schema_version: self.schema_version,
            payload_type_url: self.payload_type_url,
            payload: self.payload,
            correlation_id: self.correlation_id,
            trace_id: self.trace_id,
            extensions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(
            ComponentId::new("message_bus_client_modelservice"),
            Topic::parse("modelservice/chat/response/v1").unwrap(),
        )
    }

    #[test]
    fn build_generates_unique_message_ids() {
        let a = builder().build();
        let b = builder().build();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn defaults_are_signal_shaped() {
        let env = builder().build();
        assert_eq!(env.schema_version, 1);
        assert!(env.payload.is_empty());
        assert!(env.payload_type_url.is_empty());
        assert!(env.correlation_id.is_none());
        assert!(env.trace_id.is_none());
        assert!(env.extensions.is_empty());
    }

    #[test]
    fn correlation_and_trace_are_carried() {
        let corr = Uuid::new_v4();
        let trace = Uuid::new_v4();
        let env = builder().correlation_id(corr).trace_id(trace).build();
        assert_eq!(env.correlation_id, Some(corr));
        assert_eq!(env.trace_id, Some(trace));
    }
}

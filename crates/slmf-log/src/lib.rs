// SPDX-License-Identifier: MIT OR Apache-2.0
//! Logs as fabric messages.
//!
//! Log records are ordinary envelopes on `logs/<origin>/<module>` topics
//! with a typed JSON payload; the log consumer subscribes like any other
//! component. Two hazards shape this module:
//!
//! - the transport write path must never emit a log record of its own, or
//!   a single log line could recurse without bound. A task-local sentinel
//!   ([`transport_write_scope`]) closes that loop: records emitted under
//!   the sentinel go to `tracing` only.
//! - during startup the client runtime does not exist yet, so the pipeline
//!   falls back to direct writes into the encrypted event store until a
//!   sink is installed.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod guard;
mod record;

pub use guard::{in_transport_write, transport_write_scope, transport_write_scope_sync};
pub use record::{LogLevel, LogRecord};

use slmf_core::{ComponentId, Topic, TopicError};
use slmf_protocol::{Envelope, EnvelopeBuilder};
use slmf_store::EventStore;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Payload schema identifier for log records.
pub const LOG_PAYLOAD_TYPE: &str = "aico.logs.Record";

/// Build the canonical topic for a log record.
///
/// # Errors
///
/// Returns a [`TopicError`] when origin or module segments are not
/// canonical.
pub fn log_topic(origin: &str, module: &str) -> Result<Topic, TopicError> {
    slmf_core::canonicalize(&format!("logs/{origin}/{module}"))
}

/// Decode a log record out of an envelope, if it carries one.
#[must_use]
pub fn record_from_envelope(envelope: &Envelope) -> Option<LogRecord> {
    if envelope.payload_type_url != LOG_PAYLOAD_TYPE {
        return None;
    }
    serde_json::from_slice(&envelope.payload).ok()
}

/// Persistence probe for the store policy: keep WARNING and above.
#[must_use]
pub fn warning_or_above(envelope: &Envelope) -> bool {
    record_from_envelope(envelope)
        .map(|r| r.level >= LogLevel::Warning)
        .unwrap_or(false)
}

/// Where finished log envelopes go once the client runtime is up.
pub type EnvelopeSink = Arc<dyn Fn(Envelope) + Send + Sync>;

/// The per-component log pipeline.
///
/// Cheap to share; every collaborator in a process holds the same
/// `Arc<LogPipeline>`.
pub struct LogPipeline {
    source: ComponentId,
    origin: String,
    sink: RwLock<Option<EnvelopeSink>>,
    fallback: RwLock<Option<EventStore>>,
}

impl LogPipeline {
    /// Create a pipeline for `source`, publishing under `logs/<origin>/…`.
    #[must_use]
    pub fn new(source: ComponentId, origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            source,
            origin: origin.into(),
            sink: RwLock::new(None),
            fallback: RwLock::new(None),
        })
    }

    /// Install the fabric sink. Called once the client runtime is
    /// connected; from then on records flow as messages.
    pub fn install_sink(&self, sink: EnvelopeSink) {
        *self.sink.write().expect("log sink lock poisoned") = Some(sink);
    }

    /// Install the direct-store fallback used before the sink exists.
    pub fn install_fallback(&self, store: EventStore) {
        *self.fallback.write().expect("log fallback lock poisoned") = Some(store);
    }

    /// Emit a record under `logs/<origin>/<module>`.
    ///
    /// Inside a transport write (the recursion hazard) the record is
    /// bridged to `tracing` only and never becomes a message. A record
    /// whose module produces a non-canonical topic is likewise diverted
    /// rather than dropped silently.
    pub fn emit(&self, module: &str, record: LogRecord) {
        record.bridge_to_tracing(&self.origin, module);

        if in_transport_write() {
            return;
        }

        let topic = match log_topic(&self.origin, module) {
            Ok(t) => t,
            Err(err) => {
                warn!(target: "slmf::log", %err, module, "log record topic not canonical");
                return;
            }
        };
        let payload = match serde_json::to_vec(&record) {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "slmf::log", %err, "log record serialization failed");
                return;
            }
        };
        let envelope = EnvelopeBuilder::new(self.source.clone(), topic)
            .payload(LOG_PAYLOAD_TYPE, payload)
            .build();

        if let Some(sink) = self.sink.read().expect("log sink lock poisoned").as_ref() {
            sink(envelope);
            return;
        }

        // Startup path: the client runtime is not up yet.
        let fallback = self
            .fallback
            .read()
            .expect("log fallback lock poisoned")
            .clone();
        if let Some(store) = fallback {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = store.append_envelope(&envelope).await {
                        warn!(target: "slmf::log", %err, "fallback log write failed");
                    }
                });
            }
        }
    }

    /// Convenience: emit a simple message at a level.
    pub fn log(&self, level: LogLevel, module: &str, message: impl Into<String>) {
        self.emit(module, LogRecord::new(level, module, "", message));
    }
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeline")
            .field("source", &self.source)
            .field("origin", &self.origin)
            .finish()
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! The typed log record payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity, ordered. `Security` outranks everything and is always
/// persisted by the standard store policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    /// Developer chatter.
    Debug,
    /// Normal operation.
    Info,
    /// Something odd that the system survived.
    Warning,
    /// An operation failed.
    Error,
    /// Authentication and authorization events.
    Security,
}

impl LogLevel {
    /// Stable wire string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Security => "SECURITY",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log record. No free-form serialization: this struct is
/// the only shape log payloads take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Logical module that produced the record.
    pub module: String,
    /// Function name, possibly empty.
    pub function: String,
    /// Source file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Source line, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl LogRecord {
    /// Create a record with the required fields.
    pub fn new(
        level: LogLevel,
        module: impl Into<String>,
        function: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            module: module.into(),
            function: function.into(),
            file: None,
            line: None,
            message: message.into(),
            extra: None,
        }
    }

    /// Attach a source location.
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Attach structured context.
    #[must_use]
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Mirror this record into the process-local `tracing` subscriber.
    ///
    /// This path has no fabric dependency at all, which is what makes it
    /// safe to use inside the transport write path.
    pub fn bridge_to_tracing(&self, origin: &str, module: &str) {
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(target: "slmf::fabric", origin, module, "{}", self.message);
            }
            LogLevel::Info => {
                tracing::info!(target: "slmf::fabric", origin, module, "{}", self.message);
            }
            LogLevel::Warning => {
                tracing::warn!(target: "slmf::fabric", origin, module, "{}", self.message);
            }
            LogLevel::Error | LogLevel::Security => {
                tracing::error!(target: "slmf::fabric", origin, module, level = %self.level, "{}", self.message);
            }
        }
    }
}
